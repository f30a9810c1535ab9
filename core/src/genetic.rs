//! Genetic TSP over order visit sequences — STANDARD route planning.
//!
//! Chromosome = a permutation of order indices; the tour visits each
//! order's pickup then delivery in chromosome order. Fitness is
//! 1/(1+distance). Selection is elitism plus tournament-3, crossover is
//! order-crossover (OX), mutation is a single swap. Iteration is
//! cooperative: cancellation is checked every generation and the best
//! tour so far is returned.

use crate::config::GeneticParams;
use crate::geo::haversine_km;
use crate::rng::CoreRng;
use crate::types::Location;
use tokio_util::sync::CancellationToken;

/// One order's pickup/delivery pair.
#[derive(Debug, Clone, Copy)]
pub struct VisitPair {
    pub pickup:   Location,
    pub delivery: Location,
}

/// Tour distance: start → p0 → d0 → p1 → d1 → …
pub fn tour_distance(start: Location, pairs: &[VisitPair], sequence: &[usize]) -> f64 {
    let mut at = start;
    let mut total = 0.0;
    for &i in sequence {
        let pair = pairs[i];
        total += haversine_km(at, pair.pickup);
        total += haversine_km(pair.pickup, pair.delivery);
        at = pair.delivery;
    }
    total
}

fn fitness(start: Location, pairs: &[VisitPair], sequence: &[usize]) -> f64 {
    1.0 / (1.0 + tour_distance(start, pairs, sequence))
}

/// Evolve a visit sequence for the given pairs. Deterministic for the
/// same `params.seed` and input.
pub fn evolve(
    start: Location,
    pairs: &[VisitPair],
    params: &GeneticParams,
    cancel: &CancellationToken,
) -> Vec<usize> {
    let n = pairs.len();
    if n <= 1 {
        return (0..n).collect();
    }

    let mut rng = CoreRng::from_seed(params.seed);
    let pop_size = params.population.max(2);

    // Seed the population with the identity tour plus shuffles.
    let mut population: Vec<Vec<usize>> = Vec::with_capacity(pop_size);
    population.push((0..n).collect());
    while population.len() < pop_size {
        let mut tour: Vec<usize> = (0..n).collect();
        rng.shuffle(&mut tour);
        population.push(tour);
    }

    for generation in 0..params.generations {
        if cancel.is_cancelled() {
            log::debug!("genetic search cancelled at generation {generation}");
            break;
        }

        // Rank by fitness, best first.
        population.sort_by(|a, b| {
            fitness(start, pairs, b).total_cmp(&fitness(start, pairs, a))
        });

        let mut next: Vec<Vec<usize>> = Vec::with_capacity(pop_size);
        next.extend(population.iter().take(params.elitism.min(pop_size)).cloned());

        while next.len() < pop_size {
            let parent_a = tournament(&population, start, pairs, &mut rng);
            let parent_b = tournament(&population, start, pairs, &mut rng);
            let mut child = if rng.chance(params.crossover) {
                order_crossover(parent_a, parent_b, &mut rng)
            } else {
                parent_a.clone()
            };
            if rng.chance(params.mutation) {
                swap_mutate(&mut child, &mut rng);
            }
            next.push(child);
        }
        population = next;
    }

    population
        .into_iter()
        .min_by(|a, b| {
            tour_distance(start, pairs, a).total_cmp(&tour_distance(start, pairs, b))
        })
        .unwrap_or_else(|| (0..n).collect())
}

/// Tournament-3 selection.
fn tournament<'a>(
    population: &'a [Vec<usize>],
    start: Location,
    pairs: &[VisitPair],
    rng: &mut CoreRng,
) -> &'a Vec<usize> {
    let mut best: Option<&Vec<usize>> = None;
    for _ in 0..3 {
        let candidate = &population[rng.below(population.len())];
        best = match best {
            Some(current)
                if tour_distance(start, pairs, current)
                    <= tour_distance(start, pairs, candidate) =>
            {
                Some(current)
            }
            _ => Some(candidate),
        };
    }
    best.unwrap_or(&population[0])
}

/// Order crossover (OX): keep a random slice of parent A, fill the rest
/// in parent B's order.
fn order_crossover(a: &[usize], b: &[usize], rng: &mut CoreRng) -> Vec<usize> {
    let n = a.len();
    let (mut lo, mut hi) = (rng.below(n), rng.below(n));
    if lo > hi {
        std::mem::swap(&mut lo, &mut hi);
    }

    let mut child = vec![usize::MAX; n];
    child[lo..=hi].copy_from_slice(&a[lo..=hi]);

    let filled = child[lo..=hi].to_vec();
    let mut fill = b.iter().filter(|gene| !filled.contains(*gene));
    for slot in child.iter_mut() {
        if *slot == usize::MAX {
            if let Some(&gene) = fill.next() {
                *slot = gene;
            }
        }
    }
    child
}

fn swap_mutate(tour: &mut [usize], rng: &mut CoreRng) {
    if tour.len() < 2 {
        return;
    }
    let i = rng.below(tour.len());
    let j = rng.below(tour.len());
    tour.swap(i, j);
}
