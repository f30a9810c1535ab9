//! Notification policy — channel gating and quiet hours.
//!
//! Every outbound customer/driver message flows through here. The
//! policy consults channel enablement and the quiet-hours window;
//! routine messages inside the window are deferred and re-emitted by
//! the scheduler once the window closes. Critical messages (breach
//! compensation, emergency escalation) always pass.

use crate::clock::Clock;
use crate::config::{ChannelsConfig, QuietHours};
use crate::error::CoreResult;
use crate::ports::Notifier;
use chrono::Timelike;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Routine,
    Critical,
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Sms { phone: String, message: String },
    Email { to: String, subject: String, body: String },
    InApp { user_id: String, payload: serde_json::Value },
    Voice { phone: String, message: String },
}

impl Outbound {
    fn enabled(&self, channels: &ChannelsConfig) -> bool {
        match self {
            Self::Sms { .. } => channels.sms,
            Self::Email { .. } => channels.email,
            Self::InApp { .. } => channels.in_app,
            Self::Voice { .. } => channels.voice,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Deferred,
    ChannelDisabled,
}

pub struct NotificationPolicy {
    notifier: Arc<dyn Notifier>,
    channels: ChannelsConfig,
    quiet:    QuietHours,
    clock:    Arc<dyn Clock>,
    deferred: Mutex<Vec<Outbound>>,
}

impl NotificationPolicy {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        channels: ChannelsConfig,
        quiet: QuietHours,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { notifier, channels, quiet, clock, deferred: Mutex::new(Vec::new()) }
    }

    pub async fn send(&self, urgency: Urgency, outbound: Outbound) -> CoreResult<NotifyOutcome> {
        if !outbound.enabled(&self.channels) {
            log::debug!("notification dropped: channel disabled");
            return Ok(NotifyOutcome::ChannelDisabled);
        }

        let hour = self.clock.now().hour();
        if urgency == Urgency::Routine && self.quiet.covers(hour) {
            self.deferred.lock().unwrap_or_else(|e| e.into_inner()).push(outbound);
            log::debug!("notification deferred: quiet hours (hour={hour})");
            return Ok(NotifyOutcome::Deferred);
        }

        self.dispatch(&outbound).await?;
        Ok(NotifyOutcome::Sent)
    }

    /// Re-emit deferred notifications. No-op while quiet hours are still
    /// in effect. Returns how many were sent.
    pub async fn drain_deferred(&self) -> CoreResult<usize> {
        if self.quiet.covers(self.clock.now().hour()) {
            return Ok(0);
        }
        let pending: Vec<Outbound> = {
            let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
            deferred.drain(..).collect()
        };
        let count = pending.len();
        for outbound in pending {
            self.dispatch(&outbound).await?;
        }
        if count > 0 {
            log::info!("drained {count} deferred notifications");
        }
        Ok(count)
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn dispatch(&self, outbound: &Outbound) -> CoreResult<()> {
        match outbound {
            Outbound::Sms { phone, message } => self.notifier.sms(phone, message).await,
            Outbound::Email { to, subject, body } => self.notifier.email(to, subject, body).await,
            Outbound::InApp { user_id, payload } => {
                self.notifier.in_app(user_id, payload.clone()).await
            }
            Outbound::Voice { phone, message } => self.notifier.voice(phone, message).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::RecordingNotifier;
    use chrono::{TimeZone, Utc};

    fn policy_at_hour(hour: u32) -> (Arc<RecordingNotifier>, NotificationPolicy) {
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap(),
        ));
        let policy = NotificationPolicy::new(
            notifier.clone(),
            ChannelsConfig::default(),
            QuietHours { start: 22, end: 7 },
            clock,
        );
        (notifier, policy)
    }

    #[tokio::test]
    async fn routine_messages_defer_in_quiet_hours() {
        let (notifier, policy) = policy_at_hour(23);
        let outcome = policy
            .send(
                Urgency::Routine,
                Outbound::Sms { phone: "+9665".into(), message: "on the way".into() },
            )
            .await
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Deferred);
        assert!(notifier.sent().is_empty());
        assert_eq!(policy.deferred_count(), 1);
    }

    #[tokio::test]
    async fn critical_messages_always_pass() {
        let (notifier, policy) = policy_at_hour(23);
        let outcome = policy
            .send(
                Urgency::Critical,
                Outbound::Sms { phone: "+9665".into(), message: "compensation issued".into() },
            )
            .await
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Sent);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn disabled_channel_drops() {
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let policy = NotificationPolicy::new(
            notifier.clone(),
            ChannelsConfig { voice: false, ..ChannelsConfig::default() },
            QuietHours::default(),
            clock,
        );
        let outcome = policy
            .send(
                Urgency::Critical,
                Outbound::Voice { phone: "+9665".into(), message: "hello".into() },
            )
            .await
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::ChannelDisabled);
        assert!(notifier.sent().is_empty());
    }
}
