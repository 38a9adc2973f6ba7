//! Reconnection supervisor: one task per mounted channel that serializes
//! every (re)connect attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::Inner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Backstop tick that retries while disconnected.
    pub health_check: Duration,
    /// Poll step of a `send()` waiting for the connection.
    pub send_poll: Duration,
    /// Upper bound of that wait before the message stays queued.
    pub send_wait: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            health_check: Duration::from_secs(15),
            send_poll: Duration::from_millis(200),
            send_wait: Duration::from_secs(3),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    /// Keeps the backoff cap at or below the health-check interval so the
    /// periodic tick can always retry, and keeps intervals non-zero.
    pub fn normalized(mut self) -> Self {
        let floor = Duration::from_millis(1);
        self.health_check = self.health_check.max(floor);
        self.send_poll = self.send_poll.max(floor);
        self.backoff_max = self.backoff_max.min(self.health_check);
        self.backoff_initial = self.backoff_initial.min(self.backoff_max);
        self
    }
}

/// Exponential delay between failed attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to hold off.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Mount,
    VisibilityRegained,
    HealthCheck,
    SendWhileDisconnected,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Mount => "mount",
            Trigger::VisibilityRegained => "visibility",
            Trigger::HealthCheck => "health_check",
            Trigger::SendWhileDisconnected => "send",
        }
    }

    // Explicit user-facing events retry right away.
    fn respects_backoff(&self) -> bool {
        matches!(self, Trigger::HealthCheck | Trigger::SendWhileDisconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Visibility of the owning view, shared by every channel it mounts.
#[derive(Debug, Clone)]
pub struct VisibilitySignal {
    tx: Arc<watch::Sender<Visibility>>,
}

impl Default for VisibilitySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl VisibilitySignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Visibility::Visible);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, visibility: Visibility) {
        self.tx.send_if_modified(|current| {
            if *current == visibility {
                false
            } else {
                *current = visibility;
                true
            }
        });
    }

    pub fn get(&self) -> Visibility {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Visibility> {
        self.tx.subscribe()
    }
}

pub(super) async fn supervise(
    inner: Arc<Inner>,
    generation: u64,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    visibility: watch::Receiver<Visibility>,
) {
    let policy = inner.policy.clone();
    let mut backoff = Backoff::new(policy.backoff_initial, policy.backoff_max);
    let mut hold_until: Option<Instant> = None;
    let mut visibility = Some(visibility);
    let mut health =
        tokio::time::interval_at(Instant::now() + policy.health_check, policy.health_check);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            next = triggers.recv() => match next {
                Some(trigger) => trigger,
                None => break,
            },
            _ = health.tick() => Trigger::HealthCheck,
            changed = async {
                match visibility.as_mut() {
                    Some(rx) => rx.changed().await.map(|_| *rx.borrow_and_update()),
                    None => std::future::pending().await,
                }
            } => match changed {
                Ok(Visibility::Visible) => Trigger::VisibilityRegained,
                Ok(Visibility::Hidden) => continue,
                Err(_) => {
                    visibility = None;
                    continue;
                }
            },
        };

        if inner.is_stale(generation) {
            break;
        }
        if inner.is_connected() {
            continue;
        }
        if trigger.respects_backoff() {
            if let Some(until) = hold_until {
                if Instant::now() < until {
                    debug!(
                        target = "council.channel",
                        purpose = %inner.spec.purpose,
                        trigger = trigger.as_str(),
                        "reconnect held by backoff"
                    );
                    continue;
                }
            }
        }

        if inner.connect_once(generation, trigger).await {
            backoff.reset();
            hold_until = None;
        } else {
            if inner.is_stale(generation) {
                break;
            }
            let delay = backoff.next_delay();
            hold_until = Some(Instant::now() + delay);
            debug!(
                target = "council.channel",
                purpose = %inner.spec.purpose,
                failures = backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                "reconnect attempt failed"
            );
        }
    }
}
