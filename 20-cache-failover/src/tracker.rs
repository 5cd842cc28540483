//! Per-node health state machine.
//!
//! Every configured node gets a [`ServerIssue`]. Three mechanisms act on it:
//!
//! - **Lock / unlock.** `failures` is a lock budget starting at the
//!   configured baseline. A failure while budget remains locks the node and
//!   schedules one unlock timer after `retry`; the unlock spends one unit of
//!   budget and makes the node eligible again.
//! - **Reconnect cooldown.** The first health failure of an episode
//!   schedules one reconnect timer (bounded backoff) and emits
//!   `reconnecting`. A failed node with no lock budget left stays
//!   unavailable until that timer fires, which restores the baseline.
//! - **Removal.** With `remove` enabled, more than `retries` consecutive
//!   failures take the node out for good. This counter is separate from the
//!   lock budget and only resets on a successful request.
//!
//! Timers are spawned tasks that post a [`TimerFired`] back into the
//! dispatcher loop, so every state change still happens on that loop. Each
//! timer carries an id; a firing that no longer matches the stored timer is
//! stale and ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::{ClientConfig, ServerId, ServerSpec};
use crate::error::CacheError;
use crate::events::{EventBus, HealthEvent, IssueDetails};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Unlock,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub server: ServerId,
    pub kind: TimerKind,
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Locked or cooling down; try again later.
    Unavailable,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The failure locked the node.
    Locked,
    /// The node is marked failed; no new lock was taken.
    Failed,
    Removed,
}

/// Read-only view of a node's issue state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueSnapshot {
    pub server: ServerId,
    pub failures: u32,
    /// Configured lock budget that reconnects restore.
    pub baseline: u32,
    pub locked: bool,
    pub failed: bool,
    pub removed: bool,
    pub consecutive_failures: u32,
    pub reconnect_scheduled: bool,
    pub unlock_deadline: Option<Instant>,
}

struct Timer {
    id: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

impl Timer {
    fn cancel(self) {
        self.handle.abort();
    }
}

pub struct ServerIssue {
    baseline: u32,
    failures: u32,
    locked: bool,
    failed: bool,
    removed: bool,
    consecutive_failures: u32,
    reconnect_episodes: u32,
    awaiting_reconnect: bool,
    unlock: Option<Timer>,
    reconnect: Option<Timer>,
}

impl ServerIssue {
    fn new(baseline: u32) -> Self {
        Self {
            baseline,
            failures: baseline,
            locked: false,
            failed: false,
            removed: false,
            consecutive_failures: 0,
            reconnect_episodes: 0,
            awaiting_reconnect: false,
            unlock: None,
            reconnect: None,
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.unlock.take() {
            timer.cancel();
        }
        if let Some(timer) = self.reconnect.take() {
            timer.cancel();
        }
    }

    fn pending_timers(&self) -> usize {
        usize::from(self.unlock.is_some()) + usize::from(self.reconnect.is_some())
    }

    fn snapshot(&self, server: &str) -> IssueSnapshot {
        IssueSnapshot {
            server: server.to_string(),
            failures: self.failures,
            baseline: self.baseline,
            locked: self.locked,
            failed: self.failed,
            removed: self.removed,
            consecutive_failures: self.consecutive_failures,
            reconnect_scheduled: self.reconnect.is_some(),
            unlock_deadline: self.unlock.as_ref().map(|timer| timer.deadline),
        }
    }
}

pub struct FailureTracker {
    issues: HashMap<ServerId, ServerIssue>,
    retries: u32,
    remove: bool,
    retry: Duration,
    backoff: Backoff,
    events: EventBus,
    timers: mpsc::UnboundedSender<TimerFired>,
    next_timer: u64,
}

impl FailureTracker {
    pub fn new(
        servers: &[ServerSpec],
        config: &ClientConfig,
        events: EventBus,
        timers: mpsc::UnboundedSender<TimerFired>,
    ) -> Self {
        let issues = servers
            .iter()
            .map(|spec| (spec.addr.clone(), ServerIssue::new(config.failures)))
            .collect();
        Self {
            issues,
            retries: config.retries,
            remove: config.remove,
            retry: config.retry,
            backoff: Backoff::from_config(config),
            events,
            timers,
            next_timer: 0,
        }
    }

    /// Decides whether a request may be sent to `server`. Never changes state.
    pub fn admit(&self, server: &str) -> Admission {
        match self.issues.get(server) {
            None => Admission::Removed,
            Some(issue) if issue.removed => Admission::Removed,
            Some(issue) if issue.failed => Admission::Unavailable,
            Some(_) => Admission::Admit,
        }
    }

    pub fn record_failure(&mut self, server: &str, error: &CacheError) -> FailureOutcome {
        let Self {
            issues,
            retries,
            remove,
            retry,
            backoff,
            events,
            timers,
            next_timer,
        } = self;

        let Some(issue) = issues.get_mut(server) else {
            warn!(server, "failure reported for unknown server");
            return FailureOutcome::Failed;
        };
        if issue.removed {
            return FailureOutcome::Removed;
        }

        issue.failed = true;
        issue.consecutive_failures = issue.consecutive_failures.saturating_add(1);

        if *remove && issue.consecutive_failures > *retries {
            issue.cancel_timers();
            issue.locked = false;
            issue.removed = true;
            warn!(
                server,
                consecutive_failures = issue.consecutive_failures,
                %error,
                "removing server"
            );
            events.emit(HealthEvent::Remove {
                server: server.to_string(),
            });
            return FailureOutcome::Removed;
        }

        let mut outcome = FailureOutcome::Failed;
        if issue.failures > 0 && !issue.locked {
            *next_timer += 1;
            issue.unlock = Some(spawn_timer(
                timers,
                *next_timer,
                server,
                TimerKind::Unlock,
                *retry,
            ));
            issue.locked = true;
            warn!(server, failures = issue.failures, retry = ?*retry, %error, "server locked");
            events.emit(HealthEvent::Issue {
                server: server.to_string(),
                details: IssueDetails {
                    failures: issue.failures,
                    consecutive_failures: issue.consecutive_failures,
                    locked_for: *retry,
                    error: error.to_string(),
                },
            });
            outcome = FailureOutcome::Locked;
        }

        if issue.reconnect.is_none() {
            let delay = backoff.delay(issue.reconnect_episodes);
            *next_timer += 1;
            issue.reconnect = Some(spawn_timer(
                timers,
                *next_timer,
                server,
                TimerKind::Reconnect,
                delay,
            ));
            warn!(server, ?delay, "scheduling reconnect");
            events.emit(HealthEvent::Reconnecting {
                server: server.to_string(),
                delay,
            });
        }

        outcome
    }

    pub fn record_success(&mut self, server: &str) {
        let Some(issue) = self.issues.get_mut(server) else {
            return;
        };
        issue.consecutive_failures = 0;
        if !issue.failed {
            if let Some(timer) = issue.reconnect.take() {
                timer.cancel();
                issue.reconnect_episodes = 0;
                debug!(server, "server answered, reconnect cancelled");
            }
        }
        if issue.awaiting_reconnect {
            issue.awaiting_reconnect = false;
            issue.reconnect_episodes = 0;
            issue.failures = issue.baseline;
            info!(server, "server reconnected");
            self.events.emit(HealthEvent::Reconnected {
                server: server.to_string(),
            });
        }
    }

    pub fn on_timer(&mut self, fired: TimerFired) {
        let Some(issue) = self.issues.get_mut(&fired.server) else {
            return;
        };
        let slot = match fired.kind {
            TimerKind::Unlock => &mut issue.unlock,
            TimerKind::Reconnect => &mut issue.reconnect,
        };
        if slot.as_ref().map(|timer| timer.id) != Some(fired.id) {
            debug!(server = %fired.server, kind = ?fired.kind, "ignoring stale timer");
            return;
        }
        *slot = None;

        match fired.kind {
            TimerKind::Unlock => {
                issue.failures = issue.failures.saturating_sub(1);
                issue.locked = false;
                issue.failed = false;
                info!(server = %fired.server, failures = issue.failures, "server unlocked");
            }
            TimerKind::Reconnect => {
                if let Some(timer) = issue.unlock.take() {
                    timer.cancel();
                }
                issue.failures = issue.baseline;
                issue.locked = false;
                issue.failed = false;
                issue.awaiting_reconnect = true;
                issue.reconnect_episodes = issue.reconnect_episodes.saturating_add(1);
                info!(server = %fired.server, "reconnect cooldown elapsed");
            }
        }
    }

    pub fn snapshot(&self, server: &str) -> Option<IssueSnapshot> {
        self.issues.get(server).map(|issue| issue.snapshot(server))
    }

    pub fn pending_timers(&self) -> usize {
        self.issues.values().map(ServerIssue::pending_timers).sum()
    }

    /// Cancels every outstanding timer. Returns how many were pending.
    pub fn shutdown(&mut self) -> usize {
        let pending = self.pending_timers();
        for issue in self.issues.values_mut() {
            issue.cancel_timers();
        }
        pending
    }
}

fn spawn_timer(
    timers: &mpsc::UnboundedSender<TimerFired>,
    id: u64,
    server: &str,
    kind: TimerKind,
    delay: Duration,
) -> Timer {
    let fired = TimerFired {
        server: server.to_string(),
        kind,
        id,
    };
    let timers = timers.clone();
    let handle = tokio::spawn(async move {
        time::sleep(delay).await;
        let _ = timers.send(fired);
    });
    Timer {
        id,
        deadline: Instant::now() + delay,
        handle,
    }
}
