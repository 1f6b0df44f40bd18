//! Post-release drift monitoring.
//!
//! After a successful release the restored roles stay under watch for a
//! bounded window. Anything that strips them again (a partner integration
//! reacting late, a platform hiccup) is re-applied on the next tick. Roles
//! still missing when the window closes mark the release as failed.
//!
//! Monitors are registered per user and are cancelled when the user leaves,
//! re-joins, or is released again.

use super::events::{EventKind, GateEvent, Notifier};
use super::state::GateState;
use crate::platform::{
    is_platform_error_retryable, retry_with_backoff, GuildId, PlatformClient, PlatformError,
    RetryPolicy, RoleSet, UserId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const DRIFT_REASON: &str = "Verification roles re-applied after drift";

/// How a drift watch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftOutcome {
    /// Every restored role was present when the window closed.
    Held,
    /// The user left; nothing left to watch.
    MemberLeft,
    /// Roles still missing at the end of the window.
    StillMissing(RoleSet),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    /// Re-applications that the platform accepted
    pub corrections: u32,
    pub outcome: DriftOutcome,
}

/// One bounded watch over a user's restored roles.
pub struct DriftWatch<P: PlatformClient> {
    pub guild: GuildId,
    pub user: UserId,
    pub roles: RoleSet,
    pub platform: P,
    pub state: Arc<GateState>,
    pub notifier: Arc<dyn Notifier>,
    pub window: Duration,
    pub interval: Duration,
    pub retry: RetryPolicy,
}

impl<P: PlatformClient> DriftWatch<P> {
    /// Poll until the window closes or the user leaves.
    pub async fn run(self) -> DriftReport {
        let deadline = Instant::now() + self.window;
        let mut corrections = 0;

        while Instant::now() < deadline {
            sleep(self.interval).await;

            let live = match self.platform.fetch_live_roles(self.guild, self.user).await {
                Ok(live) => live,
                Err(PlatformError::MemberNotFound(_)) => return self.member_left(corrections),
                Err(err) => {
                    warn!(guild = %self.guild, user = %self.user, "drift check failed: {}", err);
                    continue;
                }
            };

            let missing: RoleSet = self.roles.difference(&live).copied().collect();
            if missing.is_empty() {
                continue;
            }

            warn!(
                guild = %self.guild,
                user = %self.user,
                missing = missing.len(),
                "restored roles drifted, re-applying"
            );
            match retry_with_backoff(
                &self.retry,
                || {
                    self.platform
                        .add_roles(self.guild, self.user, &missing, DRIFT_REASON)
                },
                is_platform_error_retryable,
            )
            .await
            {
                Ok(()) => corrections += 1,
                Err(PlatformError::MemberNotFound(_)) => return self.member_left(corrections),
                Err(err) => {
                    warn!(guild = %self.guild, user = %self.user, "drift correction failed: {}", err)
                }
            }
        }

        let outcome = match self.platform.fetch_live_roles(self.guild, self.user).await {
            Ok(live) => {
                let missing: RoleSet = self.roles.difference(&live).copied().collect();
                if missing.is_empty() {
                    DriftOutcome::Held
                } else {
                    DriftOutcome::StillMissing(missing)
                }
            }
            Err(PlatformError::MemberNotFound(_)) => DriftOutcome::MemberLeft,
            Err(err) => {
                // Unknown final state; the last observation stands.
                warn!(guild = %self.guild, user = %self.user, "final drift check failed: {}", err);
                DriftOutcome::Held
            }
        };

        if let DriftOutcome::StillMissing(missing) = &outcome {
            self.report_failure(missing.clone()).await;
        } else {
            info!(guild = %self.guild, user = %self.user, corrections, "drift watch finished");
        }

        DriftReport {
            corrections,
            outcome,
        }
    }

    fn member_left(&self, corrections: u32) -> DriftReport {
        debug!(guild = %self.guild, user = %self.user, "member left, ending drift watch");
        DriftReport {
            corrections,
            outcome: DriftOutcome::MemberLeft,
        }
    }

    async fn report_failure(&self, missing: RoleSet) {
        if !self.state.record_failure(self.user) {
            debug!(user = %self.user, "release failure already reported");
            return;
        }
        warn!(
            guild = %self.guild,
            user = %self.user,
            missing = missing.len(),
            "restored roles still missing after drift window"
        );
        let event = GateEvent::new(
            self.user,
            EventKind::ReleaseFailed {
                restored: self.roles.clone(),
                missing,
            },
        );
        if let Err(err) = self.notifier.notify(&event).await {
            warn!(guild = %self.guild, user = %self.user, "notification dropped: {}", err);
        }
    }
}

type MonitorTable = HashMap<UserId, (u64, JoinHandle<()>)>;

/// Registry of running drift watches, at most one per user.
#[derive(Default)]
pub struct DriftMonitors {
    tasks: Arc<Mutex<MonitorTable>>,
    next_generation: AtomicU64,
}

impl DriftMonitors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a watch, replacing any previous one for the same user.
    pub fn start<P: PlatformClient>(&self, watch: DriftWatch<P>) {
        let user = watch.user;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();

        let mut table = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            watch.run().await;
            let mut table = tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if table.get(&user).is_some_and(|(gen, _)| *gen == generation) {
                table.remove(&user);
            }
        });
        if let Some((_, previous)) = table.insert(user, (generation, handle)) {
            previous.abort();
        }
    }

    /// Abort the user's watch. Returns whether one was running.
    pub fn cancel(&self, user: UserId) -> bool {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user);
        match removed {
            Some((_, handle)) => {
                handle.abort();
                debug!(user = %user, "drift watch cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let mut table = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, (_, handle)) in table.drain() {
            handle.abort();
        }
    }

    pub fn is_watching(&self, user: UserId) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }
}
