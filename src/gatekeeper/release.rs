//! Release workflow: restore held entitlements once the user verifies.
//!
//! A release runs as one transaction guarded by a [`ReleaseTicket`]. The
//! ticket puts the user in the verifying set so the interference guard stands
//! down, and on drop (success, failure, error or cancellation) removes every
//! tracking entry for the user.
//!
//! ```text
//! Idle -> Verifying -> Restoring -> Confirming -> Verified | Failed -> Idle
//! ```

use super::events::EventKind;
use super::gate::{Gate, GateError};
use super::monitor::DriftWatch;
use super::state::ReleaseTicket;
use crate::platform::{
    is_platform_error_retryable, retry_with_backoff, PlatformClient, PlatformError, Role, RoleSet,
    UserId,
};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const RELEASE_REASON: &str = "Subscription verification completed";

/// Result of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The user had nothing held (untracked, or every held role was deleted).
    NothingToRestore,
    /// Every restored role was confirmed present.
    Restored { roles: Vec<Role> },
    /// Confirmation retries exhausted.
    Failed {
        restored: RoleSet,
        missing: RoleSet,
    },
    /// The user left mid-release.
    Departed,
}

impl ReleaseOutcome {
    /// Roles confirmed back on the user.
    pub fn restored_roles(&self) -> RoleSet {
        match self {
            ReleaseOutcome::Restored { roles } => roles.iter().map(|role| role.id).collect(),
            ReleaseOutcome::Failed { restored, missing } => {
                restored.difference(missing).copied().collect()
            }
            ReleaseOutcome::NothingToRestore | ReleaseOutcome::Departed => RoleSet::new(),
        }
    }
}

enum Confirmation {
    Confirmed,
    Missing(RoleSet),
    Departed,
}

impl<P: PlatformClient> Gate<P> {
    /// Restore the user's held entitlements after verification.
    ///
    /// Releasing an untracked user is not an error and yields
    /// [`ReleaseOutcome::NothingToRestore`]. Errors are returned only after
    /// the user's tracking has been cleaned up.
    pub async fn release(&self, user: UserId) -> Result<ReleaseOutcome, GateError> {
        let result = {
            let _lock = self.state.lock_user(user).await;
            let _ticket = ReleaseTicket::open(&self.state, user);
            self.run_release(user).await
        };

        if let Err(err) = &result {
            error!(guild = %self.guild, user = %user, "release aborted: {}", err);
        }
        result
    }

    async fn run_release(&self, user: UserId) -> Result<ReleaseOutcome, GateError> {
        sleep(self.timing.release_debounce).await;

        let Some(held) = self.state.held_roles(user) else {
            debug!(guild = %self.guild, user = %user, "release requested with nothing held");
            return Ok(ReleaseOutcome::NothingToRestore);
        };

        let roles = self.resolve_held(user, &held).await?;
        self.state.lift_suppression(user);

        if roles.is_empty() {
            warn!(guild = %self.guild, user = %user, "no held role still exists, nothing restored");
            return Ok(ReleaseOutcome::NothingToRestore);
        }

        let mut ids: RoleSet = roles.iter().map(|role| role.id).collect();
        let confirmation = self.apply_and_confirm(user, &mut ids).await?;
        // Roles deleted while restoring were dropped from `ids`.
        let roles: Vec<Role> = roles
            .into_iter()
            .filter(|role| ids.contains(&role.id))
            .collect();
        if roles.is_empty() && !matches!(confirmation, Confirmation::Departed) {
            warn!(guild = %self.guild, user = %user, "every held role was deleted while restoring");
            return Ok(ReleaseOutcome::NothingToRestore);
        }

        match confirmation {
            Confirmation::Confirmed => {
                let total = self.state.record_success(user);
                info!(
                    guild = %self.guild,
                    user = %user,
                    roles = ids.len(),
                    verified_total = total,
                    "verification completed, entitlements restored"
                );
                self.emit(user, EventKind::ReleaseCompleted { roles: ids.clone() })
                    .await;
                self.watch_for_drift(user, ids);
                Ok(ReleaseOutcome::Restored { roles })
            }
            Confirmation::Missing(missing) => {
                error!(
                    guild = %self.guild,
                    user = %user,
                    missing = missing.len(),
                    "restored roles not confirmed after retries"
                );
                if self.state.record_failure(user) {
                    self.emit(
                        user,
                        EventKind::ReleaseFailed {
                            restored: ids.clone(),
                            missing: missing.clone(),
                        },
                    )
                    .await;
                }
                Ok(ReleaseOutcome::Failed {
                    restored: ids,
                    missing,
                })
            }
            Confirmation::Departed => {
                info!(guild = %self.guild, user = %user, "left during release");
                Ok(ReleaseOutcome::Departed)
            }
        }
    }

    /// Look up every held role. Deleted roles are dropped; a role that could
    /// not be looked up is kept and left to the platform to accept or refuse.
    async fn resolve_held(&self, user: UserId, held: &RoleSet) -> Result<Vec<Role>, GateError> {
        let policy = self.timing.retry_policy();
        let mut roles = Vec::with_capacity(held.len());

        for &id in held {
            let lookup = retry_with_backoff(
                &policy,
                || self.platform.resolve_role(self.guild, id),
                is_platform_error_retryable,
            )
            .await;
            match lookup {
                Ok(Some(role)) => roles.push(role),
                Ok(None) => {
                    warn!(guild = %self.guild, user = %user, role = %id, "held role no longer exists, dropping")
                }
                Err(err @ PlatformError::Permission(_)) => return Err(err.into()),
                Err(err) => {
                    warn!(guild = %self.guild, user = %user, role = %id, "role lookup failed: {}", err);
                    roles.push(Role {
                        id,
                        name: id.to_string(),
                    });
                }
            }
        }

        Ok(roles)
    }

    async fn apply_and_confirm(
        &self,
        user: UserId,
        roles: &mut RoleSet,
    ) -> Result<Confirmation, GateError> {
        let attempts = self.timing.confirm_attempts.max(1);

        if !self.apply(user, roles).await? {
            return Ok(Confirmation::Departed);
        }
        if roles.is_empty() {
            return Ok(Confirmation::Confirmed);
        }

        let mut missing = roles.clone();
        for attempt in 1..=attempts {
            match self.platform.fetch_live_roles(self.guild, user).await {
                Ok(live) => {
                    missing = roles.difference(&live).copied().collect();
                    if missing.is_empty() {
                        return Ok(Confirmation::Confirmed);
                    }
                }
                Err(PlatformError::MemberNotFound(_)) => return Ok(Confirmation::Departed),
                Err(err) => {
                    warn!(guild = %self.guild, user = %user, attempt, "confirmation read failed: {}", err)
                }
            }

            if attempt < attempts {
                debug!(user = %user, attempt, missing = missing.len(), "roles not visible yet, re-applying");
                if !self.apply(user, roles).await? {
                    return Ok(Confirmation::Departed);
                }
                sleep(self.timing.confirm_interval).await;
            }
        }

        missing.retain(|role| roles.contains(role));
        Ok(Confirmation::Missing(missing))
    }

    /// Add roles once. Returns whether the member is still present.
    ///
    /// A role deleted since it was resolved is removed from `roles` and the
    /// add is retried with the rest. Transient failures only cost a
    /// confirmation attempt.
    async fn apply(&self, user: UserId, roles: &mut RoleSet) -> Result<bool, GateError> {
        while !roles.is_empty() {
            match self
                .platform
                .add_roles(self.guild, user, roles, RELEASE_REASON)
                .await
            {
                Ok(()) => return Ok(true),
                Err(PlatformError::MemberNotFound(_)) => return Ok(false),
                Err(err @ PlatformError::Permission(_)) => return Err(err.into()),
                Err(PlatformError::RoleNotFound(role)) if roles.remove(&role) => {
                    warn!(guild = %self.guild, user = %user, role = %role, "held role deleted before restore, dropping");
                }
                Err(err) => {
                    warn!(guild = %self.guild, user = %user, "role restore failed: {}", err);
                    return Ok(true);
                }
            }
        }
        Ok(true)
    }

    fn watch_for_drift(&self, user: UserId, roles: RoleSet) {
        if self.timing.drift_watch.is_zero() || self.timing.drift_interval.is_zero() {
            return;
        }
        self.monitors.start(DriftWatch {
            guild: self.guild,
            user,
            roles,
            platform: self.platform.clone(),
            state: self.state.clone(),
            notifier: self.notifier.clone(),
            window: self.timing.drift_watch,
            interval: self.timing.drift_interval,
            retry: self.timing.retry_policy(),
        });
    }
}
