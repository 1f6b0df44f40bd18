//! Periodic reconciliation of the ledger against the platform.
//!
//! Catches what the event-driven paths can miss: departures whose events
//! were lost, and held entitlements the platform refused to strip at intake.

use super::gate::Gate;
use crate::config::EntitlementRoles;
use crate::platform::{PlatformClient, PlatformError, UserId};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

const RESTRIP_REASON: &str = "Subscription verification required";

/// Users checked concurrently during a sweep
const SWEEP_CONCURRENCY: usize = 8;

/// Summary of one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Tracked users no longer in the guild, now forgotten
    pub departed_cleaned: usize,
    /// Awaiting users whose entitlements were stripped again
    pub restripped: usize,
    /// Users skipped because of a platform error
    pub errors: usize,
}

enum Reconciled {
    Unchanged,
    Departed,
    Restripped,
    Error,
}

impl<P: PlatformClient> Gate<P> {
    /// Sweep every tracked user once.
    pub async fn reconcile(&self) -> ReconcileReport {
        let entitlements = match self.entitlements() {
            Ok(entitlements) => Some(entitlements),
            Err(err) => {
                warn!(guild = %self.guild, "reconcile will not re-strip: {}", err);
                None
            }
        };

        let users = self.state.tracked_users();
        let results: Vec<Reconciled> = stream::iter(users)
            .map(|user| self.reconcile_user(user, entitlements))
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        let mut report = ReconcileReport::default();
        for result in results {
            match result {
                Reconciled::Unchanged => {}
                Reconciled::Departed => report.departed_cleaned += 1,
                Reconciled::Restripped => report.restripped += 1,
                Reconciled::Error => report.errors += 1,
            }
        }

        info!(
            guild = %self.guild,
            departed_cleaned = report.departed_cleaned,
            restripped = report.restripped,
            errors = report.errors,
            "reconciliation finished"
        );
        report
    }

    async fn reconcile_user(
        &self,
        user: UserId,
        entitlements: Option<EntitlementRoles>,
    ) -> Reconciled {
        match self.platform.is_member_present(self.guild, user).await {
            Ok(true) => {}
            Ok(false) => {
                self.monitors.cancel(user);
                self.state.discard(user);
                self.state.prune_lock(user);
                debug!(guild = %self.guild, user = %user, "departed user cleaned up");
                return Reconciled::Departed;
            }
            Err(err) => {
                warn!(guild = %self.guild, user = %user, "presence check failed: {}", err);
                return Reconciled::Error;
            }
        }

        let Some(entitlements) = entitlements else {
            return Reconciled::Unchanged;
        };

        let _lock = self.state.lock_user(user).await;
        if !self.state.is_guarded(user) {
            return Reconciled::Unchanged;
        }

        let stray = match self.platform.fetch_live_roles(self.guild, user).await {
            Ok(live) => entitlements.intersect(&live),
            Err(PlatformError::MemberNotFound(_)) => return Reconciled::Unchanged,
            Err(err) => {
                warn!(guild = %self.guild, user = %user, "role read failed: {}", err);
                return Reconciled::Error;
            }
        };
        if stray.is_empty() {
            return Reconciled::Unchanged;
        }

        match self
            .platform
            .remove_roles(self.guild, user, &stray, RESTRIP_REASON)
            .await
        {
            Ok(()) => {
                info!(guild = %self.guild, user = %user, roles = stray.len(), "re-stripped held entitlements");
                Reconciled::Restripped
            }
            Err(err) => {
                warn!(guild = %self.guild, user = %user, "re-strip failed: {}", err);
                Reconciled::Error
            }
        }
    }
}
