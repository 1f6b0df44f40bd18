//! Departure handling.

use super::events::{DepartureClass, EventKind};
use super::gate::Gate;
use crate::platform::{PlatformClient, RoleSet, UserId};
use tracing::info;

impl<P: PlatformClient> Gate<P> {
    /// Forget a user who left the guild.
    ///
    /// Does not wait for the per-user lock: a workflow in flight for the user
    /// finds its state gone and winds down on its own. Idempotent.
    pub async fn on_departure(&self, user: UserId) -> DepartureClass {
        self.monitors.cancel(user);
        let held = self.state.discard(user);
        self.state.prune_lock(user);

        let class = self.classify_departure(held.as_ref());

        info!(guild = %self.guild, user = %user, class = class.label(), "member left");
        self.emit(user, EventKind::Departed { class }).await;
        class
    }

    /// Classify a departing user by the entitlements held for them.
    pub(super) fn classify_departure(&self, held: Option<&RoleSet>) -> DepartureClass {
        match (held, self.entitlements()) {
            (None, _) => DepartureClass::Untracked,
            (Some(roles), Ok(entitlements)) if entitlements.includes_paid(roles) => {
                DepartureClass::LeftWithPaidEntitlement
            }
            (Some(_), _) => DepartureClass::LeftUnverifiedFree,
        }
    }
}
