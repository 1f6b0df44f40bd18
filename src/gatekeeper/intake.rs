//! Join intake: hold back entitlements until the user verifies.

use super::events::EventKind;
use super::gate::{Gate, GateError};
use crate::platform::{MemberView, PlatformClient, PlatformError, RoleId, RoleSet, UserId};
use tokio::time::sleep;
use tracing::{error, info, warn};

const HOLD_REASON: &str = "Subscription verification required";

/// Result of processing a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Entitlement roles were recorded and stripped.
    Held {
        roles: RoleSet,
        /// Roles that only appeared on the post-grace re-read
        partner_assigned: RoleSet,
        /// `false` when the platform refused the removal; reconciliation retries it.
        stripped: bool,
    },
    /// No entitlements on arrival; the free tier is owed after verification.
    Gated { held: RoleSet },
    /// Holds a bypass role.
    Bypassed { role: RoleId },
    /// Left during the grace delay.
    Departed,
}

impl<P: PlatformClient> Gate<P> {
    /// Process a user joining the guild.
    ///
    /// Waits out the grace delay so partner integrations can assign their
    /// roles, re-reads the member and holds back every entitlement role found
    /// on either view. Users arriving without entitlements are gated on the
    /// free tier.
    pub async fn on_join(&self, member: &MemberView) -> Result<IntakeOutcome, GateError> {
        let user = member.user;
        let entitlements = self.entitlements().inspect_err(|err| {
            error!(guild = %self.guild, user = %user, "join ignored: {}", err);
        })?;

        let _lock = self.state.lock_user(user).await;
        // A re-join starts over.
        self.monitors.cancel(user);

        if let Some(role) = self
            .roles
            .bypass
            .iter()
            .copied()
            .find(|role| member.roles.contains(role))
        {
            info!(guild = %self.guild, user = %user, role = %role, "bypass role held, not gating");
            self.emit(user, EventKind::Bypassed { role }).await;
            return Ok(IntakeOutcome::Bypassed { role });
        }

        let on_join = entitlements.intersect(&member.roles);

        sleep(self.timing.join_grace).await;

        let live = match self.platform.fetch_live_roles(self.guild, user).await {
            Ok(live) => live,
            Err(PlatformError::MemberNotFound(_)) => {
                return Ok(self.departed_during_grace(user, &on_join).await)
            }
            Err(err) => {
                warn!(
                    guild = %self.guild,
                    user = %user,
                    "post-grace re-read failed, using join view: {}",
                    err
                );
                member.roles.clone()
            }
        };

        let after_grace = entitlements.intersect(&live);
        let partner_assigned: RoleSet = after_grace.difference(&on_join).copied().collect();
        let held: RoleSet = on_join.union(&after_grace).copied().collect();

        if held.is_empty() {
            let held: RoleSet = [entitlements.free].into_iter().collect();
            self.state.hold(user, held.clone());
            info!(guild = %self.guild, user = %user, "joined without entitlements, gated on free tier");
            self.emit(user, EventKind::MemberJoined { held: held.clone() })
                .await;
            return Ok(IntakeOutcome::Gated { held });
        }

        // Recorded before the strip so the guard already covers the user.
        self.state.hold(user, held.clone());

        let stripped = match self
            .platform
            .remove_roles(self.guild, user, &held, HOLD_REASON)
            .await
        {
            Ok(()) => true,
            Err(PlatformError::MemberNotFound(_)) => {
                return Ok(self.departed_during_grace(user, &held).await)
            }
            Err(err) => {
                warn!(
                    guild = %self.guild,
                    user = %user,
                    "could not strip held entitlements, left for reconciliation: {}",
                    err
                );
                false
            }
        };

        info!(
            guild = %self.guild,
            user = %user,
            held = held.len(),
            partner_assigned = partner_assigned.len(),
            "entitlements held pending verification"
        );
        self.emit(
            user,
            EventKind::SubscriberJoined {
                roles: held.clone(),
                partner_assigned: partner_assigned.clone(),
            },
        )
        .await;

        Ok(IntakeOutcome::Held {
            roles: held,
            partner_assigned,
            stripped,
        })
    }

    /// The joiner left before the hold took effect. `seen` is every
    /// entitlement observed on them so far.
    async fn departed_during_grace(&self, user: UserId, seen: &RoleSet) -> IntakeOutcome {
        self.state.discard(user);
        // Under universal verification every joiner was owed at least the free tier.
        let class = self.classify_departure(Some(seen));
        info!(
            guild = %self.guild,
            user = %user,
            class = class.label(),
            "left during join grace, nothing held"
        );
        self.emit(user, EventKind::Departed { class }).await;
        IntakeOutcome::Departed
    }
}
