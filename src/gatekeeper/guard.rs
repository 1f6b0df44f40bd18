//! Interference guard: strip entitlements re-applied to users still
//! awaiting verification.

use super::events::EventKind;
use super::gate::{Gate, GateError};
use crate::platform::{MemberView, PlatformClient, PlatformError, RoleSet, SourceDescription};
use tracing::{debug, info, warn};

const BLOCK_REASON: &str =
    "Blocked unauthorized entitlement assignment while awaiting verification";

/// Result of inspecting a role change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    /// User is not awaiting verification.
    NotGuarded,
    /// A release is in flight; its own role changes pass.
    Releasing,
    /// No entitlement role was added.
    NoEntitlementAdded,
    /// The added entitlements were removed again.
    Blocked {
        roles: RoleSet,
        source: Option<SourceDescription>,
    },
}

impl<P: PlatformClient> Gate<P> {
    /// Inspect a member role update published by the platform.
    pub async fn on_role_change(
        &self,
        before: &MemberView,
        after: &MemberView,
    ) -> Result<GuardOutcome, GateError> {
        let user = after.user;
        if !self.state.is_awaiting(user) {
            return Ok(GuardOutcome::NotGuarded);
        }

        let _lock = self.state.lock_user(user).await;
        // Re-checked under the lock: a release may have finished meanwhile.
        if !self.state.is_awaiting(user) {
            return Ok(GuardOutcome::NotGuarded);
        }
        if self.state.is_verifying(user) {
            debug!(user = %user, "role change during release, not interfering");
            return Ok(GuardOutcome::Releasing);
        }

        let entitlements = match self.entitlements() {
            Ok(entitlements) => entitlements,
            Err(err) => {
                warn!(guild = %self.guild, user = %user, "guard inactive: {}", err);
                return Ok(GuardOutcome::NotGuarded);
            }
        };

        let added: RoleSet = after.roles.difference(&before.roles).copied().collect();
        let added = entitlements.intersect(&added);
        if added.is_empty() {
            return Ok(GuardOutcome::NoEntitlementAdded);
        }

        match self
            .platform
            .remove_roles(self.guild, user, &added, BLOCK_REASON)
            .await
        {
            Ok(()) => {}
            Err(PlatformError::MemberNotFound(_)) => return Ok(GuardOutcome::NotGuarded),
            Err(err) => {
                warn!(guild = %self.guild, user = %user, "could not re-strip entitlements: {}", err);
                return Err(err.into());
            }
        }

        let source = self.attribute(after, &added).await;
        info!(
            guild = %self.guild,
            user = %user,
            roles = added.len(),
            source = source.as_ref().map(|s| s.0.as_str()).unwrap_or("unknown"),
            "blocked entitlement re-assignment before verification"
        );
        self.emit(
            user,
            EventKind::InterferenceBlocked {
                roles: added.clone(),
                source: source.clone(),
            },
        )
        .await;

        Ok(GuardOutcome::Blocked {
            roles: added,
            source,
        })
    }

    async fn attribute(
        &self,
        after: &MemberView,
        added: &RoleSet,
    ) -> Option<SourceDescription> {
        let audit = self.audit.as_ref()?;
        match audit.role_change_source(self.guild, after.user, added).await {
            Ok(source) => source,
            Err(err) => {
                debug!(user = %after.user, "audit lookup failed: {}", err);
                None
            }
        }
    }
}
