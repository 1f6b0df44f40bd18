//! Per-guild verification gate
//!
//! [`Gate`] owns everything one guild's gate needs: the state store, the
//! platform client, the notification sink, the optional audit source and the
//! drift monitors. The event entry points (`on_join`, `on_role_change`,
//! `on_departure`), the release workflow and the reconciler are implemented
//! in their own modules as further `impl` blocks on this type.

use super::events::{EventKind, GateEvent, Notifier, TracingNotifier};
use super::monitor::DriftMonitors;
use super::state::{GateState, LedgerCounts, UserSnapshot};
use crate::config::{ConfigError, EntitlementRoles, GateConfig, RoleSettings, Timing};
use crate::platform::{AuditSource, GuildId, PlatformClient, PlatformError, UserId};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Gate errors
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl GateError {
    /// Message shown to the operator or user who triggered the workflow.
    pub fn operator_message(&self) -> String {
        match self {
            GateError::Configuration(_) => {
                "The verification gate is not configured: entitlement role IDs are missing or invalid."
                    .to_string()
            }
            GateError::Platform(PlatformError::Permission(_)) => {
                "The bot lacks the permissions required to manage roles.".to_string()
            }
            GateError::Platform(err) => format!("Error during verification process: {}", err),
        }
    }
}

/// Aggregate status for operator tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStats {
    #[serde(flatten)]
    pub ledger: LedgerCounts,
    /// Post-release drift monitors still running
    pub drift_watches: usize,
}

/// Subscription verification gate for one guild.
pub struct Gate<P: PlatformClient> {
    pub(super) guild: GuildId,
    pub(super) platform: P,
    pub(super) roles: RoleSettings,
    pub(super) timing: Timing,
    pub(super) state: Arc<GateState>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) audit: Option<Arc<dyn AuditSource>>,
    pub(super) monitors: DriftMonitors,
}

impl<P: PlatformClient> Gate<P> {
    pub fn new(guild: GuildId, platform: P, roles: RoleSettings, timing: Timing) -> Self {
        Self {
            guild,
            platform,
            roles,
            timing,
            state: Arc::new(GateState::new()),
            notifier: Arc::new(TracingNotifier),
            audit: None,
            monitors: DriftMonitors::new(),
        }
    }

    pub fn from_config(config: &GateConfig, platform: P) -> Self {
        Self::new(
            config.guild.id,
            platform,
            config.roles.clone(),
            config.timing.clone(),
        )
    }

    /// Replace the notification sink (defaults to the tracing log).
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Attribute blocked role assignments using the platform's audit records.
    pub fn with_audit_source(mut self, audit: Arc<dyn AuditSource>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Re-checked on every use; configuration is never cached past a call.
    pub(super) fn entitlements(&self) -> Result<EntitlementRoles, GateError> {
        Ok(self.roles.entitlements(self.guild)?)
    }

    /// Hand an event to the notifier. Sink failures never abort the caller.
    pub(super) async fn emit(&self, user: UserId, kind: EventKind) {
        let event = GateEvent::new(user, kind);
        if let Err(err) = self.notifier.notify(&event).await {
            warn!(guild = %self.guild, user = %user, "notification dropped: {}", err);
        }
    }

    // ------------------------------------------------------------------
    // Read-only status accessors
    // ------------------------------------------------------------------

    /// Users with entitlements held back.
    pub fn pending_count(&self) -> usize {
        self.state.counts().pending
    }

    /// Users under active suppression.
    pub fn monitored_count(&self) -> usize {
        self.state.counts().monitored
    }

    /// Users inside a release transaction.
    pub fn verifying_count(&self) -> usize {
        self.state.counts().verifying
    }

    pub fn failed_count(&self) -> usize {
        self.state.counts().failed
    }

    pub fn verified_total(&self) -> u64 {
        self.state.counts().verified_total
    }

    pub fn drift_watch_count(&self) -> usize {
        self.monitors.active_count()
    }

    pub fn snapshot(&self, user: UserId) -> UserSnapshot {
        UserSnapshot {
            drift_watch_active: self.monitors.is_watching(user),
            ..self.state.snapshot(user)
        }
    }

    /// Per-user workflow locks currently allocated; zero when idle.
    pub fn lock_entry_count(&self) -> usize {
        self.state.lock_entries()
    }

    pub fn is_drift_watched(&self, user: UserId) -> bool {
        self.monitors.is_watching(user)
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            ledger: self.state.counts(),
            drift_watches: self.monitors.active_count(),
        }
    }

    /// Invariant violations in the current state; empty when consistent.
    pub fn violations(&self) -> Vec<String> {
        self.state.violations()
    }
}

impl<P: PlatformClient> Drop for Gate<P> {
    fn drop(&mut self) {
        self.monitors.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MockPlatformClient, RoleId};

    #[test]
    fn test_operator_messages_are_distinct() {
        let permission = GateError::Platform(PlatformError::Permission("manage roles".into()));
        let transient = GateError::Platform(PlatformError::Transient("timeout".into()));
        let config = GateError::Configuration(ConfigError::MissingRoles("roles.paid"));

        assert!(permission.operator_message().contains("permissions"));
        assert!(transient.operator_message().contains("timeout"));
        assert!(config.operator_message().contains("not configured"));
    }

    #[tokio::test]
    async fn test_new_gate_is_empty() {
        let guild = GuildId(1);
        let roles = RoleSettings {
            paid: Some(RoleId(10)),
            free: Some(RoleId(20)),
            bypass: vec![],
        };
        let gate = Gate::new(
            guild,
            MockPlatformClient::new(guild),
            roles,
            Timing::default(),
        );

        let stats = gate.stats();
        assert_eq!(stats.ledger, LedgerCounts::default());
        assert_eq!(stats.drift_watches, 0);
        assert!(gate.entitlements().is_ok());
    }

    #[tokio::test]
    async fn test_unconfigured_gate_reports_configuration_error() {
        let guild = GuildId(1);
        let gate = Gate::new(
            guild,
            MockPlatformClient::new(guild),
            RoleSettings::default(),
            Timing::default(),
        );
        assert!(matches!(
            gate.entitlements(),
            Err(GateError::Configuration(_))
        ));
    }
}
