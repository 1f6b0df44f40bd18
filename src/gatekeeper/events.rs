//! Gate notifications
//!
//! Every observable decision of the gate (a hold, a blocked re-assignment, a
//! release, a departure) becomes a [`GateEvent`] handed to a [`Notifier`].
//! Notifiers are fire-and-forget: a failing sink is logged and otherwise
//! ignored by the calling workflow.

use crate::platform::{RoleId, RoleSet, SourceDescription, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// How a departing user was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepartureClass {
    /// Left while a paid entitlement was still held back.
    LeftWithPaidEntitlement,
    /// Left before completing free-tier verification.
    LeftUnverifiedFree,
    /// Not tracked by the gate.
    Untracked,
}

impl DepartureClass {
    pub fn label(&self) -> &'static str {
        match self {
            DepartureClass::LeftWithPaidEntitlement => {
                "left holding an unreleased paid entitlement"
            }
            DepartureClass::LeftUnverifiedFree => {
                "left before completing free-tier verification"
            }
            DepartureClass::Untracked => "untracked",
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Joined holding entitlement roles; they were held back.
    SubscriberJoined {
        roles: RoleSet,
        /// Roles that only showed up on the post-grace re-read.
        partner_assigned: RoleSet,
    },
    /// Joined without entitlements; gated on the free tier.
    MemberJoined { held: RoleSet },
    /// Holds a bypass role; not gated.
    Bypassed { role: RoleId },
    /// An entitlement was re-applied while awaiting verification and stripped again.
    InterferenceBlocked {
        roles: RoleSet,
        source: Option<SourceDescription>,
    },
    ReleaseCompleted { roles: RoleSet },
    /// Retries exhausted; needs an operator.
    ReleaseFailed {
        restored: RoleSet,
        missing: RoleSet,
    },
    Departed { class: DepartureClass },
}

/// Single notification record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEvent {
    /// Unix timestamp (seconds since epoch).
    pub timestamp: u64,
    pub user: UserId,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl GateEvent {
    /// Create a new event with the current timestamp.
    pub fn new(user: UserId, kind: EventKind) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);

        Self {
            timestamp,
            user,
            kind,
        }
    }

    /// Short title for log channels.
    pub fn title(&self) -> &'static str {
        match &self.kind {
            EventKind::SubscriberJoined { .. } => "Subscriber Joined",
            EventKind::MemberJoined { .. } => "Member Joined",
            EventKind::Bypassed { .. } => "Verification Bypassed",
            EventKind::InterferenceBlocked { .. } => "Role Re-Removal",
            EventKind::ReleaseCompleted { .. } => "Verification Completed",
            EventKind::ReleaseFailed { .. } => "Verification Role Restoration Failed",
            EventKind::Departed { .. } => "Member Left",
        }
    }

    /// One-line human description.
    pub fn describe(&self) -> String {
        match &self.kind {
            EventKind::SubscriberJoined {
                roles,
                partner_assigned,
            } => {
                if partner_assigned.is_empty() {
                    format!(
                        "user {} joined with entitlement roles {} - verification required",
                        self.user,
                        format_roles(roles)
                    )
                } else {
                    format!(
                        "user {} joined with entitlement roles {} ({} assigned by partner integration) - verification required",
                        self.user,
                        format_roles(roles),
                        format_roles(partner_assigned)
                    )
                }
            }
            EventKind::MemberJoined { held } => format!(
                "user {} joined without entitlements - gated on {}",
                self.user,
                format_roles(held)
            ),
            EventKind::Bypassed { role } => {
                format!("user {} holds bypass role {} - not gated", self.user, role)
            }
            EventKind::InterferenceBlocked { roles, source } => format!(
                "{} re-added {} to user {} - removed again (awaiting verification)",
                source
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown source".to_string()),
                format_roles(roles),
                self.user
            ),
            EventKind::ReleaseCompleted { roles } => format!(
                "user {} completed verification - restored {}",
                self.user,
                format_roles(roles)
            ),
            EventKind::ReleaseFailed { restored, missing } => format!(
                "user {} did not receive {} of {} after verification retries - manual intervention required",
                self.user,
                format_roles(missing),
                format_roles(restored)
            ),
            EventKind::Departed { class } => {
                format!("user {} left: {}", self.user, class.label())
            }
        }
    }
}

fn format_roles(roles: &RoleSet) -> String {
    let ids: Vec<String> = roles.iter().map(|role| role.to_string()).collect();
    format!("[{}]", ids.join(", "))
}

/// Notification sink errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification sink unavailable: {0}")]
    Unavailable(String),
}

/// Audit/notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &GateEvent) -> Result<(), NotifyError>;
}

/// Writes events to the tracing log.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &GateEvent) -> Result<(), NotifyError> {
        info!(user = %event.user, title = event.title(), "{}", event.describe());
        Ok(())
    }
}

/// Records events in memory (tests, scenario replay).
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    events: Arc<Mutex<Vec<GateEvent>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GateEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Events for one user, oldest first.
    pub fn events_for(&self, user: UserId) -> Vec<GateEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.user == user)
            .collect()
    }

    /// Count events for one user matching a predicate.
    pub fn count_for(&self, user: UserId, matches: impl Fn(&EventKind) -> bool) -> usize {
        self.events_for(user)
            .iter()
            .filter(|event| matches(&event.kind))
            .count()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, event: &GateEvent) -> Result<(), NotifyError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
