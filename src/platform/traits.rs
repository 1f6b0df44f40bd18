//! Platform Client Trait Abstractions
//!
//! The gate never talks to a chat platform directly. Role reads and writes go
//! through [`PlatformClient`], so tests and the `simulate` command can swap in
//! [`MockPlatformClient`](super::mock::MockPlatformClient).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Platform user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// Platform role identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub u64);

/// Guild (community) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuildId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl GuildId {
    /// The implicit role every member of the guild carries.
    ///
    /// It shares the guild's numeric ID and is never an entitlement.
    pub fn everyone_role(&self) -> RoleId {
        RoleId(self.0)
    }
}

/// Set of role identifiers. Ordered so logs and events are stable.
pub type RoleSet = BTreeSet<RoleId>;

/// A live role object resolved from the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
}

/// A member as seen in a platform event (join or role update)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberView {
    pub user: UserId,
    pub roles: RoleSet,
}

impl MemberView {
    pub fn new(user: UserId, roles: impl IntoIterator<Item = RoleId>) -> Self {
        Self {
            user,
            roles: roles.into_iter().collect(),
        }
    }
}

/// Best-effort description of who changed a member's roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescription(pub String);

impl fmt::Display for SourceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Platform client errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// The platform refused the operation. Never retried.
    #[error("Missing permission: {0}")]
    Permission(String),

    /// Timeout or temporary unavailability.
    #[error("Transient platform error: {0}")]
    Transient(String),

    #[error("Member not found: {0}")]
    MemberNotFound(UserId),

    #[error("Role not found: {0}")]
    RoleNotFound(RoleId),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl PlatformError {
    /// Transient errors are the only ones worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlatformError::Transient(_))
    }
}

/// Platform client abstraction
///
/// Every method is a suspension point (network I/O against the platform).
/// Implementations are cheap to clone; the gate clones the client into the
/// background drift monitors.
#[async_trait]
pub trait PlatformClient: Clone + Send + Sync + 'static {
    /// Remove roles from a member. Removing a role the member lacks is not an error.
    async fn remove_roles(
        &self,
        guild: GuildId,
        user: UserId,
        roles: &RoleSet,
        reason: &str,
    ) -> PlatformResult<()>;

    /// Add roles to a member.
    async fn add_roles(
        &self,
        guild: GuildId,
        user: UserId,
        roles: &RoleSet,
        reason: &str,
    ) -> PlatformResult<()>;

    /// Authoritative role list for a member, re-fetched (never cached).
    ///
    /// Returns `MemberNotFound` once the member has left.
    async fn fetch_live_roles(&self, guild: GuildId, user: UserId) -> PlatformResult<RoleSet>;

    /// Whether the member is still in the guild.
    async fn is_member_present(&self, guild: GuildId, user: UserId) -> PlatformResult<bool>;

    /// Resolve a role ID to a live role. `None` if the role was deleted.
    async fn resolve_role(&self, guild: GuildId, role: RoleId) -> PlatformResult<Option<Role>>;
}

/// Optional capability: attribute a role change to its author via the
/// platform's own audit records.
///
/// Absence or failure only affects log detail, never control flow.
#[async_trait]
pub trait AuditSource: Send + Sync {
    async fn role_change_source(
        &self,
        guild: GuildId,
        user: UserId,
        roles: &RoleSet,
    ) -> PlatformResult<Option<SourceDescription>>;
}
