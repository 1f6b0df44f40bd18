//! Platform Integration Module
//!
//! Narrow interface to the chat platform that owns member roles:
//! - Role mutation and authoritative role reads
//! - Member presence checks
//! - Optional audit-log attribution of role changes
//!
//! The real transport lives outside this crate.

pub mod mock;
pub mod retry;
pub mod traits;

pub use mock::{MockPlatformClient, RoleCall, RoleCallKind, StaticAuditSource};
pub use retry::{is_platform_error_retryable, retry_with_backoff, RetryPolicy};
pub use traits::{
    AuditSource, GuildId, MemberView, PlatformClient, PlatformError, PlatformResult, Role, RoleId,
    RoleSet, SourceDescription, UserId,
};
