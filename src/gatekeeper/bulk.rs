//! Bulk release: verify every user still awaiting verification at once.
//!
//! Operator escape hatch for when the verification flow itself is broken.
//! Each user goes through the regular [`Gate::release`] transaction, so
//! confirmation, failure flags and drift monitors behave as for a single
//! release.

use super::gate::Gate;
use super::release::ReleaseOutcome;
use crate::platform::{PlatformClient, RoleSet, UserId};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::info;

/// Users released concurrently
const RELEASE_CONCURRENCY: usize = 8;

/// How one user's release ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BulkResult {
    Restored { roles: RoleSet },
    Failed { missing: RoleSet },
    NothingToRestore,
    Departed,
    Error { message: String },
}

/// One affected user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkEntry {
    pub user: UserId,
    /// Entitlements held for the user when the bulk release started
    pub held: RoleSet,
    #[serde(flatten)]
    pub result: BulkResult,
}

/// Report of a bulk release, ordered by user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReleaseReport {
    pub entries: Vec<BulkEntry>,
}

impl BulkReleaseReport {
    pub fn restored(&self) -> usize {
        self.count(|result| matches!(result, BulkResult::Restored { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|result| matches!(result, BulkResult::Failed { .. }))
    }

    pub fn errors(&self) -> usize {
        self.count(|result| matches!(result, BulkResult::Error { .. }))
    }

    fn count(&self, matches: impl Fn(&BulkResult) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches(&entry.result))
            .count()
    }
}

impl<P: PlatformClient> Gate<P> {
    /// Release every user awaiting verification.
    ///
    /// Users that start awaiting after the sweep began are left alone.
    pub async fn release_all(&self) -> BulkReleaseReport {
        let users = self.state.awaiting_users();
        let mut entries: Vec<BulkEntry> = stream::iter(users)
            .map(|user| self.release_one(user))
            .buffer_unordered(RELEASE_CONCURRENCY)
            .collect()
            .await;
        entries.sort_by_key(|entry| entry.user);

        let report = BulkReleaseReport { entries };
        info!(
            guild = %self.guild,
            users = report.entries.len(),
            restored = report.restored(),
            failed = report.failed(),
            errors = report.errors(),
            "bulk release finished"
        );
        report
    }

    async fn release_one(&self, user: UserId) -> BulkEntry {
        let held = self.state.held_roles(user).unwrap_or_default();
        let result = match self.release(user).await {
            Ok(outcome @ ReleaseOutcome::Restored { .. }) => BulkResult::Restored {
                roles: outcome.restored_roles(),
            },
            Ok(ReleaseOutcome::Failed { missing, .. }) => BulkResult::Failed { missing },
            Ok(ReleaseOutcome::NothingToRestore) => BulkResult::NothingToRestore,
            Ok(ReleaseOutcome::Departed) => BulkResult::Departed,
            Err(err) => BulkResult::Error {
                message: err.operator_message(),
            },
        };
        BulkEntry { user, held, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::RoleId;

    fn entry(user: u64, result: BulkResult) -> BulkEntry {
        BulkEntry {
            user: UserId(user),
            held: [RoleId(10)].into_iter().collect(),
            result,
        }
    }

    #[test]
    fn test_report_counts() {
        let report = BulkReleaseReport {
            entries: vec![
                entry(
                    1,
                    BulkResult::Restored {
                        roles: [RoleId(10)].into_iter().collect(),
                    },
                ),
                entry(
                    2,
                    BulkResult::Failed {
                        missing: [RoleId(10)].into_iter().collect(),
                    },
                ),
                entry(3, BulkResult::Departed),
            ],
        };
        assert_eq!(report.restored(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.errors(), 0);
    }

    #[test]
    fn test_entry_serializes_flat() {
        let json = serde_json::to_string(&entry(7, BulkResult::NothingToRestore)).unwrap();
        assert_eq!(json, r#"{"user":7,"held":[10],"result":"nothing_to_restore"}"#);
    }
}
