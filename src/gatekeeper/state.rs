//! Gate state store
//!
//! CRITICAL: all tracking is in-memory and lives for the process lifetime
//! only. A restart forgets every pending hold.
//!
//! The held entitlements, the awaiting and verifying sets, the failure flags
//! and the verified counter form one consistency domain. They live in a single
//! [`Ledger`] behind one mutex that is never held across an `.await`, so a
//! status reader can never observe a half-applied transition.
//!
//! Workflows that act on one user (intake, guard, release) additionally
//! serialize on a per-user async lock from [`GateState::lock_user`].

use crate::platform::{RoleSet, UserId};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// Tracking data for every user the gate knows about.
#[derive(Debug, Default)]
pub struct Ledger {
    /// Entitlements owed back: user -> held roles
    held: HashMap<UserId, RoleSet>,
    /// Users under suppression
    awaiting: HashSet<UserId>,
    /// Users inside a release transaction
    verifying: HashSet<UserId>,
    /// Release exhausted its retries (deduplicates failure notifications)
    failures: HashMap<UserId, bool>,
    verified_total: u64,
}

impl Ledger {
    /// Every violated invariant, described. Empty when consistent.
    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for user in &self.awaiting {
            if !self.held.contains_key(user) {
                violations.push(format!("user {} awaiting without held entitlements", user));
            }
        }
        for (user, roles) in &self.held {
            if roles.is_empty() {
                violations.push(format!("user {} has an empty held entry", user));
            }
            if !self.awaiting.contains(user) && !self.verifying.contains(user) {
                violations.push(format!(
                    "user {} holds entitlements but is neither awaiting nor verifying",
                    user
                ));
            }
        }
        violations
    }
}

/// Read-only view of one user, for operator tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSnapshot {
    pub user: UserId,
    pub held: Option<RoleSet>,
    pub awaiting: bool,
    pub verifying: bool,
    pub release_failed: bool,
    /// Filled in by the gate, which owns the drift monitors
    pub drift_watch_active: bool,
}

impl UserSnapshot {
    pub fn is_tracked(&self) -> bool {
        self.held.is_some() || self.awaiting || self.verifying
    }
}

/// Aggregate counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    /// Users with held entitlements
    pub pending: usize,
    /// Users under suppression
    pub monitored: usize,
    pub verifying: usize,
    pub failed: usize,
    pub verified_total: u64,
}

/// Shared state store, one per guild.
#[derive(Debug, Default)]
pub struct GateState {
    ledger: Mutex<Ledger>,
    user_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl GateState {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the per-user workflow lock.
    ///
    /// The entry is pruned again when the returned guard drops and nobody
    /// else is queued on it.
    pub async fn lock_user(&self, user: UserId) -> UserLock<'_> {
        let lock = {
            let mut locks = self
                .user_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks.entry(user).or_default().clone()
        };
        UserLock {
            state: self,
            user,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Per-user lock entries currently allocated.
    pub fn lock_entries(&self) -> usize {
        self.user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop the per-user lock entry if nobody holds or waits on it.
    pub fn prune_lock(&self, user: UserId) {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&user)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&user);
        }
    }

    /// Record held entitlements and start suppressing the user.
    ///
    /// An empty role set is ignored: there is nothing to owe back.
    pub fn hold(&self, user: UserId, roles: RoleSet) -> bool {
        if roles.is_empty() {
            return false;
        }
        let mut ledger = self.ledger();
        ledger.held.insert(user, roles);
        ledger.awaiting.insert(user);
        true
    }

    /// Whether the interference guard may act on this user right now.
    pub fn is_guarded(&self, user: UserId) -> bool {
        let ledger = self.ledger();
        ledger.awaiting.contains(&user) && !ledger.verifying.contains(&user)
    }

    pub fn is_awaiting(&self, user: UserId) -> bool {
        self.ledger().awaiting.contains(&user)
    }

    pub fn is_verifying(&self, user: UserId) -> bool {
        self.ledger().verifying.contains(&user)
    }

    pub fn held_roles(&self, user: UserId) -> Option<RoleSet> {
        self.ledger().held.get(&user).cloned()
    }

    /// Enter a release transaction.
    pub fn begin_verifying(&self, user: UserId) {
        self.ledger().verifying.insert(user);
    }

    /// Stop suppressing the user. Must happen before roles are re-applied.
    pub fn lift_suppression(&self, user: UserId) {
        self.ledger().awaiting.remove(&user);
    }

    /// Leave a release transaction: the user ends up untracked whatever the outcome.
    pub fn end_release(&self, user: UserId) {
        let mut ledger = self.ledger();
        ledger.verifying.remove(&user);
        ledger.awaiting.remove(&user);
        ledger.held.remove(&user);
    }

    pub fn record_success(&self, user: UserId) -> u64 {
        let mut ledger = self.ledger();
        ledger.failures.remove(&user);
        ledger.verified_total += 1;
        ledger.verified_total
    }

    /// Flag a failed release. Returns `true` only the first time since the
    /// last success, so callers notify at most once.
    pub fn record_failure(&self, user: UserId) -> bool {
        let mut ledger = self.ledger();
        let already = ledger.failures.insert(user, true).unwrap_or(false);
        !already
    }

    /// Forget everything about a user. Returns the held entitlements, if any.
    pub fn discard(&self, user: UserId) -> Option<RoleSet> {
        let mut ledger = self.ledger();
        ledger.awaiting.remove(&user);
        ledger.verifying.remove(&user);
        ledger.held.remove(&user)
    }

    /// Users currently awaiting verification.
    pub fn awaiting_users(&self) -> BTreeSet<UserId> {
        self.ledger().awaiting.iter().copied().collect()
    }

    /// Every user with any tracking entry.
    pub fn tracked_users(&self) -> BTreeSet<UserId> {
        let ledger = self.ledger();
        ledger
            .held
            .keys()
            .chain(ledger.awaiting.iter())
            .chain(ledger.verifying.iter())
            .copied()
            .collect()
    }

    pub fn snapshot(&self, user: UserId) -> UserSnapshot {
        let ledger = self.ledger();
        UserSnapshot {
            user,
            held: ledger.held.get(&user).cloned(),
            awaiting: ledger.awaiting.contains(&user),
            verifying: ledger.verifying.contains(&user),
            release_failed: ledger.failures.get(&user).copied().unwrap_or(false),
            drift_watch_active: false,
        }
    }

    pub fn counts(&self) -> LedgerCounts {
        let ledger = self.ledger();
        LedgerCounts {
            pending: ledger.held.len(),
            monitored: ledger.awaiting.len(),
            verifying: ledger.verifying.len(),
            failed: ledger.failures.values().filter(|failed| **failed).count(),
            verified_total: ledger.verified_total,
        }
    }

    /// Invariant check over a consistent view of the ledger.
    pub fn violations(&self) -> Vec<String> {
        self.ledger().violations()
    }
}

/// Held per-user workflow lock. Releases the lock, then prunes its entry.
pub struct UserLock<'a> {
    state: &'a GateState,
    user: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.state.prune_lock(self.user);
    }
}

/// Drop guard for a release transaction.
///
/// Whatever way the release ends (success, failure, error, or the caller
/// dropping the future) the user leaves the awaiting and verifying sets and
/// the held entry is deleted.
pub struct ReleaseTicket<'a> {
    state: &'a GateState,
    user: UserId,
}

impl<'a> ReleaseTicket<'a> {
    pub fn open(state: &'a GateState, user: UserId) -> Self {
        state.begin_verifying(user);
        Self { state, user }
    }
}

impl Drop for ReleaseTicket<'_> {
    fn drop(&mut self) {
        self.state.end_release(self.user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::RoleId;
    use proptest::prelude::*;

    fn roles(ids: &[u64]) -> RoleSet {
        ids.iter().map(|id| RoleId(*id)).collect()
    }

    #[test]
    fn test_hold_tracks_and_suppresses() {
        let state = GateState::new();
        assert!(state.hold(UserId(1), roles(&[10, 20])));

        assert!(state.is_awaiting(UserId(1)));
        assert!(state.is_guarded(UserId(1)));
        assert_eq!(state.held_roles(UserId(1)), Some(roles(&[10, 20])));
        assert!(state.violations().is_empty());
    }

    #[test]
    fn test_empty_hold_ignored() {
        let state = GateState::new();
        assert!(!state.hold(UserId(1), RoleSet::new()));
        assert!(!state.snapshot(UserId(1)).is_tracked());
    }

    #[test]
    fn test_verifying_user_not_guarded() {
        let state = GateState::new();
        state.hold(UserId(1), roles(&[10]));
        state.begin_verifying(UserId(1));

        assert!(state.is_awaiting(UserId(1)));
        assert!(!state.is_guarded(UserId(1)));
    }

    #[test]
    fn test_ticket_cleans_up_on_drop() {
        let state = GateState::new();
        state.hold(UserId(1), roles(&[10]));
        {
            let _ticket = ReleaseTicket::open(&state, UserId(1));
            assert!(state.is_verifying(UserId(1)));
            state.lift_suppression(UserId(1));
            assert!(state.violations().is_empty());
        }
        assert!(!state.snapshot(UserId(1)).is_tracked());
    }

    #[test]
    fn test_failure_flag_dedup() {
        let state = GateState::new();
        assert!(state.record_failure(UserId(1)));
        assert!(!state.record_failure(UserId(1)));
        assert_eq!(state.counts().failed, 1);

        assert_eq!(state.record_success(UserId(1)), 1);
        assert_eq!(state.counts().failed, 0);
        assert!(state.record_failure(UserId(1)));
    }

    #[test]
    fn test_discard_returns_held() {
        let state = GateState::new();
        state.hold(UserId(1), roles(&[10]));
        assert_eq!(state.discard(UserId(1)), Some(roles(&[10])));
        assert_eq!(state.discard(UserId(1)), None);
        assert!(state.tracked_users().is_empty());
    }

    #[test]
    fn test_counts() {
        let state = GateState::new();
        state.hold(UserId(1), roles(&[10]));
        state.hold(UserId(2), roles(&[20]));
        state.begin_verifying(UserId(2));
        state.lift_suppression(UserId(2));

        let counts = state.counts();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.monitored, 1);
        assert_eq!(counts.verifying, 1);
        assert_eq!(counts.verified_total, 0);
    }

    #[tokio::test]
    async fn test_user_lock_pruned_when_idle() {
        let state = GateState::new();
        {
            let _guard = state.lock_user(UserId(1)).await;
            state.prune_lock(UserId(1));
            assert_eq!(state.lock_entries(), 1);
        }
        assert_eq!(state.lock_entries(), 0);
    }

    #[tokio::test]
    async fn test_user_lock_kept_while_contended() {
        let state = Arc::new(GateState::new());
        let first = state.lock_user(UserId(1)).await;

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move {
                let _guard = state.lock_user(UserId(1)).await;
            })
        };
        tokio::task::yield_now().await;

        drop(first);
        // The queued waiter still references the entry
        assert_eq!(state.lock_entries(), 1);
        waiter.await.unwrap();
        assert_eq!(state.lock_entries(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Hold(u64, Vec<u64>),
        BeginVerifying(u64),
        LiftAndEnd(u64),
        Discard(u64),
        Fail(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..5, prop::collection::vec(1u64..4, 0..3)).prop_map(|(u, r)| Op::Hold(u, r)),
            (0u64..5).prop_map(Op::BeginVerifying),
            (0u64..5).prop_map(Op::LiftAndEnd),
            (0u64..5).prop_map(Op::Discard),
            (0u64..5).prop_map(Op::Fail),
        ]
    }

    // Property test: no reachable sequence of operations breaks the ledger invariants
    proptest! {
        #[test]
        fn prop_ledger_invariants_hold(ops in prop::collection::vec(op_strategy(), 0..40)) {
            let state = GateState::new();
            let mut open: Vec<u64> = Vec::new();

            for op in ops {
                match op {
                    Op::Hold(user, ids) => {
                        state.hold(UserId(user), ids.into_iter().map(RoleId).collect());
                    }
                    Op::BeginVerifying(user) => {
                        state.begin_verifying(UserId(user));
                        open.push(user);
                    }
                    Op::LiftAndEnd(user) => {
                        state.lift_suppression(UserId(user));
                        state.end_release(UserId(user));
                        open.retain(|u| *u != user);
                    }
                    Op::Discard(user) => {
                        state.discard(UserId(user));
                        open.retain(|u| *u != user);
                    }
                    Op::Fail(user) => {
                        state.record_failure(UserId(user));
                    }
                }
                prop_assert!(state.violations().is_empty(), "{:?}", state.violations());
            }

            for user in open {
                state.end_release(UserId(user));
            }
            let counts = state.counts();
            prop_assert_eq!(counts.verifying, 0);
            prop_assert!(counts.monitored <= counts.pending);
        }
    }
}
