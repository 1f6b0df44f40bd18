//! Benchmarks for gate state store operations
//!
//! Every platform event touches the ledger at least once (the guard checks
//! awaiting membership on every role update in the guild), so these paths
//! must stay well under a microsecond at realistic guild sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use subgate::gatekeeper::{GateState, ReleaseTicket};
use subgate::platform::{RoleId, RoleSet, UserId};

fn held_roles() -> RoleSet {
    [RoleId(10), RoleId(20)].into_iter().collect()
}

/// State with `size` users awaiting verification
fn populated_state(size: u64) -> GateState {
    let state = GateState::new();
    for user in 0..size {
        state.hold(UserId(user), held_roles());
    }
    state
}

fn benchmark_guard_check(c: &mut Criterion) {
    let state = populated_state(1_000);

    c.bench_function("guard_check_tracked_user", |b| {
        b.iter(|| state.is_guarded(black_box(UserId(500))));
    });

    c.bench_function("guard_check_untracked_user", |b| {
        b.iter(|| state.is_guarded(black_box(UserId(1_000_000))));
    });
}

fn benchmark_hold_and_release(c: &mut Criterion) {
    let state = populated_state(1_000);

    c.bench_function("hold_then_release_cycle", |b| {
        b.iter(|| {
            let user = black_box(UserId(5_000));
            state.hold(user, held_roles());
            let _ticket = ReleaseTicket::open(&state, user);
            state.lift_suppression(user);
            state.held_roles(user)
        });
    });
}

fn benchmark_counts_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_counts");

    for size in [100u64, 1_000, 10_000].iter() {
        let state = populated_state(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(state.counts()));
        });
    }

    group.finish();
}

fn benchmark_violations_scan(c: &mut Criterion) {
    let state = populated_state(10_000);

    c.bench_function("violations_scan_10000_users", |b| {
        b.iter(|| black_box(state.violations()));
    });
}

criterion_group!(
    benches,
    benchmark_guard_check,
    benchmark_hold_and_release,
    benchmark_counts_scaling,
    benchmark_violations_scan
);
criterion_main!(benches);
