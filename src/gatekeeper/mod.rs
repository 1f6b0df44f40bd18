//! Gatekeeper module: subscription verification gate
//!
//! - Intake: hold back entitlement roles when a user joins
//! - Guard: strip entitlements re-applied before verification
//! - Release: restore held roles after verification, then watch for drift
//! - Bulk release: verify every awaiting user in one operator action
//! - Departure and reconciliation: keep the ledger in step with the guild

pub mod bulk;
pub mod departure;
pub mod events;
pub mod gate;
pub mod guard;
pub mod intake;
pub mod monitor;
pub mod reconcile;
pub mod release;
pub mod state;

pub use bulk::{BulkEntry, BulkReleaseReport, BulkResult};
pub use events::{
    DepartureClass, EventKind, GateEvent, MemoryNotifier, Notifier, NotifyError, TracingNotifier,
};
pub use gate::{Gate, GateError, GateStats};
pub use guard::GuardOutcome;
pub use intake::IntakeOutcome;
pub use monitor::{DriftMonitors, DriftOutcome, DriftReport, DriftWatch};
pub use reconcile::ReconcileReport;
pub use release::ReleaseOutcome;
pub use state::{GateState, LedgerCounts, ReleaseTicket, UserLock, UserSnapshot};
