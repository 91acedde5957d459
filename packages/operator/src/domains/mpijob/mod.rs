// Malleable MPI job scheduling
//
// The controller multiplexes a fixed pool of worker slots across MPI jobs
// of varying priority. Jobs are admitted (possibly by shrinking
// lower-priority work), expanded when capacity frees up, and told about
// membership changes through the launcher's control endpoint.

mod admission;
pub mod controller;
pub mod error;
pub mod events;
pub mod hostfile;
pub mod ledger;
pub mod queues;
pub mod state;
pub mod templates;
pub mod validation;

pub use controller::MpiJobController;
pub use error::ReconcileError;
pub use ledger::SlotLedger;
pub use queues::{PriorityQueue, QueueEntry};
pub use state::{JobPhase, PendingRescale, RescaleReason, SchedulerState};
