// Kernel - infrastructure with dependency injection
//
// The kernel holds everything the scheduling domain needs from the outside
// world (cluster access, the rescale RPC, event recording, the work queue)
// behind traits so tests can inject in-memory implementations.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not scheduling logic.
// Scheduling logic belongs in the domain layer.

pub mod dispatcher;
pub mod event_recorder;
pub mod rescale_client;
pub mod test_dependencies;
pub mod traits;
pub mod workqueue;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use event_recorder::LogEventRecorder;
pub use rescale_client::{encode_set_bitmap, TcpRescaler, SET_BITMAP_COMMAND};
pub use test_dependencies::{MockCluster, RescaleCall, ScriptedRescaler, SpyEventRecorder};
pub use traits::*;
pub use workqueue::WorkQueue;
