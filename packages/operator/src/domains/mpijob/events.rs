// Job event reasons
//
// Every state transition is surfaced to the user as an event carrying one
// of these reasons. Messages are capped by the recorder.

pub const MPI_JOB_CREATED: &str = "MPIJobCreated";
pub const MPI_JOB_RUNNING: &str = "MPIJobRunning";
pub const MPI_JOB_SUCCEEDED: &str = "MPIJobSucceeded";
pub const MPI_JOB_FAILED: &str = "MPIJobFailed";
pub const MPI_JOB_SUSPENDED: &str = "MPIJobSuspended";
pub const MPI_JOB_RESUMED: &str = "MPIJobResumed";
pub const ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";
pub const VALIDATION_ERROR: &str = "ValidationError";
