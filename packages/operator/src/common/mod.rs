// Common types shared between the kernel and domain layers
//
// The resource model mirrors the cluster objects the controller reads and
// writes. Keeping it here avoids a circular dependency between the
// infrastructure traits and the scheduling domain.

pub mod mpijob;
pub mod resources;

pub use mpijob::*;
pub use resources::*;
