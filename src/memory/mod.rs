//! Memory accounting engine
//!
//! Decodes allocation, control and free escapes on /dev/nvidiactl and keeps
//! the per-minor shared counter in step with this process's allocations.

pub mod accountant;
pub mod records;

pub use accountant::{aligned_size, Admission, MemoryGovernor};
pub use records::{AllocationTable, ObjectKey};
