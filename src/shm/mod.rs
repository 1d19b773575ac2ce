//! Shared memory coordination layer
//!
//! Named POSIX shared memory regions joined by hooked processes and the
//! monitor:
//!
//! - [`fb`]: one region per GPU minor holding the governed memory counter
//! - [`token`]: one region per GPU minor and cgroup holding token rates
//!
//! Both use the single-initializer protocol in [`region`].

pub mod fb;
pub mod region;
pub mod semaphore;
pub mod token;

pub use fb::{FbInit, Reservation, SharedFbInfo};
pub use region::{SharedLayout, ShmRegion};
pub use semaphore::SharedSemaphore;
pub use token::{TokenAttr, TokenUpdate};
