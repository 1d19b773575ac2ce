//! Symbol interposition
//!
//! Everything the preload library needs to sit between a CUDA application
//! and the driver: the loader bootstrap, the hook table, and the ioctl
//! interception path.

pub mod driver;
pub mod elf;
pub mod engine;
pub mod entry;
pub mod loader;

pub use driver::{DriverIo, RealDriver};
pub use engine::{intercept_ioctl, patch_proc_address, resolve};
pub use entry::{FnAddr, HookEntry, HookTable};
pub use loader::LoaderSymbols;
