//! Domain models for cudagov
//!
//! This module contains the validated value types shared by the governor
//! and the monitor. Types are validated on construction (fail-fast pattern).

pub mod limit;
pub mod utilization;

pub use limit::{iec_to_bytes, CoreLimit, MemoryLimit};
pub use utilization::ProcessSample;
