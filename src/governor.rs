//! Per-process governor
//!
//! One instance per hooked process, built once from the configured limits and
//! handed by reference to every interception site. Either half may be absent;
//! an absent half makes its hooks pass straight through.

use crate::cgroup;
use crate::config::{Config, Limits};
use crate::error::{GovernorError, Result};
use crate::hook::{intercept_ioctl, DriverIo};
use crate::memory::MemoryGovernor;
use crate::throttle::{ComputeLimiter, GOVERNOR_INTERNAL_ERROR};

use std::ffi::{c_int, c_ulong, c_void};

pub struct Governor {
    limits: Limits,
    memory: Option<MemoryGovernor>,
    compute: Option<ComputeLimiter>,
}

impl Governor {
    /// Join the shared regions for every configured limit
    ///
    /// The compute half also starts the refill thread. Errors here are
    /// bootstrap failures: the region could not be mapped or the process's
    /// cgroup could not be determined.
    pub fn init(config: &Config, limits: Limits) -> Result<Self> {
        let memory = match limits.memory {
            Some(limit) => Some(MemoryGovernor::open(
                limit,
                &config.shm,
                config.throttle.ready_timeout(),
            )?),
            None => None,
        };

        let compute = match limits.core {
            Some(limit) => {
                let pid = std::process::id();
                let cgroup_id = cgroup::cgroup_id(pid)?;
                log::debug!("pid {} in cgroup {}", pid, cgroup_id);

                let limiter = ComputeLimiter::open(limit, &cgroup_id, config)?;
                limiter.spawn_refill().map_err(GovernorError::Spawn)?;
                Some(limiter)
            }
            None => None,
        };

        Ok(Self::from_parts(limits, memory, compute))
    }

    /// Assemble a governor from already constructed halves
    pub fn from_parts(
        limits: Limits,
        memory: Option<MemoryGovernor>,
        compute: Option<ComputeLimiter>,
    ) -> Self {
        Self {
            limits,
            memory,
            compute,
        }
    }

    /// A governor that governs nothing
    pub fn disabled() -> Self {
        Self::from_parts(Limits::default(), None, None)
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn memory(&self) -> Option<&MemoryGovernor> {
        self.memory.as_ref()
    }

    pub fn compute(&self) -> Option<&ComputeLimiter> {
        self.compute.as_ref()
    }

    /// Admit one kernel launch
    ///
    /// Returns 0 when the launch may proceed, `GOVERNOR_INTERNAL_ERROR` when
    /// the token wait itself failed.
    pub fn rate_limit(&self) -> c_int {
        let Some(compute) = &self.compute else {
            return 0;
        };
        match compute.acquire() {
            Ok(()) => 0,
            Err(e) => {
                log::error!("Token wait failed: {}", e);
                GOVERNOR_INTERNAL_ERROR
            }
        }
    }

    /// Forward an ioctl with memory accounting around it
    ///
    /// # Safety
    /// Same contract as `ioctl(2)` for `request` and `args`.
    pub unsafe fn ioctl<D: DriverIo + ?Sized>(
        &self,
        driver: &D,
        fd: c_int,
        request: c_ulong,
        args: *mut c_void,
    ) -> c_int {
        intercept_ioctl(self.memory.as_ref(), driver, fd, request, args)
    }
}
