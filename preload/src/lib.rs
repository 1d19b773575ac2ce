//! cuda_hook - LD_PRELOAD shim applying cudagov limits
//!
//! Loaded into a CUDA application with `LD_PRELOAD=libcuda_hook.so`. The
//! limits come from `CUDA_MEM_LIMIT` and `CUDA_CORE_LIMIT`; with neither set
//! the library forwards everything untouched.
//!
//! The driver library is reached through `dlsym` and `cuGetProcAddress`, so
//! those are the interposition points: every governed entry point is
//! substituted as it is resolved. Memory is accounted one level lower, on
//! the driver's ioctl stream.

mod cuda;
mod dlfcn;

use cudagov::config::{ConfigBuilder, Limits};
use cudagov::hook::elf::module_base;
use cudagov::hook::LoaderSymbols;
use cudagov::{fatal, logging, Governor};

use std::ffi::c_void;
use std::sync::{Once, OnceLock};

static LOADER: OnceLock<LoaderSymbols> = OnceLock::new();
static GOVERNOR: OnceLock<Governor> = OnceLock::new();
static LOGGING: Once = Once::new();

/// Real loader entry points, located on first use
///
/// Another library's constructor may call `dlsym` before ours has run, so
/// every export goes through here rather than assuming `init` came first.
fn loader() -> &'static LoaderSymbols {
    LOADER.get_or_init(|| {
        let own = module_base(init as *const c_void);
        match LoaderSymbols::bootstrap(own) {
            Ok(symbols) => symbols,
            Err(e) => fatal!("{}", e),
        }
    })
}

fn governor() -> &'static Governor {
    init_logging();
    GOVERNOR.get_or_init(|| {
        let limits = Limits::from_env();
        if !limits.any() {
            log::info!("no limits configured, forwarding only");
            return Governor::disabled();
        }

        let config = ConfigBuilder::new().with_env_file().with_env().build();
        match Governor::init(&config, limits) {
            Ok(governor) => {
                log::info!("governing {:?}", governor.limits());
                governor
            }
            Err(e) => fatal!("{}", e),
        }
    })
}

/// Governor, if it has finished initializing
fn governor_ready() -> Option<&'static Governor> {
    GOVERNOR.get()
}

fn init_logging() {
    LOGGING.call_once(|| logging::init(logging::level_from_env()));
}

extern "C" fn init() {
    init_logging();
    loader();
    governor();
}

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = init;
