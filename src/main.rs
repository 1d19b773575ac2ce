//! cudagov-monitor - adaptive compute governor
//!
//! Runs once per constrained cgroup, next to the CUDA processes it governs,
//! and publishes their kernel launch rate through shared memory.

use clap::Parser;
use cudagov::cgroup::ProcCgroups;
use cudagov::cli::Cli;
use cudagov::config::ConfigBuilder;
use cudagov::controller::{DeviceInfo, Monitor, NvmlLib};
use cudagov::error::{GovernorError, NvmlError};
use cudagov::logging;

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        logging::level_from_env()
    };
    logging::init(level);

    if let Err(e) = run(&cli) {
        log::error!("{}", e);
        print_error(&e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), GovernorError> {
    let config = ConfigBuilder::new()
        .with_file(cli.config.as_deref())
        .with_env()
        .with_monitor_interval(cli.interval_ms)
        .build();
    let limit = cli.limit();
    log::info!(
        "monitor minor {}, cgroup_id {}, core_limit {}",
        limit.minor,
        cli.cgroup_id,
        limit.limit
    );

    match DeviceInfo::query(limit.minor) {
        Ok(info) => log::info!("{}", info),
        Err(e) => log::warn!("Cannot describe device: {}", e),
    }

    let nvml = NvmlLib::load()?;
    let device = nvml.device_for_minor(limit.minor)?;
    match device.graphics_clocks() {
        Ok((current, max)) => log::info!("clock: {}:{}", current, max),
        Err(e) => log::warn!("Cannot read graphics clock: {}", e),
    }

    let monitor = Monitor::attach(&config, limit, &cli.cgroup_id)?;
    let mut sampler = device.sampler(config.monitor.max_samples);
    monitor.run(&mut sampler, &ProcCgroups)
}

fn print_error(err: &GovernorError) {
    eprintln!("Error: {}", err);

    if let GovernorError::Nvml(NvmlError::LibraryNotFound) = err {
        eprintln!();
        eprintln!("Hint: Make sure the NVIDIA driver is installed.");
        eprintln!("      On Linux, install the nvidia-utils package.");
    }
    if let GovernorError::Shm(_) = err {
        eprintln!();
        eprintln!("Hint: The monitor needs write access to /dev/shm.");
    }
}
