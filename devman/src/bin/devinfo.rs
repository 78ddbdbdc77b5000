use clap::Parser;
use devman::{topology, DeviceManager};
use log::error;
use std::{path::PathBuf, process::ExitCode};

/// Enumerate compute devices and print their capabilities.
#[derive(Parser, Debug)]
#[command(name = "devinfo")]
struct Cli {
    /// Keep device memory and kernels on the host
    #[arg(long)]
    emulate: bool,

    /// Compiled device program to load on every device
    #[arg(long)]
    program: Option<PathBuf>,

    /// Query driver version and interconnect topology
    #[arg(long)]
    topology: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut manager = DeviceManager::new();
    if let Err(e) = manager.init(cli.emulate) {
        error!("failed to initialize devices: {e}");
        return ExitCode::FAILURE;
    }

    println!("{} devices found", manager.device_count());
    match &cli.program {
        // 加载程序时会逐个打印设备信息
        Some(path) => {
            if let Err(e) = manager.init_devices(path) {
                error!("{}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        }
        None => {
            for dev in manager.devices() {
                print!("{}", dev.info())
            }
        }
    }

    if cli.topology {
        match topology::driver_version() {
            Ok(version) => println!("Driver version: {version}"),
            Err(e) => error!("{e}"),
        }
        match topology::query_nvlink(manager.devices()) {
            Ok(()) => {
                for dev in manager.devices() {
                    println!(
                        "Device[{}] links: {:#b}",
                        dev.index(),
                        dev.params().link_mask.get()
                    )
                }
            }
            Err(e) => error!("{e}"),
        }
    }

    manager.deinit();
    ExitCode::SUCCESS
}
