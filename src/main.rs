mod config;
mod desk;
mod error;

use std::process::ExitCode;
use std::time::Duration;

use btleplug::api::Peripheral as _;
use clap::Parser;
use config::{Cli, Config, Operation, Settings};
use desk::protocol::{Telemetry, HEIGHT_CHARACTERISTIC_UUID};
use desk::units::raw_to_mm;
use desk::{
    monitor, movement, DeskLink, DeskSession, DeviceCache, DeviceResolver, Discovery,
    MoveOutcome, MoveRequest, StopFlag, StopReason,
};
use error::DeskError;

/// Settling time before reading the final height after a move
const FINAL_HEIGHT_DELAY: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version land here too
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // Initialize logging, RUST_LOG still wins
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let settings = match Config::load(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::debug!("Settings: {:?}", settings);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(settings))
}

async fn run(settings: Settings) -> ExitCode {
    let stop = StopFlag::new();
    spawn_signal_handler(stop.clone());

    let cache = settings.cache_path.clone().map(DeviceCache::new);
    let resolver =
        match DeviceResolver::new(&settings.adapter_name, settings.scan_timeout, cache).await {
            Ok(resolver) => resolver,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        };

    // Scanning doesn't require a connection
    if settings.operation == Operation::ScanAdapter {
        return match stop.unless_requested(resolver.scan(None)).await {
            Err(_) => cancelled_before_connecting(),
            Ok(Ok(Discovery::All(devices))) => {
                println!(
                    "Found {} devices using {}",
                    devices.len(),
                    settings.adapter_label()
                );
                for device in devices {
                    println!("{}", device);
                }
                ExitCode::SUCCESS
            }
            Ok(Ok(Discovery::Found(device))) => {
                println!("{}", device);
                ExitCode::SUCCESS
            }
            Ok(Err(e)) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let device = match stop.unless_requested(resolver.resolve(&settings.mac_address)).await {
        Err(_) => return cancelled_before_connecting(),
        Ok(Ok(device)) => device,
        Ok(Err(DeskError::NotFound(address))) => {
            eprintln!("Could not find desk {}", address);
            return ExitCode::FAILURE;
        }
        Ok(Err(e)) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let connecting = DeskSession::connect(&device, settings.connection_timeout, stop.clone());
    let session = match stop.unless_requested(connecting).await {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            eprintln!("Connecting failed: {}", e);
            return ExitCode::FAILURE;
        }
        Err(_) => {
            // The abandoned attempt may already hold a link
            if let Err(e) = device.peripheral.disconnect().await {
                log::debug!("Disconnect after cancelled connect failed: {}", e);
            }
            return cancelled_before_connecting();
        }
    };
    resolver.remember(&device);
    println!("Connected {}", session.address());

    let result = operate(&session, &settings, &stop).await;

    // Every path past a successful connect ends here, exactly once
    if let Err(e) = session.disconnect().await {
        log::warn!("Disconnect failed: {}", e);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cancelled_before_connecting() -> ExitCode {
    println!("Cancelled");
    ExitCode::SUCCESS
}

/// Carry out the selected operation on a connected desk
async fn operate(
    session: &DeskSession,
    settings: &Settings,
    stop: &StopFlag,
) -> Result<(), DeskError> {
    let initial = read_telemetry(session).await?;
    println!("Height: {:4.0}mm", initial.height_mm());

    if settings.operation == Operation::Monitor {
        return monitor::watch(session, stop, |telemetry| {
            println!(
                "Height: {:4.0}mm Speed: {:2.0}mm/s",
                telemetry.height_mm(),
                telemetry.speed_mm_s()
            );
        })
        .await;
    }

    let Some(target) = settings.target() else {
        return Ok(());
    };

    let request = MoveRequest {
        target,
        tolerance: settings.tolerance_raw,
        timeout: settings.movement_timeout,
        detect_interference: settings.detect_interference,
    };
    let outcome = movement::move_to(session, &request, stop).await?;

    match outcome {
        MoveOutcome::AlreadyAtTarget { height } => {
            log::info!("Nothing to do, desk is at {:.0}mm", raw_to_mm(height));
        }
        MoveOutcome::Converged { height } => {
            log::info!("Reached {:.0}mm", raw_to_mm(height));
        }
        MoveOutcome::TimedOut { last_height } => println!(
            "Timed out while waiting for desk at {:4.0}mm",
            raw_to_mm(last_height)
        ),
        MoveOutcome::Interrupted { height } => println!(
            "Desk stopped at {:4.0}mm before reaching {:4.0}mm",
            raw_to_mm(height),
            raw_to_mm(target)
        ),
        MoveOutcome::Cancelled { last_height } => {
            println!("Move cancelled at {:4.0}mm", raw_to_mm(last_height))
        }
    }

    if outcome.issued_commands() && !stop.is_requested() {
        // Notified heights lag behind, wait for the desk to settle
        tokio::time::sleep(FINAL_HEIGHT_DELAY).await;
        let last = read_telemetry(session).await?;
        println!(
            "Final height: {:4.0}mm Target: {:4.0}mm",
            last.height_mm(),
            raw_to_mm(target)
        );
    }

    Ok(())
}

async fn read_telemetry(session: &DeskSession) -> Result<Telemetry, DeskError> {
    let data = session.read(HEIGHT_CHARACTERISTIC_UUID).await?;
    Ok(Telemetry::decode(&data)?)
}

/// SIGINT/SIGTERM ask any running move or monitor to wind down so the
/// desk is always disconnected cleanly
fn spawn_signal_handler(stop: StopFlag) {
    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!("Shutdown requested");
        stop.request(StopReason::Shutdown);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            log::warn!("Could not listen for SIGTERM: {}", e);
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                log::warn!("Could not listen for Ctrl-C: {}", e);
                terminate.recv().await;
            }
        }
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
