//! cable-filter — Linux daemon
//!
//! Publishes the caBLE advertisement monitor on the system bus, registers it
//! with BlueZ (falling back to an application-based registration when the
//! primary call is rejected), then waits for callbacks until SIGINT/SIGTERM
//! or until BlueZ releases the monitor.
//!
//! Exit status: 0 after a graceful stop or a release, 1 when registration
//! failed or the bus could not be reached.

mod bluez;
mod objects;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};

use cable_filter::defaults::CABLE_SERVICE_UUID;
use cable_filter::protocol::{MonitorMessage, VERSION};
use cable_filter::registration::{self, Strategy};
use cable_filter::shutdown::run_until_shutdown;
use cable_filter::{
    FilterSpec, MonitorConfig, MonitorObject, MonitorState, Shutdown, ShutdownReason,
};

use bluez::BluezStack;
use objects::{emit, MonitorInterface};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(state) => ExitCode::from(state.exit_code() as u8),
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<MonitorState> {
    let started = Instant::now();
    let config = MonitorConfig::from_env()?;

    log::info!("cable-filter v{} starting", VERSION);
    log::info!(
        "Filter: service data UUID {:#06X}, adapter {}, fallback {}",
        CABLE_SERVICE_UUID,
        config.adapter_path,
        config.fallback.as_str(),
    );

    // ── Shutdown + signals ───────────────────────────────────────────

    let shutdown = Shutdown::new();
    spawn_signal_listener(shutdown.clone()).context("installing signal handlers")?;

    // ── Monitor object on the system bus ─────────────────────────────

    let monitor = Arc::new(MonitorObject::new(
        config.monitor_path.as_str(),
        FilterSpec::cable(),
    ));
    let conn = zbus::connection::Builder::system()?
        .build()
        .await
        .context("connecting to the system bus")?;
    objects::publish_monitor(
        &conn,
        &config.monitor_path,
        MonitorInterface::new(monitor.clone(), shutdown.clone(), started),
    )
    .await
    .with_context(|| format!("publishing monitor at {}", config.monitor_path))?;
    log::info!("Monitor published at {}", config.monitor_path);

    let stack = BluezStack::new(conn, &config.adapter_path)
        .await
        .with_context(|| format!("creating monitor manager proxy for {}", config.adapter_path))?;

    // ── Registration ─────────────────────────────────────────────────

    let registration = match registration::register(
        &monitor,
        &config.app_path,
        config.fallback,
        &stack,
        &stack,
    )
    .await
    {
        Ok(registration) => registration,
        Err(e) => {
            log::error!("{}", e);
            report_status(&monitor, None);
            return Ok(monitor.state());
        }
    };

    log::info!(
        "Hardware-level filter ACTIVE via {} registration of {}",
        registration.strategy,
        registration.path
    );
    report_status(&monitor, Some(registration.strategy));

    // ── Event loop ───────────────────────────────────────────────────

    let reason = run_until_shutdown(&monitor, &shutdown).await;
    registration::finish(&stack, &registration, reason).await;

    report_status(&monitor, Some(registration.strategy));
    Ok(monitor.state())
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: Shutdown) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => log::info!("SIGTERM received"),
            _ = sigint.recv() => log::info!("SIGINT received"),
        }
        shutdown.cancel(ShutdownReason::Signal);
    });
    Ok(())
}

fn report_status(monitor: &MonitorObject, strategy: Option<Strategy>) {
    emit(&MonitorMessage::Status {
        state: monitor.state().as_str(),
        strategy: strategy.map(|s| s.as_str()),
        uuid: CABLE_SERVICE_UUID,
        found: monitor.found_count(),
        lost: monitor.lost_count(),
        version: VERSION,
    });
}
