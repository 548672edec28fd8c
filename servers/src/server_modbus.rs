//! # Modbus Telemetry Gateway
//!
//! Polls one block of input registers from a Modbus TCP device on a fixed
//! period and streams every scaled reading to all connected WebSocket
//! subscribers at `/ws`.
//!
//! ## Lifecycle:
//! 1. Configuration is layered from defaults, `server_modbus.conf`, the
//!    environment (including `.env`) and the command line, then validated.
//! 2. Logging goes to the console and a daily-rolling file.
//! 3. The poll loop is built but stays idle; the first subscriber starts it.
//! 4. Ctrl-C or SIGTERM cancels one shared token. The poll loop stops, every
//!    subscriber gets a close frame, and the listener stops accepting.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use anyhow::{Context, Result};
use lib_telemetry::connections::ModbusTcpClient;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod modbus_logic;
use modbus_logic::{config, downstream, logger, state};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Phase 1: Configuration ---
    dotenvy::dotenv().ok();
    let config = config::load_config().context("invalid configuration")?;

    // --- Phase 2: Logging ---
    let _log_guard = logger::setup_logging(&config.log).context("failed to set up logging")?;
    let target = &config.poll.target;
    info!(
        device = %format!("{}:{}", target.host, target.port),
        unit_id = target.unit_id,
        register_start = target.register_start,
        register_count = target.register_count,
        period_ms = config.poll.period.as_millis() as u64,
        overflow_policy = %config.overflow_policy,
        "Starting Modbus telemetry gateway"
    );

    // --- Phase 3: Shared State ---
    let shutdown = CancellationToken::new();
    let device = ModbusTcpClient::new(config.connect_timeout, config.read_timeout);
    let app_state = state::AppState::from_config(&config, device, shutdown.clone());

    // --- Phase 4: Subscriber Listener ---
    let listener = downstream::bind(config.bind_addr).await?;
    let mut server = tokio::spawn(downstream::serve(listener, app_state.clone()));

    // --- Phase 5: Run Until Signalled ---
    let server_result = tokio::select! {
        _ = wait_for_signal() => None,
        result = &mut server => Some(result),
    };

    app_state.supervisor.shutdown().await;

    let server_result = match server_result {
        Some(result) => result,
        None => server.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Downstream server failed."),
        Err(e) => error!(error = %e, "Downstream server task panicked."),
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_signal() {
    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Ctrl-C received, initiating shutdown."),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, initiating shutdown."),
            }
        }
        _ = terminate() => {
            info!("SIGTERM received, initiating shutdown.");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Could not install SIGTERM handler.");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await
}
