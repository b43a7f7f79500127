// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `plugd` daemon and one-shot control commands.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use plugd::api::{self, StatusResponse, SwitchResponse};
use plugd::config::{DeviceConfig, DiscoveryConfig, ReconnectionPolicy, SessionConfig};
use plugd::discovery::DiscoveryResponder;
use plugd::protocol::{BridgeCommand, BridgeTransport, DeviceTransport, SimulatedTransport};
use plugd::{Dps, Plug, PowerState, ProtocolVersion};

/// Local-network control daemon for a single smart plug.
#[derive(Parser, Debug)]
#[command(name = "plugd")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Device id.
    #[arg(long, env = "DEVICEID")]
    device_id: String,

    /// Device local key (16 characters).
    #[arg(long, env = "LOCALKEY", hide_env_values = true)]
    local_key: String,

    /// Static device address; the bridge searches the LAN when omitted.
    #[arg(long, env = "DEVICE_IP")]
    device_ip: Option<IpAddr>,

    /// Device protocol version (3.1, 3.3, 3.4, 3.5).
    #[arg(long, env = "DEVICE_VERSION", default_value = "3.4")]
    protocol_version: ProtocolVersion,

    /// Data point carrying the power switch.
    #[arg(long, env = "PLUGD_POWER_DPS", default_value = "1")]
    power_dps: Dps,

    /// Address the HTTP API binds to.
    #[arg(long, env = "PLUGD_HTTP_ADDR", default_value = "0.0.0.0:3000")]
    http_addr: SocketAddr,

    /// UDP port answering discovery probes.
    #[arg(long, env = "PLUGD_DISCOVERY_PORT", default_value_t = DiscoveryConfig::DEFAULT_PORT)]
    discovery_port: u16,

    /// Token a discovery probe must contain.
    #[arg(long, env = "PLUGD_DISCOVERY_MARKER", default_value = DiscoveryConfig::DEFAULT_MARKER)]
    discovery_marker: String,

    /// Seconds the plug may stay on before it is switched off.
    #[arg(long, env = "PLUGD_AUTO_OFF_SECS", default_value_t = 1800)]
    auto_off_secs: u64,

    /// Deadline for each device operation, in milliseconds.
    #[arg(long, env = "PLUGD_TIMEOUT_MS", default_value_t = 5000)]
    timeout_ms: u64,

    /// Delay before reconnecting after the device drops the session.
    #[arg(long, env = "PLUGD_RECONNECT_DELAY_SECS", default_value_t = 5)]
    reconnect_delay_secs: u64,

    /// Reconnect attempts after a drop (0 disables automatic reconnection).
    #[arg(long, env = "PLUGD_RECONNECT_ATTEMPTS", default_value_t = 1)]
    reconnect_attempts: u32,

    /// Bridge command line, e.g. "node bridge.js".
    #[arg(long, env = "PLUGD_BRIDGE", required_unless_present = "simulate")]
    bridge: Option<String>,

    /// Use an in-memory plug instead of a bridge.
    #[arg(long, env = "PLUGD_SIMULATE")]
    simulate: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, Default)]
enum Command {
    /// Run the daemon (default).
    #[default]
    Serve,
    /// Print the power state and exit.
    Status,
    /// Switch the plug on and exit.
    On,
    /// Switch the plug off and exit.
    Off,
    /// Check that the device is reachable and exit.
    Connect,
}

impl Args {
    fn device_config(&self) -> Result<DeviceConfig> {
        let device = DeviceConfig::new(&self.device_id, &self.local_key)
            .context("Invalid device credentials")?
            .with_version(self.protocol_version)
            .with_power_dps(self.power_dps);

        Ok(match self.device_ip {
            Some(ip) => device.with_ip(ip),
            None => device,
        })
    }

    fn session_config(&self) -> Result<SessionConfig> {
        let reconnection = if self.reconnect_attempts == 0 {
            ReconnectionPolicy::disabled()
        } else {
            ReconnectionPolicy::new()
                .with_max_retries(self.reconnect_attempts)
                .with_initial_delay(Duration::from_secs(self.reconnect_delay_secs))
        };

        let config = SessionConfig::new()
            .with_operation_timeout(Duration::from_millis(self.timeout_ms))
            .with_auto_off_delay(Duration::from_secs(self.auto_off_secs))
            .with_reconnection(reconnection);
        config.validate().context("Invalid timing configuration")?;
        Ok(config)
    }

    fn discovery_config(&self) -> Result<DiscoveryConfig> {
        DiscoveryConfig::new(self.discovery_port, &self.discovery_marker)
            .context("Invalid discovery configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let device = args.device_config()?;
    let session = args.session_config()?;
    let command = args.command.unwrap_or_default();

    if args.simulate {
        info!("Using simulated plug");
        return run(SimulatedTransport::new(), device, session, &args, command).await;
    }

    let bridge = BridgeCommand::parse(args.bridge.as_deref().unwrap_or_default())
        .context("Invalid bridge command")?
        .for_device(&device);
    run(BridgeTransport::new(bridge), device, session, &args, command).await
}

async fn run<T: DeviceTransport>(
    transport: T,
    device: DeviceConfig,
    session: SessionConfig,
    args: &Args,
    command: Command,
) -> Result<()> {
    let plug = Plug::new(transport, device, session)?;

    match command {
        Command::Serve => serve(plug, args).await,
        Command::Status => {
            let result = plug.status().await;
            plug.shutdown().await;
            let body = StatusResponse { status: result? };
            println!("{}", serde_json::to_string(&body)?);
            Ok(())
        }
        Command::On | Command::Off => {
            let desired = if matches!(command, Command::On) {
                PowerState::On
            } else {
                PowerState::Off
            };
            let result = plug.switch(desired).await;
            plug.shutdown().await;
            result?;
            println!("{}", serde_json::to_string(&SwitchResponse { success: true })?);
            Ok(())
        }
        Command::Connect => {
            let result = plug.connect().await;
            plug.shutdown().await;
            result?;
            println!("Connected to device!");
            Ok(())
        }
    }
}

async fn serve<T: DeviceTransport>(plug: Plug<T>, args: &Args) -> Result<()> {
    let discovery = args.discovery_config()?;
    let responder = DiscoveryResponder::bind(&discovery)
        .with_context(|| format!("Failed to bind discovery port {}", discovery.port))?;
    let listener = TcpListener::bind(args.http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP address {}", args.http_addr))?;

    info!("plugd v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let discovery_task = tokio::spawn(responder.run(shutdown.clone()));
    let mut http_task = tokio::spawn(api::serve(listener, plug.clone(), shutdown.clone()));

    let connecting = plug.clone();
    tokio::spawn(async move {
        if let Err(e) = connecting.connect().await {
            warn!(error = %e, "Initial connection failed, retrying on first request");
        }
    });

    let finished = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, cleaning up");
            None
        }
        joined = &mut http_task => Some(joined),
    };

    shutdown.cancel();
    let http_result = match finished {
        Some(joined) => joined,
        None => http_task.await,
    };
    if let Err(e) = discovery_task.await {
        warn!(error = %e, "Discovery task failed");
    }

    plug.shutdown().await;

    http_result
        .context("HTTP server task failed")?
        .context("HTTP server failed")?;
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
