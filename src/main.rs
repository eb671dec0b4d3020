use anyhow::Result;
use clap::Parser;
use gstreamer as gst;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod clock;
mod config;
mod display;
mod error;
mod gamepad;
mod input;
mod pipeline;
mod session;
mod signaling;
mod transport;
mod webrtc;

use crate::config::Config;
use crate::session::SessionManager;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to a TOML configuration file. Falls back to built-in defaults
    /// when omitted.
    #[arg(long)]
    config: Option<String>,

    /// Overrides `server.bind-addr` from the config file.
    #[arg(long)]
    bind: Option<String>,

    /// Overrides the tracing log level (e.g. "info", "debug").
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Uses a synthetic `videotestsrc` source instead of the real display
    /// capture, for running sessions without an X server.
    #[arg(long)]
    test_mode: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(?args, "starting up");

    gst::init()?;

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    let config = Arc::new(config);

    let sessions = Arc::new(SessionManager::new(config.clone()));

    let health_addr = health_bind_addr(&config.server.bind_addr);
    let health_sessions = sessions.clone();
    let health_config = config.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = signaling::run_health_server(&health_addr, health_config, health_sessions).await {
            error!(error = %e, "health server failed");
        }
    });

    let signaling_sessions = sessions.clone();
    let bind_addr = config.server.bind_addr.clone();
    let test_mode = args.test_mode;
    let signaling_handle = tokio::spawn(async move {
        if let Err(e) = signaling::run_signaling_loop(&bind_addr, signaling_sessions, test_mode).await {
            error!(error = %e, "signaling server failed");
        }
    });

    let _ = tokio::join!(health_handle, signaling_handle);
    Ok(())
}

/// Health endpoint listens one port above the signaling bind address so both
/// can run without a shared listener.
fn health_bind_addr(signaling_bind: &str) -> String {
    match signaling_bind.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => format!("{host}:{}", port + 1),
            Err(_) => "0.0.0.0:8081".to_string(),
        },
        None => "0.0.0.0:8081".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_addr_increments_port() {
        assert_eq!(health_bind_addr("0.0.0.0:8080"), "0.0.0.0:8081");
    }

    #[test]
    fn health_addr_falls_back_on_bad_port() {
        assert_eq!(health_bind_addr("not-an-addr"), "0.0.0.0:8081");
    }
}
