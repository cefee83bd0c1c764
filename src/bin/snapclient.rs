//! Snapcast Client Application
//!
//! Connects to a Snapcast server and plays the synchronized stream on the
//! default (or configured) output device.
//!
//! Usage: `snapclient [host[:port]]`

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snapcast_client::{audio::device::Sink, ClientConfig, SnapClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Snapcast client {}", env!("CARGO_PKG_VERSION"));

    let mut config = ClientConfig::load_or_default().context("Failed to load config")?;
    if let Some(target) = std::env::args().nth(1) {
        match target.rsplit_once(':') {
            Some((host, port)) => {
                config.server.host = host.to_string();
                config.server.port = port
                    .parse()
                    .with_context(|| format!("Invalid port in {}", target))?;
            }
            None => config.server.host = target,
        }
    }

    let sink = open_sink(&config)?;
    let mut client = SnapClient::new(config, sink).context("Invalid configuration")?;
    client.begin().context("Failed to start client")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down..."),
        _ = client.wait() => tracing::error!("Session stopped"),
    }

    client.end().await?;
    Ok(())
}

#[cfg(feature = "output-cpal")]
fn open_sink(config: &ClientConfig) -> Result<Box<dyn Sink>> {
    use snapcast_client::audio::device::list_output_devices;

    println!("\n=== Available Output Devices ===");
    for device in list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    Ok(Box::new(snapcast_client::audio::device::CpalSink::new(
        config.output.device.clone(),
    )))
}

#[cfg(not(feature = "output-cpal"))]
fn open_sink(_config: &ClientConfig) -> Result<Box<dyn Sink>> {
    tracing::warn!("Built without audio output, discarding audio");
    Ok(Box::new(snapcast_client::audio::device::NullSink::new()))
}
