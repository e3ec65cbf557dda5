// CLI entry point for the MetaRoom sync relays.
//
// Starts the front-end relay on `--port` and, with `--multiuser`, the
// object-sync relay on `--port + 1`. Both run until SIGINT or SIGTERM, then
// close every connection with 1001 so clients reconnect once the relay is
// back. See `server.rs` for the networking architecture and `session.rs` for
// the message handling.
//
// Logging goes through `tracing`; `RUST_LOG` overrides the default level
// (`info`, or `debug` with `--debug`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use metaroom_relay::server::{RelayConfig, RelayHandle, start_relay};
use metaroom_relay::session::RelayRole;
use metaroom_relay::tls::TlsConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "MetaRoom multi-user sync relay")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Front-end relay port. The object-sync relay uses the next port.
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Broadcast interval in milliseconds.
    #[arg(short, long, default_value_t = 3000)]
    interval: u64,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    debug: bool,

    /// Serve wss:// using --tls-cert and --tls-key.
    #[arg(long)]
    enable_tls: bool,

    #[arg(long, requires = "enable_tls")]
    tls_cert: Option<PathBuf>,

    #[arg(long, requires = "enable_tls")]
    tls_key: Option<PathBuf>,

    /// Also run the object-sync relay on port + 1.
    #[arg(long)]
    multiuser: bool,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    heartbeat: u64,

    /// Directory that Write_Files and Watch_Files resolve against.
    #[arg(long, default_value = ".")]
    content_root: PathBuf,

    /// Ignore Watch_Files requests.
    #[arg(long)]
    no_watch: bool,
}

impl Args {
    fn tls(&self) -> Result<Option<TlsConfig>> {
        if !self.enable_tls {
            return Ok(None);
        }
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            bail!("--enable-tls requires --tls-cert and --tls-key");
        };
        Ok(Some(TlsConfig {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        }))
    }

    fn relay_config(&self) -> Result<RelayConfig> {
        Ok(RelayConfig {
            host: self.host.clone(),
            port: self.port,
            role: RelayRole::FrontEnd,
            broadcast_interval: Duration::from_millis(self.interval),
            heartbeat_interval: Duration::from_millis(self.heartbeat),
            content_root: self.content_root.clone(),
            watch_files: !self.no_watch,
            tls: self.tls()?,
            ..RelayConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let front_end = args.relay_config()?;
    let object_sync = args.multiuser.then(|| RelayConfig {
        role: RelayRole::ObjectSync,
        port: sync_port(front_end.port),
        watch_files: false,
        ..front_end.clone()
    });

    let mut handles: Vec<RelayHandle> = Vec::new();
    let (handle, addr) = start_relay(front_end)
        .await
        .context("failed to start front-end relay")?;
    info!(%addr, "front-end relay ready");
    handles.push(handle);

    if let Some(config) = object_sync {
        let (handle, addr) = start_relay(config)
            .await
            .context("failed to start object-sync relay")?;
        info!(%addr, "object-sync relay ready");
        handles.push(handle);
    }

    wait_for_shutdown_signal().await?;

    for handle in handles {
        handle.stop().await;
    }
    info!("relay stopped");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

/// Port for the object-sync relay. Port 0 stays 0 (ephemeral).
fn sync_port(port: u16) -> u16 {
    if port == 0 { 0 } else { port.saturating_add(1) }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                info!("received SIGINT, shutting down");
            }
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        info!("received Ctrl+C, shutting down");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["relay"]);
        let config = args.relay_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.broadcast_interval, Duration::from_millis(3000));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.watch_files);
        assert!(config.tls.is_none());
        assert!(!args.multiuser);
    }

    #[test]
    fn short_flags() {
        let args = Args::parse_from(["relay", "-p", "4000", "-i", "500", "-d", "--multiuser"]);
        assert_eq!(args.port, 4000);
        assert_eq!(args.interval, 500);
        assert!(args.debug);
        assert!(args.multiuser);
    }

    #[test]
    fn tls_needs_both_files() {
        let args = Args::parse_from(["relay", "--enable-tls", "--tls-cert", "c.pem"]);
        assert!(args.relay_config().is_err());
        let args = Args::parse_from([
            "relay",
            "--enable-tls",
            "--tls-cert",
            "c.pem",
            "--tls-key",
            "k.pem",
        ]);
        let tls = args.relay_config().unwrap().tls.unwrap();
        assert_eq!(tls.key_path, PathBuf::from("k.pem"));
    }

    #[test]
    fn sync_port_is_next_port() {
        assert_eq!(sync_port(3000), 3001);
        assert_eq!(sync_port(0), 0);
        assert_eq!(sync_port(u16::MAX), u16::MAX);
    }
}
