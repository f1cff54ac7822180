//! recproxy - recording forward HTTP proxy.
//!
//! Runs two listeners side by side:
//! - the recording proxy, which forwards requests and stores every response
//! - the admin server, which browses and clears the recorded captures

use std::net::{IpAddr, SocketAddr};
use std::panic;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use recproxy_proxy::{ProxyConfig, ProxyServer, DEFAULT_CAPTURE_ROOT};
use recproxy_server::{AdminConfig, AdminServer};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// recproxy - recording forward HTTP proxy
#[derive(Parser, Debug)]
#[command(name = "recproxy", version, about)]
struct Args {
    /// Port the recording proxy listens on
    #[arg(short = 'p', long)]
    proxy_port: u16,

    /// Port the admin server listens on
    #[arg(short = 'a', long, visible_alias = "http-port")]
    admin_port: u16,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "error")]
    log_level: String,

    /// IP address both listeners bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Directory captures and access logs are written under
    #[arg(long, default_value = DEFAULT_CAPTURE_ROOT)]
    capture_root: PathBuf,

    /// Seconds allowed to connect to an origin
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Seconds an origin may stay silent before the exchange is cut
    #[arg(long, default_value_t = 60)]
    idle_timeout: u64,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Args {
    fn log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    fn proxy_config(&self, capture_root: PathBuf) -> ProxyConfig {
        ProxyConfig::default()
            .with_addr(SocketAddr::new(self.bind, self.proxy_port))
            .with_capture_root(capture_root)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_idle_timeout(Duration::from_secs(self.idle_timeout))
    }

    fn admin_config(&self, capture_root: PathBuf) -> AdminConfig {
        AdminConfig::default()
            .with_addr(SocketAddr::new(self.bind, self.admin_port))
            .with_root(capture_root)
    }
}

/// Initialize logging, optionally with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("recproxy={},warn", args.log_level())));

    if let Some(log_dir) = &args.log_dir {
        let file_appender = std::fs::create_dir_all(log_dir).ok().and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(7)
                .filename_prefix("recproxy")
                .filename_suffix("log")
                .build(log_dir)
                .ok()
        });

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        tracing::warn!("File logging unavailable at {:?}, using console only", log_dir);
        return None;
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

fn install_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("PANIC: {}", panic_info);
        default_hook(panic_info);
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program.
    let _log_guard = init_logging(&args);
    install_panic_hook();

    tracing::info!("Starting recproxy...");
    tracing::debug!("Args: {:?}", args);

    std::fs::create_dir_all(&args.capture_root)
        .with_context(|| format!("cannot create capture root {:?}", args.capture_root))?;
    let capture_root = std::path::absolute(&args.capture_root)
        .with_context(|| format!("cannot resolve capture root {:?}", args.capture_root))?;
    tracing::info!("Recording into {:?}", capture_root);

    let proxy = ProxyServer::new(args.proxy_config(capture_root.clone()))
        .context("failed to create proxy")?
        .start()
        .await
        .context("failed to start proxy")?;

    let admin = match AdminServer::new(args.admin_config(capture_root)) {
        Ok(server) => server.start().await,
        Err(e) => Err(e),
    };
    let admin = match admin {
        Ok(admin) => admin,
        Err(e) => {
            proxy.stop().await;
            return Err(e).context("failed to start admin server");
        }
    };

    tracing::info!(
        "recproxy running (proxy on {}, admin on {})",
        proxy.addr(),
        admin.addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("recproxy shutting down");
    proxy.stop().await;
    admin.stop().await;
    Ok(())
}
