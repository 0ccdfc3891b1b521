//! tlswitness - a TLS endpoint that records the wire image of test
//! handshakes to detect interception.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tlswitness::capture::CaptureNotifier;
use tlswitness::reporter::{self, ReporterState};
use tlswitness::{
    certgen, CertificateLoader, Config, DemuxListener, FlashPolicyRule, FlashPolicyServer,
    HostClaimer, Storage, TlsConfigurator, TlsServer,
};

/// tlswitness - TLS interception test endpoint
#[derive(Parser, Debug)]
#[command(name = "tlswitness")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "TLSWITNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Write the effective configuration to a file and exit
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TLSWITNESS_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "TLSWITNESS_JSON_LOGS")]
    json_logs: bool,

    /// Run configuration validation only (don't start the server)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the rustls CryptoProvider before any TLS operations.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(path) = &args.write_config {
        config.write(path)?;
        info!("wrote configuration to {}", path.display());
        return Ok(());
    }

    config.validate()?;
    if args.validate {
        info!("configuration validation successful, exiting");
        return Ok(());
    }
    let config = Arc::new(config);

    info!("starting tlswitness v{}", env!("CARGO_PKG_VERSION"));
    info!("reporter host: {}", config.host_reporter);
    info!(
        "test suffixes: *{} *{}",
        config.host_suffix_ipv4, config.host_suffix_ipv6
    );

    if config.generate_missing_certificates {
        certgen::ensure_certificate(
            &config.reporter_certificate,
            &config.reporter_private_key,
            &[config.host_reporter.clone()],
        )?;
        certgen::ensure_certificate(
            &config.dummy_certificate,
            &config.dummy_private_key,
            &[
                format!("*{}", config.host_suffix_ipv4),
                format!("*{}", config.host_suffix_ipv6),
            ],
        )?;
    }

    let reporter_cert = Arc::new(CertificateLoader::new(
        &config.reporter_certificate,
        &config.reporter_private_key,
    ));
    reporter_cert
        .load()
        .context("failed to load reporter certificate")?;
    let dummy_cert = Arc::new(CertificateLoader::new(
        &config.dummy_certificate,
        &config.dummy_private_key,
    ));
    dummy_cert
        .load()
        .context("failed to load dummy certificate")?;

    if std::env::var_os("SSLKEYLOGFILE").is_some() {
        info!("TLS key logging to SSLKEYLOGFILE enabled");
    }

    let storage = Arc::new(Storage::open(&config.database_path)?);

    let policy = Arc::new(FlashPolicyServer::new(&[FlashPolicyRule {
        from_domain: config.host_reporter.clone(),
        to_ports: config.listen_port()?.to_string(),
    }]));
    if let Some(addr) = &config.flash_listen_address {
        let flash_listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to listen for flash policy server on {addr}"))?;
        info!("listening for flash policy requests on {addr}");
        let policy = policy.clone();
        tokio::spawn(async move {
            if let Err(e) = policy.serve(flash_listener).await {
                error!("flash policy listener failed: {e}");
            }
        });
    }

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_address))?;
    info!("listening on {}", config.listen_address);

    let claimer = Arc::new(HostClaimer::new(&config, storage.clone()));
    let (demux, queue) = DemuxListener::new(
        listener,
        config.initial_read_timeout(),
        config.origin_address.clone(),
        claimer,
        new_capture_ready(storage.clone()),
        policy,
    );
    tokio::spawn(async move {
        if let Err(e) = demux.serve().await {
            error!("listener failed: {e}");
        }
    });

    let reporter_router = reporter::router(Arc::new(ReporterState {
        storage,
        config: config.clone(),
    }));
    let configurator = Arc::new(TlsConfigurator::new(&config, reporter_cert, dummy_cert));
    TlsServer::new(configurator, reporter_router, &config)
        .serve(queue)
        .await;

    Ok(())
}

/// Persists finished server captures through storage.
fn new_capture_ready(storage: Arc<Storage>) -> CaptureNotifier {
    Arc::new(move |name, capture| {
        let storage = storage.clone();
        let name = name.to_string();
        // The insert is synchronous; hop off the async workers.
        tokio::task::spawn_blocking(move || match storage.insert_server_capture(&capture) {
            Ok(id) => info!("stored server capture for {name}: {id}"),
            Err(e) => error!("failed to create server capture: {e}"),
        });
    })
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}
