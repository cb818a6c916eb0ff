use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webrtc::ice::udp_mux::{UDPMux, UDPMuxDefault, UDPMuxParams};

use whep_playout::config::{self, ServerConfig};
use whep_playout::state::AppState;
use whep_playout::utils::{bind_tcp_listener, bind_udp_socket};
use whep_playout::web;
use whep_playout::webrtc::config::LocalMuxes;
use whep_playout::webrtc::{CapabilitySet, RtcTransportFactory, SessionManager};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// whep-playout command line arguments
#[derive(Parser, Debug)]
#[command(name = "whep-playout")]
#[command(version, about = "Play H.264 and Opus files to WHEP viewers", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Host candidate addresses, comma separated
    #[arg(long, env = "CANDIDATES", value_delimiter = ',', value_name = "IPS")]
    candidates: Option<Vec<String>>,

    /// Shared ICE UDP port (0 gives each session its own ports)
    #[arg(long, value_name = "PORT")]
    ice_udp_port: Option<u16>,

    /// Ogg/Opus audio file
    #[arg(long, value_name = "FILE")]
    audio_file: Option<PathBuf>,

    /// H.264 Annex B video file
    #[arg(long, value_name = "FILE")]
    video_file: Option<PathBuf>,

    /// Duration of one H.264 frame in milliseconds
    #[arg(long, value_name = "MS")]
    h264_frame_ms: Option<u64>,

    /// Use full ICE instead of ICE lite
    #[arg(long)]
    full_ice: bool,

    /// Enable HTTPS
    #[arg(long)]
    enable_https: bool,

    /// Path to SSL certificate file (generates self-signed if not provided)
    #[arg(long, value_name = "FILE", requires = "ssl_key")]
    ssl_cert: Option<PathBuf>,

    /// Path to SSL private key file
    #[arg(long, value_name = "FILE", requires = "ssl_cert")]
    ssl_key: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    // Required by rustls 0.23+ for both DTLS certificates and HTTPS
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing::info!("Starting whep-playout v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    apply_cli_overrides(&mut config, &args);
    config.validate()?;

    config.media.check()?;
    tracing::info!(
        "Playing video {} and audio {}",
        config.media.video_file.display(),
        config.media.audio_file.display()
    );

    let bind_ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address {}", config.web.bind_address))?;

    let mut muxes = LocalMuxes::default();
    if config.ice.udp_port != 0 {
        let addr = SocketAddr::new(bind_ip, config.ice.udp_port);
        let socket = bind_udp_socket(addr)
            .with_context(|| format!("binding ICE UDP port {}", addr))?;
        let socket = tokio::net::UdpSocket::from_std(socket)?;
        tracing::info!("ICE UDP mux listening on {}", addr);
        let mux: Arc<dyn UDPMux + Send + Sync> = UDPMuxDefault::new(UDPMuxParams::new(socket));
        muxes.udp = Some(mux);
    }

    let manager = SessionManager::new(
        Arc::new(RtcTransportFactory),
        Arc::new(config.media.clone()),
        CapabilitySet::default_whep(),
        config.transport_policy(muxes),
    );
    let state = AppState::new(manager.clone(), config.web.https_enabled);
    let app = web::create_router(state);

    let addr = SocketAddr::new(bind_ip, config.web.http_port);
    let listener = bind_tcp_listener(addr).with_context(|| format!("binding {}", addr))?;

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
    };

    if config.web.https_enabled {
        let tls_config = match (&config.web.ssl_cert_path, &config.web.ssl_key_path) {
            (Some(cert_path), Some(key_path)) => {
                RustlsConfig::from_pem_file(cert_path, key_path).await?
            }
            _ => {
                tracing::info!("Generating self-signed TLS certificate");
                let cert = generate_self_signed_cert()?;
                RustlsConfig::from_pem(
                    cert.cert.pem().into_bytes(),
                    cert.key_pair.serialize_pem().into_bytes(),
                )
                .await?
            }
        };

        tracing::info!("Starting HTTPS server on {}", addr);
        let server = axum_server::from_tcp_rustls(listener, tls_config)
            .serve(app.into_make_service());

        tokio::select! {
            _ = shutdown_signal => {}
            result = server => {
                if let Err(e) = result {
                    tracing::error!("HTTPS server error: {}", e);
                }
            }
        }
    } else {
        tracing::info!("Starting HTTP server on {}", addr);
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let server = axum::serve(listener, app);

        tokio::select! {
            _ = shutdown_signal => {}
            result = server => {
                if let Err(e) = result {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
        }
    }

    manager.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Command-line flags win over the configuration file
fn apply_cli_overrides(config: &mut ServerConfig, args: &CliArgs) {
    if let Some(address) = &args.address {
        config.web.bind_address = address.clone();
    }
    if let Some(port) = args.port {
        config.web.http_port = port;
    }
    if let Some(candidates) = &args.candidates {
        config.ice.nat_1to1_ips = candidates
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
    }
    if let Some(port) = args.ice_udp_port {
        config.ice.udp_port = port;
    }
    if args.full_ice {
        config.ice.lite = false;
    }
    if let Some(path) = &args.audio_file {
        config.media.audio_file = path.clone();
    }
    if let Some(path) = &args.video_file {
        config.media.video_file = path.clone();
    }
    if let Some(ms) = args.h264_frame_ms {
        config.media.h264_frame_ms = ms;
    }
    if args.enable_https {
        config.web.https_enabled = true;
    }
    if let Some(cert_path) = &args.ssl_cert {
        config.web.ssl_cert_path = Some(cert_path.to_string_lossy().to_string());
    }
    if let Some(key_path) = &args.ssl_key {
        config.web.ssl_key_path = Some(key_path.to_string_lossy().to_string());
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "whep_playout=error,tower_http=error",
        LogLevel::Warn => "whep_playout=warn,tower_http=warn",
        LogLevel::Info => "whep_playout=info,tower_http=info",
        LogLevel::Verbose => "whep_playout=debug,tower_http=info",
        LogLevel::Debug => "whep_playout=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "whep_playout=trace,tower_http=debug,webrtc=debug",
    };

    // RUST_LOG takes priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Generate a self-signed TLS certificate
fn generate_self_signed_cert() -> anyhow::Result<rcgen::CertifiedKey> {
    let subject_alt_names = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];
    Ok(rcgen::generate_simple_self_signed(subject_alt_names)?)
}
