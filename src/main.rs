use std::{fs::File, io::BufReader, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use axum::{
    Router,
    serve::{Listener, ListenerExt},
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures_util::StreamExt;
use gatehouse::{
    BootstrapError, GatewayService,
    adapters::{FileSystemAdapter, HttpClientAdapter, HttpHandler, PluginSet, PoolSettings, build_plugins},
    config::{
        DEFAULT_CONFIG_TOML, GatewayConfig, GatewayConfigValidator, ProxyOptions, TlsConfig,
        ValidationError, load_config,
    },
    core::gateway::HttpClientFactory,
    metrics,
    ports::http_client::HttpClient,
    tracing_setup,
    utils::{GracefulShutdown, InFlightTracker},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tower_http::compression::CompressionLayer;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

struct AxumListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for AxumListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!("Accept error: {}", e),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Everything needed to serve, assembled before the first connection is accepted.
struct Server {
    app: Router,
    listener: tokio::net::TcpListener,
    tls: Option<tokio_rustls::TlsAcceptor>,
    plugins: PluginSet,
    inflight: Arc<InFlightTracker>,
    graceful_shutdown: Arc<GracefulShutdown>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve_command(&config).await,
        None => serve_command(&args.config).await,
    }
}

async fn serve_command(config_path: &str) -> Result<()> {
    let config = match load_config(config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {config_path}: {e:#}");
            std::process::exit(BootstrapError::InvalidConfig(e.to_string()).exit_code());
        }
    };

    tracing_setup::init_from_config(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics();

    if let Err(e) = check_config(&config) {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(e.exit_code());
    }

    let server = match start(&config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Gateway failed to start");
            std::process::exit(e.exit_code());
        }
    };

    server.run().await?;
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Map validation problems onto the startup failure they would cause.
fn check_config(config: &GatewayConfig) -> Result<(), BootstrapError> {
    let errors = GatewayConfigValidator::collect_errors(config);
    let Some(first) = errors.first() else {
        return Ok(());
    };
    for error in &errors {
        tracing::error!(%error, "Configuration problem");
    }
    let message = first.to_string();
    Err(match first {
        ValidationError::InvalidListenAddress { .. } | ValidationError::InvalidTls { .. } => {
            BootstrapError::InvalidListener(message)
        }
        ValidationError::MountConflict { message } => BootstrapError::DuplicateMount(message.clone()),
        _ => BootstrapError::InvalidConfig(message),
    })
}

fn http_client_factory() -> HttpClientFactory {
    Arc::new(|options: &ProxyOptions| {
        let client: Arc<dyn HttpClient> = Arc::new(
            HttpClientAdapter::new(PoolSettings::from(options))
                .context("Failed to create HTTP client adapter")?,
        );
        Ok(client)
    })
}

async fn start(config: &GatewayConfig) -> Result<Server, BootstrapError> {
    let plugins = build_plugins(config)?;
    let gateway = GatewayService::bootstrap(
        config,
        plugins.registry.clone(),
        Arc::new(FileSystemAdapter::new()),
        http_client_factory(),
    )?;

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| BootstrapError::InvalidListener(format!("{}: {e}", config.listen_addr)))?;
    let tls = config.tls.as_ref().map(tls_acceptor).transpose()?;

    let graceful_shutdown = Arc::new(GracefulShutdown::with_grace_period(Duration::from_secs(
        config.shutdown_grace_secs,
    )));
    let inflight = Arc::new(InFlightTracker::new());
    let handler = HttpHandler::new(
        Arc::new(gateway),
        config.requests_limit,
        inflight.clone(),
        graceful_shutdown.shutdown_flag(),
    )
    .with_tls(tls.is_some());
    let app = handler.into_router().layer(CompressionLayer::new());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BootstrapError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

    for mount in &config.mounts {
        tracing::info!(
            location = %mount.location,
            kind = ?mount.kind,
            secured = mount.secured,
            "Configured mount"
        );
    }

    Ok(Server {
        app,
        listener,
        tls,
        plugins,
        inflight,
        graceful_shutdown,
    })
}

fn tls_acceptor(tls: &TlsConfig) -> Result<tokio_rustls::TlsAcceptor, BootstrapError> {
    use rustls_pemfile::{certs, pkcs8_private_keys};

    let invalid = BootstrapError::InvalidListener;

    let cert_file = File::open(&tls.cert_path)
        .map_err(|e| invalid(format!("failed to open cert file {}: {e}", tls.cert_path)))?;
    let key_file = File::open(&tls.key_path)
        .map_err(|e| invalid(format!("failed to open key file {}: {e}", tls.key_path)))?;

    let cert_chain = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(format!("invalid certificate: {e}")))?;
    let key = pkcs8_private_keys(&mut BufReader::new(key_file))
        .next()
        .transpose()
        .map_err(|e| invalid(format!("invalid private key: {e}")))?
        .ok_or_else(|| invalid("No PKCS#8 private key found in key file".to_string()))?;

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .map_err(|e| invalid(format!("invalid TLS configuration: {e}")))?;

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)))
}

impl Server {
    async fn run(self) -> Result<()> {
        let Server {
            app,
            listener,
            tls,
            plugins,
            inflight,
            graceful_shutdown,
        } = self;

        let signal_handler_shutdown = graceful_shutdown.clone();
        tokio::spawn(async move {
            signal_handler_shutdown.run_signal_handler().await;
        });
        let maintenance = plugins.spawn_maintenance(&graceful_shutdown.shutdown_token());

        let local_addr = listener.local_addr().context("Failed to get local addr")?;
        tracing::info!(
            addr = %local_addr,
            tls = tls.is_some(),
            "Gatehouse listening"
        );
        let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

        let server_result = if let Some(acceptor) = tls {
            let tls_listener = AxumListener {
                stream: tls_listener::TlsListener::new(acceptor, listener),
                local_addr,
            }
            .tap_io(|_io| {});
            tokio::select! {
                result = axum::serve(tls_listener, make_service) => result.context("Server error"),
                reason = graceful_shutdown.wait_for_shutdown_signal() => {
                    tracing::info!(?reason, "Shutdown signal received");
                    Ok(())
                }
            }
        } else {
            tokio::select! {
                result = axum::serve(listener, make_service) => result.context("Server error"),
                reason = graceful_shutdown.wait_for_shutdown_signal() => {
                    tracing::info!(?reason, "Shutdown signal received");
                    Ok(())
                }
            }
        };
        server_result?;

        // The listener is closed; connections already accepted keep running
        let grace = graceful_shutdown.grace_period();
        if !inflight.wait_for_drain(grace).await {
            tracing::warn!(
                remaining = inflight.active(),
                grace_secs = grace.as_secs(),
                "Grace period elapsed with requests still in flight"
            );
        }

        for handle in maintenance {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: Configuration file '{config_path}' not found");
        std::process::exit(BootstrapError::InvalidConfig(config_path.to_string()).exit_code());
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(BootstrapError::InvalidConfig(e.to_string()).exit_code());
        }
    };

    let errors = GatewayConfigValidator::collect_errors(&config);
    if !errors.is_empty() {
        eprintln!("Configuration validation failed:");
        for error in &errors {
            eprintln!("   - {error}");
        }
        let code = check_config(&config).map_or_else(|e| e.exit_code(), |_| 2);
        std::process::exit(code);
    }

    // Plugin args are only checked by instantiating them
    if let Err(e) = build_plugins(&config) {
        eprintln!("Plugin configuration failed: {e}");
        std::process::exit(e.exit_code());
    }

    println!("Configuration validation: OK");
    println!();
    println!("Configuration Summary:");
    println!("   - Listen Address: {}", config.listen_addr);
    println!("   - Mounts: {}", config.mounts.len());
    println!("   - Mechanisms: {}", config.security.mechanisms.len());
    println!("   - Authorizers: {}", config.security.authorizers.len());
    println!("   - TLS Enabled: {}", config.tls.is_some());
    Ok(())
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, DEFAULT_CONFIG_TOML)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'gatehouse serve --config {config_path}' to start the server");
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{extract::ConnectInfo, routing::get};

    use super::*;

    #[tokio::test]
    async fn test_stream_listener_serves_with_connect_info() {
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = tcp.local_addr().unwrap();
        let stream = futures_util::stream::unfold(tcp, |tcp| async move {
            let accepted = tcp.accept().await;
            Some((accepted, tcp))
        })
        .boxed();
        let listener = AxumListener { stream, local_addr }.tap_io(|_io| {});

        let app = Router::new().route(
            "/",
            get(|ConnectInfo(peer): ConnectInfo<SocketAddr>| async move { peer.ip().to_string() }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        let body = reqwest::get(format!("http://{local_addr}/"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "127.0.0.1");
    }
}
