mod config;
mod engine;
mod handlers;
mod health;
mod metrics;
mod patch;
mod policies;
mod review;
mod tls;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "k8s-hardener",
    about = "Mutating admission webhook that injects pod and container security defaults"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/hardener/config.yaml", env = "HARDENER_CONFIG")]
    config: String,

    /// File containing the x509 certificate for HTTPS (CA cert, if any, concatenated after server cert)
    #[arg(short = 'c', long = "tls-cert-file")]
    tls_cert_file: Option<String>,

    /// File containing the x509 private key matching --tls-cert-file
    #[arg(short = 'k', long = "tls-private-key-file")]
    tls_private_key_file: Option<String>,

    /// Secure port that the webhook listens on
    #[arg(short = 'p', long)]
    port: Option<u16>,
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
                _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
            },
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("received CTRL+C, starting graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            error!("failed to listen for ctrl_c: {e}");
        }
        info!("received CTRL+C, starting graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}

async fn run_https_server(
    listener: TcpListener,
    tls_acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    router: Router,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept TCP connection: {e}");
                        continue;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("HTTPS server shutting down");
                break;
            }
        };

        let tls_acceptor = tls_acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream =
                match tokio::time::timeout(handshake_timeout, tls_acceptor.accept(tcp_stream)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        error!(%remote_addr, "TLS handshake failed: {e}");
                        return;
                    }
                    Err(_) => {
                        warn!(%remote_addr, "TLS handshake timed out");
                        return;
                    }
                };

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(router.into_service());

            if let Err(e) = HttpBuilder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!(%remote_addr, "error serving connection: {e}");
            }
        });
    }
}

async fn run_http_server(listener: TcpListener, router: Router, mut shutdown_rx: watch::Receiver<()>) {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("HTTP server shutting down");
        })
        .await
        .unwrap_or_else(|e| error!("HTTP server error: {e}"));
}

fn parse_addr(name: &str, addr: &str) -> SocketAddr {
    addr.parse().unwrap_or_else(|e| {
        eprintln!("Invalid {name} '{addr}': {e}");
        std::process::exit(1);
    })
}

async fn bind(name: &str, addr: SocketAddr) -> TcpListener {
    TcpListener::bind(addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {name} on {addr}: {e}");
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("Failed to install default CryptoProvider");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let mut config = config::HardenerConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load config from {}: {e}", cli.config);
        std::process::exit(1);
    });
    if let Some(cert) = cli.tls_cert_file {
        config.tls_cert_path = cert;
    }
    if let Some(key) = cli.tls_private_key_file {
        config.tls_key_path = key;
    }
    if let Some(port) = cli.port {
        config.set_listen_port(port);
    }

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        log_level = %config.log_level,
        policy.default_uid = config.policy.default_uid,
        policy.opt_out_label = %config.policy.opt_out_label,
        policy.opt_out_value = %config.policy.opt_out_value,
        "k8s-hardener starting"
    );

    let tls_config = tls::load_server_config(&config.tls_cert_path, &config.tls_key_path)
        .unwrap_or_else(|e| {
            eprintln!("Failed to load TLS config: {e}");
            std::process::exit(1);
        });
    let tls_acceptor = TlsAcceptor::from(tls_config);

    let mut registry = Registry::default();
    let hardener_metrics = metrics::HardenerMetrics::new(&mut registry);
    let registry = Arc::new(registry);

    let app_state = Arc::new(handlers::AppState {
        engine: engine::AdmissionEngine::new(&config.policy),
        metrics: hardener_metrics,
    });

    let webhook_router = Router::new()
        .route("/mutate", post(handlers::handle_mutate))
        .route("/mutate-pods", post(handlers::handle_mutate))
        .route("/readyz", get(health::healthz))
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .with_state(app_state);

    let ready = Arc::new(AtomicBool::new(false));
    let metrics_router = health::router(Arc::new(health::HealthState {
        registry,
        ready: ready.clone(),
    }));

    let listen_addr = parse_addr("listen_addr", &config.listen_addr);
    let metrics_addr = parse_addr("metrics_addr", &config.metrics_addr);
    let https_listener = bind("HTTPS", listen_addr).await;
    let http_listener = bind("HTTP", metrics_addr).await;

    info!(%listen_addr, "HTTPS webhook server listening");
    info!(%metrics_addr, "HTTP metrics/health server listening");
    ready.store(true, Ordering::Relaxed);

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let https_shutdown_rx = shutdown_rx.clone();
    let http_shutdown_rx = shutdown_rx;

    tokio::spawn(shutdown_signal(shutdown_tx));

    tokio::join!(
        run_https_server(
            https_listener,
            tls_acceptor,
            Duration::from_secs(config.handshake_timeout_secs),
            webhook_router,
            https_shutdown_rx,
        ),
        run_http_server(http_listener, metrics_router, http_shutdown_rx),
    );

    info!("k8s-hardener shut down gracefully");
}
