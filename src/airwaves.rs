//! Coordination server for synchronized group listening
//!
//! Airwaves keeps a small fleet of devices, each streaming the same track
//! from its own music provider account, tuned to one shared "station": the
//! same track, the same position, the same queue, one DJ in charge. The
//! server never touches audio; it coordinates.
//!
//! Airwaves consists of four main components:
//!
//! * Identity and admission: bearer tokens ([auth]) and sliding-window
//!   gates ([rate_limit]) fronting the expensive entry points
//! * The [registry]: all active sessions, their join codes, and the user
//!   directory that assigns every listener a stable station frequency
//! * The [session] core: the authoritative playback state machine with its
//!   autonomous queue-advancement timer
//! * The transport layer ([net], [handlers]): JSON over HTTP and WebSocket,
//!   with liveness pings and ordered broadcasts
//!
//! All state is in memory. A restart empties the airwaves; that is a
//! documented property, not a bug.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use axum::routing::{any, get, post};
use axum::Router;
use clap::Parser;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod auth;
mod handlers;
mod net;
mod protocol;
mod rate_limit;
mod registry;
mod session;

/// Shared state between the components of the server
///
/// One instance per process, handed to every handler and timer. Each piece
/// guards its own interior so independent sessions never contend.
pub struct AppState {
    /// Mints and verifies bearer tokens
    pub tokens: auth::TokenService,

    /// Sessions, join codes and the user directory
    pub registry: registry::Registry,

    /// Session creation gate: 5 per principal per hour
    pub create_gate: rate_limit::SlidingWindow,

    /// Join attempt gate: 10 per source address per minute
    pub join_gate: rate_limit::SlidingWindow,

    /// Inform the server that shutdown was requested programmatically
    pub abort: tokio::sync::Notify,
}

impl AppState {
    pub fn new(jwt_secret: Option<String>) -> Self {
        Self {
            tokens: auth::TokenService::new(jwt_secret),
            registry: Default::default(),
            create_gate: rate_limit::SlidingWindow::new(5, 60.0 * 60.0 * 1000.0),
            join_gate: rate_limit::SlidingWindow::new(10, 60.0 * 1000.0),
            abort: Default::default(),
        }
    }
}

/// Wall-clock time in milliseconds since the Unix epoch
///
/// Every anchor, TTL and envelope timestamp in the system is expressed in
/// this clock.
pub fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

#[derive(Parser, Debug)]
#[command(version)]
/// Airwaves is a coordination server that keeps group-listening devices in sync
struct Cli {
    /// IP to bind
    #[arg(long, default_value_t = String::from("0.0.0.0"))]
    ip: String,

    /// Listen port
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Token signing secret; a random one is generated when absent
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Disable colors. Overwrites NO_COLOR environment variable
    #[arg(long = "no-color", default_value_t = false)]
    disable_colors: bool,
}

/// Path to the logs location, based on OS convention
fn log_path() -> PathBuf {
    let path = dirs::cache_dir()
        .expect("documentation states that this function should work on all platforms")
        .join("airwaves");
    std::fs::create_dir_all(&path).expect("creating log directory");
    path
}

/// Initialize the logging system
///
/// Events go both to the terminal and into daily log files, so operators can
/// reconstruct what a station did after the fact.
fn setup_logging_system(cli: &Cli) -> tracing_appender::non_blocking::WorkerGuard {
    let log_file_appender = tracing_appender::rolling::daily(log_path(), "logs");
    let (log_file_appender, guard) = tracing_appender::non_blocking(log_file_appender);

    // https://no-color.org/
    let disable_colors = cli.disable_colors
        || std::env::var("NO_COLOR")
            .map(|x| !x.is_empty())
            .unwrap_or(false);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "airwaves=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(!disable_colors)
                .and_then(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(log_file_appender),
                ),
        )
        .init();
    guard
}

/// Initialize the server: mount routes, start the sweepers, listen until a
/// shutdown signal arrives, then take every station off the air cleanly.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = setup_logging_system(&cli);

    tracing::info!("starting up version {}", env!("CARGO_PKG_VERSION"));

    let app_state = Arc::new(AppState::new(cli.jwt_secret.clone()));

    let sweepers = [
        tokio::spawn(session::idle_sweep_loop(app_state.clone())),
        tokio::spawn(net::liveness_sweep_loop(app_state.clone())),
        tokio::spawn(rate_limit::sweep_loop(app_state.clone())),
    ];

    let app = Router::new()
        .route("/", any(net::websocket_handler))
        .route("/health", get(handlers::health))
        .route("/auth", post(handlers::mint_token))
        .route("/sessions", post(handlers::create_session))
        .route("/sessions/join", post(handlers::join_session))
        .route("/sessions/join-by-id", post(handlers::join_session_by_id))
        .route("/sessions/{id}", get(handlers::session_snapshot))
        .route("/stations", get(handlers::stations))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .with_state(app_state.clone());

    let Ok(ip) = cli.ip.parse::<IpAddr>() else {
        tracing::error!("{ip:?} is not a valid IP address to bind", ip = cli.ip);
        return ExitCode::FAILURE;
    };
    let addr = SocketAddr::from((ip, cli.port));
    let Ok(listener) = tokio::net::TcpListener::bind(addr).await else {
        tracing::error!("Address already in use at http://{addr}");
        return ExitCode::FAILURE;
    };

    let display_address = if addr.ip().is_unspecified() {
        SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), addr.port())
    } else {
        addr
    };

    let server = {
        let app_state = app_state.clone();

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let ctrl_c = async {
                tokio::signal::ctrl_c()
                    .await
                    .expect("failed to install CTRL-C handler")
            };

            #[cfg(unix)]
            let terminate = async {
                use tokio::signal::unix::{signal, SignalKind};
                signal(SignalKind::terminate())
                    .expect("failed to install terminate signal handler")
                    .recv()
                    .await
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            let user_requested_abort = app_state.abort.notified();

            tokio::select! {
                _ = ctrl_c => {},
                _ = terminate => {},
                _ = user_requested_abort => {},
            }
        })
    };

    tracing::info!("On air at http://{display_address}");
    server.await.expect("serving HTTP");

    tracing::info!("shutting down: cancelling sweepers and closing stations");
    for sweeper in sweepers {
        sweeper.abort();
    }
    session::shutdown_all(&app_state);
    ExitCode::SUCCESS
}
