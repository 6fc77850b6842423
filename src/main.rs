//! # Voice Session Client - Main Application Entry Point
//!
//! Runs one voice session against the configured assistant server and exposes
//! it through a local control API.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the HTTP server, the peer connection and the analysis
//!   loops all share one tokio runtime
//! - **Arc**: the session is created once and shared by every worker
//! - **Result<T, E>**: startup errors abort with context, runtime errors are
//!   logged and surfaced as session events
//! - **static**: the shutdown flag lives for the whole program
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **session**: the voice session façade (transport, protocol, audio loops)
//! - **state**: shared application state and request metrics
//! - **handlers**: REST endpoints that drive the session
//! - **websocket**: live session event stream for UIs
//! - **health**: health and metrics endpoints

use actix_cors::Cors;
use actix_web::{middleware::from_fn, web, App, HttpServer};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_session_client::config::AppConfig;
use voice_session_client::platform::{default_media_devices, has_capture_backend};
use voice_session_client::rtc::WebRtcFactory;
use voice_session_client::session::VoiceSession;
use voice_session_client::signaling::HttpNegotiator;
use voice_session_client::state::AppState;
use voice_session_client::{handlers, health, middleware, websocket};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Builds the voice session**: media devices, peer factory, negotiator
/// 3. **Starts the session** (peer connection, default microphone, loops)
/// 4. **Serves the control API** until a shutdown signal arrives
/// 5. **Shuts the session down** so capture and the peer are released
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-session-client v{}", env!("CARGO_PKG_VERSION"));
    info!("Assistant offer endpoint: {}", config.offer_url());

    if !has_capture_backend() {
        warn!(
            "Built without the native-audio feature: no microphone can be opened and \
             connect will fail with no_local_track. Rebuild with --features native-audio"
        );
    }

    let negotiator = Arc::new(HttpNegotiator::from_config(&config));
    let session = VoiceSession::from_config(
        &config,
        default_media_devices(),
        Arc::new(WebRtcFactory::from_config(&config)),
        negotiator.clone(),
    );

    // A missing microphone is not fatal: devices can be refreshed later.
    if let Err(e) = session.start().await {
        warn!(error = %e, "Session start incomplete");
    }

    // Frame loops idle until a UI subscribes to the event stream.
    session.set_visible(false);
    let app_state = AppState::new(config.clone(), session.clone()).with_negotiator(negotiator);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting control API on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(from_fn(middleware::track_requests))
            .wrap(TracingLogger::default())
            .wrap(cors)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/session", web::get().to(handlers::get_session))
                    .route("/session/connect", web::post().to(handlers::connect))
                    .route("/session/disconnect", web::post().to(handlers::disconnect))
                    .route("/session/mic", web::post().to(handlers::set_mic))
                    .route("/session/device", web::put().to(handlers::select_device))
                    .route("/devices", web::get().to(handlers::list_devices))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/ws/events", web::get().to(websocket::ws_events))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    if let Err(e) = session.shutdown().await {
        warn!(error = %e, "Session did not shut down cleanly");
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, defaulting to
/// `voice_session_client=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_session_client=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Flip `SHUTDOWN_SIGNAL` on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100 ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
