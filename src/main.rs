//! # Voice Relay Backend - Main Application Entry Point
//!
//! Real-time voice conversation relay. Clients stream audio over a WebSocket,
//! the relay decides when the speaker has finished a turn, runs it through
//! transcription, a language model and speech synthesis, and streams the
//! reply back.
//!
//! ## Application Architecture:
//! - **turn**: audio accumulation, silence detection and the single-flight guard
//! - **session**: per-conversation state and the session registry
//! - **pipeline**: transcribe, complete, synthesize for one flushed turn
//! - **relay**: the event entry points tying turns, sessions and the pipeline together
//! - **providers**: speech-to-text, language model and text-to-speech backends
//! - **websocket**: the client transport at `/ws/voice`
//! - **config / state / health / middleware / handlers / error**: server plumbing

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod providers;
mod relay;
mod session;
mod state;
#[cfg(test)]
mod testing;
mod turn;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use providers::Providers;
use relay::VoiceRelay;
use state::AppState;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## Startup order:
/// 1. **Configuration**: load and validate; a bad config refuses to start
/// 2. **Providers**: build the STT / LLM / TTS backends
/// 3. **Relay**: session registry, pipeline and the idle sweeper
/// 4. **HTTP server**: admin REST, health and the voice WebSocket
/// 5. **Shutdown**: stop on Ctrl+C or SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let providers = Providers::from_config(&config.providers, config.turn.audio_format())?;
    let snapshot = providers.snapshot();
    info!(
        stt = %snapshot.stt,
        llm = %snapshot.llm,
        tts = %snapshot.tts,
        "Providers ready"
    );

    let relay = VoiceRelay::from_config(&config, providers);
    let sweep_interval = Duration::from_secs(config.sessions.sweep_interval_secs);
    let sweeper = relay.spawn_idle_sweeper(sweep_interval);

    let app_state = AppState::new(config.clone(), relay);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}", web::delete().to(handlers::delete_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
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

    sweeper.abort();
    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// `RUST_LOG` overrides the default `voice_relay_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
