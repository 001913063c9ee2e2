//! # ASR Webservice
//!
//! HTTP service that turns uploaded audio into transcripts. A single
//! recognition engine is selected from configuration at startup, its model
//! is loaded before the server binds, and every request is served from that
//! one engine instance.
//!
//! ## Modules:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **audio**: upload decoding via ffmpeg into 16 kHz mono PCM
//! - **engine**: engine trait, capabilities and the concrete variants
//! - **asr**: option validation, pipeline and output formatting
//! - **handlers**: the HTTP request surface
//! - **health / state / middleware**: monitoring and request telemetry

mod asr;
mod audio;
mod config;
mod engine;
mod error;
mod handlers;
mod health;
mod lang;
mod middleware;
mod state;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting asr-webservice v{}", env!("CARGO_PKG_VERSION"));
    info!(
        engine = %config.asr.engine,
        model = %config.asr.model,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    // Startup-fatal: an unknown engine selector or missing credential must
    // stop the process here, not surface per request.
    let engine = engine::create_engine(&config)?;

    info!("Loading model '{}'", config.asr.model);
    engine.load_model().await.map_err(anyhow::Error::new)?;
    info!("Model loaded, ready to serve");

    let app_state = AppState::new(config.clone(), engine);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::RequestTelemetry)
            .route("/", web::get().to(handlers::index))
            .route("/asr", web::post().to(handlers::transcribe))
            .route("/detect-language", web::post().to(handlers::detect_language))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asr_webservice=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
