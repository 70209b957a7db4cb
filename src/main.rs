use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use clap::Parser;
use exo_server::{
    cli::{Cli, Commands},
    config::{DeviceSettings, ServerConfig},
    handlers::{
        get_assistance_settings, get_control_settings, get_record, get_serial_settings,
        health_check, list_available_ports, list_files, list_records, list_sessions,
        list_subjects, microcontroller_info, recording_status, reflash_firmware,
        start_recording, stop_recording, update_assistance_settings, update_control_settings,
        update_serial_settings, upload_firmware,
    },
    recorder::{Recorder, RecorderOptions},
    serial::{list_ports, SystemPorts},
    state::ServerState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "exo_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = ServerConfig::from_env()?;

    // Handle CLI commands
    match cli.command {
        Some(Commands::Ports) => {
            let ports = list_ports()?;
            if ports.is_empty() {
                println!("No capture devices found");
                return Ok(());
            }
            println!("{:<28} {:<10} {}", "Port", "Type", "Product");
            println!("{}", "-".repeat(60));
            for port in ports {
                println!(
                    "{:<28} {:<10} {}",
                    port.name,
                    port.kind,
                    port.product.as_deref().unwrap_or("-")
                );
            }
            return Ok(());
        }
        Some(Commands::Serve) | None => {
            // Continue to run server
        }
    }

    // Create the settings file with defaults on first run, and pick up the
    // recorder tunables from it.
    let settings = DeviceSettings::load_or_create(&config.settings_path())?;

    info!("🚀 Starting exo-server v{}", VERSION);
    info!("📋 Configuration loaded:");
    info!("   Port: {}", config.port);
    info!("   Bind address: {}", config.bind_addr);
    info!("   Data directory: {:?}", config.data_dir);
    info!("   Settings file: {:?}", config.settings_path());
    info!("   Serial device: {} @ {}", settings.serial.port, settings.serial.baud);
    info!("   Poll interval: {} ms", settings.recording.poll_interval_ms);

    let recorder = Recorder::new(
        config.recordings_dir(),
        Arc::new(SystemPorts),
        RecorderOptions {
            poll_interval: Duration::from_millis(settings.recording.poll_interval_ms),
            startup_grace: Duration::from_millis(settings.recording.startup_grace_ms),
        },
    );

    let state = Arc::new(ServerState::new(config.clone(), recorder));

    // Limit request body size; firmware upload gets its own, larger limit.
    const MAX_API_BODY_SIZE: usize = 1024 * 1024; // 1MB for regular API requests
    let max_upload = config.max_firmware_size as usize + 64 * 1024; // multipart framing slack

    let firmware_routes = Router::new()
        .route("/settings/firmware", post(upload_firmware))
        // Raise axum's built-in body cap as well; firmware images are larger
        // than the 2MB it allows by default.
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(RequestBodyLimitLayer::new(max_upload))
        .with_state(state.clone());

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/record/start", post(start_recording))
        .route("/record/stop", post(stop_recording))
        .route("/record/status", get(recording_status))
        .route(
            "/settings/serial",
            get(get_serial_settings).post(update_serial_settings),
        )
        .route(
            "/settings/control",
            get(get_control_settings).post(update_control_settings),
        )
        .route(
            "/settings/assistance",
            get(get_assistance_settings).post(update_assistance_settings),
        )
        .route("/microcontroller/info", get(microcontroller_info))
        .route("/microcontroller/reflash", post(reflash_firmware))
        .route("/utils/ports", get(list_available_ports))
        .route("/data/subjects", get(list_subjects))
        .route("/data/sessions", get(list_sessions))
        .route("/data/records", get(list_records))
        .route("/data/record", get(get_record))
        .route("/data/files", get(list_files))
        .layer(RequestBodyLimitLayer::new(MAX_API_BODY_SIZE))
        .with_state(state.clone());

    // The GUI is served from a different origin on the LAN, so CORS stays
    // open.
    let app = Router::new()
        .merge(firmware_routes)
        .merge(api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.bind_address().parse()?;
    info!("🎧 Listening on http://{}", addr);
    info!("🔑 Health endpoint: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
