use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

use crate::config::{ConfigError, DeviceSettings, SerialSettings};
use crate::serial::{self, PortInfo};
use crate::state::ServerState;

fn settings_error(e: ConfigError) -> (StatusCode, String) {
    error!("settings store error: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Settings store error: {}", e),
    )
}

fn load(state: &ServerState) -> Result<DeviceSettings, (StatusCode, String)> {
    DeviceSettings::load_or_create(&state.config.settings_path()).map_err(settings_error)
}

fn save(state: &ServerState, settings: &DeviceSettings) -> Result<(), (StatusCode, String)> {
    settings
        .save(&state.config.settings_path())
        .map_err(settings_error)
}

/// Partial update for the serial section; omitted fields keep their value.
#[derive(Debug, Deserialize)]
pub struct SerialSettingsUpdate {
    pub port: Option<String>,
    pub baud: Option<u32>,
}

pub async fn get_serial_settings(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<SerialSettings>, (StatusCode, String)> {
    Ok(Json(load(&state)?.serial))
}

pub async fn update_serial_settings(
    State(state): State<Arc<ServerState>>,
    Json(update): Json<SerialSettingsUpdate>,
) -> Result<Json<SerialSettings>, (StatusCode, String)> {
    let mut settings = load(&state)?;
    if let Some(port) = update.port {
        settings.serial.port = port;
    }
    if let Some(baud) = update.baud {
        settings.serial.baud = baud;
    }
    save(&state, &settings)?;
    Ok(Json(settings.serial))
}

pub async fn get_control_settings(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<toml::Table>, (StatusCode, String)> {
    Ok(Json(load(&state)?.control))
}

/// Replace the control parameter table wholesale; the GUI always posts the
/// full set.
pub async fn update_control_settings(
    State(state): State<Arc<ServerState>>,
    Json(table): Json<toml::Table>,
) -> Result<Json<toml::Table>, (StatusCode, String)> {
    let mut settings = load(&state)?;
    settings.control = table;
    save(&state, &settings)?;
    Ok(Json(settings.control))
}

pub async fn get_assistance_settings(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<toml::Table>, (StatusCode, String)> {
    Ok(Json(load(&state)?.assistance))
}

pub async fn update_assistance_settings(
    State(state): State<Arc<ServerState>>,
    Json(table): Json<toml::Table>,
) -> Result<Json<toml::Table>, (StatusCode, String)> {
    let mut settings = load(&state)?;
    settings.assistance = table;
    save(&state, &settings)?;
    Ok(Json(settings.assistance))
}

/// List serial devices suitable for the serial settings port field.
pub async fn list_available_ports() -> Result<Json<Vec<PortInfo>>, (StatusCode, String)> {
    serial::list_ports().map(Json).map_err(|e| {
        error!("failed to enumerate serial ports: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to enumerate ports: {}", e),
        )
    })
}
