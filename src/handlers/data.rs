use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};

use crate::state::ServerState;
use crate::telemetry;

/// One entry in a recordings-directory listing
#[derive(Debug, Serialize)]
pub struct RecordingFileInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
}

// Identifiers arriving in query strings are directory/file names; anything
// that could walk out of the recordings root is rejected before resolution.
fn check_component(name: &str) -> Result<(), (StatusCode, String)> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        warn!("rejected path component '{}'", name);
        return Err((
            StatusCode::BAD_REQUEST,
            "Invalid path component".to_string(),
        ));
    }
    Ok(())
}

fn resolve_under(root: &Path, target: &Path) -> Result<PathBuf, (StatusCode, String)> {
    let canonical_target = target
        .canonicalize()
        .map_err(|_| (StatusCode::NOT_FOUND, "Not found".to_string()))?;

    let canonical_base = root.canonicalize().map_err(|e| {
        error!("recordings directory invalid: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server configuration error".to_string(),
        )
    })?;

    if !canonical_target.starts_with(&canonical_base) {
        warn!(
            "path escape attempt: {} outside of {}",
            canonical_target.display(),
            canonical_base.display()
        );
        return Err((StatusCode::FORBIDDEN, "Access denied".to_string()));
    }

    Ok(canonical_target)
}

async fn list_directories(
    dir: &Path,
    prefix: &str,
) -> Result<Vec<String>, (StatusCode, String)> {
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "Not found".to_string()))?;

    let mut names = Vec::new();
    while let Some(entry) = read_dir.next_entry().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to read entry: {}", e),
        )
    })? {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_dir = entry
            .metadata()
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if is_dir && name.starts_with(prefix) {
            names.push(name);
        }
    }

    names.sort();
    Ok(names)
}

#[derive(Debug, Serialize)]
pub struct NameListResponse {
    pub items: Vec<String>,
}

/// List subjects with recorded data.
pub async fn list_subjects(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<NameListResponse>, (StatusCode, String)> {
    let root = state.config.recordings_dir();
    let items = match list_directories(&root, "sub_").await {
        Ok(items) => items,
        // No recordings yet is an empty list, not an error.
        Err((status, _)) if status == StatusCode::NOT_FOUND => Vec::new(),
        Err(e) => return Err(e),
    };
    Ok(Json(NameListResponse { items }))
}

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    pub subject: String,
}

/// List sessions for a subject. The subject parameter is a directory name
/// as returned by the subjects listing.
pub async fn list_sessions(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<NameListResponse>, (StatusCode, String)> {
    check_component(&query.subject)?;
    let dir = state.config.recordings_dir().join(&query.subject);
    let items = list_directories(&dir, "sess_").await?;
    Ok(Json(NameListResponse { items }))
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub subject: String,
    pub session: String,
}

/// List record files for a subject and session.
pub async fn list_records(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<NameListResponse>, (StatusCode, String)> {
    check_component(&query.subject)?;
    check_component(&query.session)?;

    let dir = state
        .config
        .recordings_dir()
        .join(&query.subject)
        .join(&query.session);

    let mut read_dir = tokio::fs::read_dir(&dir)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "Not found".to_string()))?;

    let mut items = Vec::new();
    while let Some(entry) = read_dir.next_entry().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to read entry: {}", e),
        )
    })? {
        let is_file = entry
            .metadata()
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if is_file {
            items.push(entry.file_name().to_string_lossy().to_string());
        }
    }

    items.sort();
    Ok(Json(NameListResponse { items }))
}

#[derive(Debug, Deserialize)]
pub struct RecordQuery {
    pub subject: String,
    pub session: String,
    pub record: String,
}

/// A fully parsed record file
#[derive(Debug, Serialize)]
pub struct RecordDataResponse {
    pub columns: Vec<String>,
    pub data: Vec<Vec<f64>>,
}

/// Fetch the full contents of one record file.
///
/// Capture files carry no header row, so columns are the same positional
/// labels the live telemetry uses.
pub async fn get_record(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<RecordDataResponse>, (StatusCode, String)> {
    check_component(&query.subject)?;
    check_component(&query.session)?;
    check_component(&query.record)?;

    let path = state
        .config
        .recordings_dir()
        .join(&query.subject)
        .join(&query.session)
        .join(&query.record);

    if !path.is_file() {
        return Err((StatusCode::NOT_FOUND, "File not found".to_string()));
    }

    match telemetry::read_table(&path) {
        Some(table) => Ok(Json(RecordDataResponse {
            columns: table.columns,
            data: table.rows,
        })),
        None => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "Record contains no parsable rows".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub path: Option<String>,
}

/// Generic listing of the recordings tree for the file browser.
pub async fn list_files(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<Vec<RecordingFileInfo>>, (StatusCode, String)> {
    let root = state.config.recordings_dir();
    let subpath = query.path.unwrap_or_default();

    // Early validation of the path before any resolution.
    if !subpath.is_empty() {
        let subpath_path = PathBuf::from(&subpath);
        if subpath_path.is_absolute() {
            warn!("rejected absolute path in file listing: {}", subpath);
            return Err((
                StatusCode::BAD_REQUEST,
                "Absolute paths are not allowed".to_string(),
            ));
        }
        if subpath.contains("..") {
            warn!("rejected path traversal attempt in file listing: {}", subpath);
            return Err((
                StatusCode::BAD_REQUEST,
                "Path traversal sequences are not allowed".to_string(),
            ));
        }
    }

    let target = if subpath.is_empty() {
        root.clone()
    } else {
        root.join(&subpath)
    };

    // Defense in depth on top of the component checks above.
    let canonical_target = resolve_under(&root, &target)?;
    let canonical_base = root
        .canonicalize()
        .map_err(|_| (StatusCode::NOT_FOUND, "Not found".to_string()))?;

    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(&canonical_target).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to read directory: {}", e),
        )
    })?;

    while let Some(entry) = read_dir.next_entry().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to read entry: {}", e),
        )
    })? {
        let metadata = entry.metadata().await.ok();
        let is_dir = metadata.as_ref().map(|m| m.is_dir()).unwrap_or(false);
        let size = metadata.as_ref().map(|m| m.len()).unwrap_or(0);

        let full_path = entry.path();
        let relative_path = full_path
            .strip_prefix(&canonical_base)
            .unwrap_or(&full_path)
            .to_string_lossy()
            .to_string();

        entries.push(RecordingFileInfo {
            path: relative_path,
            name: entry.file_name().to_string_lossy().to_string(),
            size,
            is_directory: is_dir,
        });
    }

    // Sort: directories first, then by name
    entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });

    Ok(Json(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_check_rejects_traversal() {
        assert!(check_component("sub_P1").is_ok());
        assert!(check_component("rec_R1.csv").is_ok());
        assert!(check_component("..").is_err());
        assert!(check_component(".").is_err());
        assert!(check_component("").is_err());
        assert!(check_component("a/b").is_err());
        assert!(check_component("a\\b").is_err());
    }
}
