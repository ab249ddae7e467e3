use axum::{
    extract::{Path as UrlPath, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::monitor::retention::is_bare_filename;
use crate::monitor::{BackupEntry, MonitorSupervisor, RetentionStore};
use crate::storage::{DeviceConfig, Storage};
use crate::sync::SyncHandle;
use crate::utils::config::Config;
use crate::utils::event_log::ActivityLog;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Storage,
    pub supervisor: MonitorSupervisor,
    pub activity: ActivityLog,
    pub sync: SyncHandle,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/file-monitor/state", get(get_state).post(update_state))
        .route("/file-monitor/start", post(start_monitoring))
        .route("/file-monitor/stop", post(stop_monitoring))
        .route("/file-monitor/status", get(get_status))
        .route("/file-monitor/backups/local", get(list_local_backups))
        .route(
            "/file-monitor/backups/local/:filename",
            get(download_local_backup).delete(delete_local_backup),
        )
        .route("/file-monitor/logs", get(get_logs))
}

#[derive(Deserialize)]
struct DeviceQuery {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
}

#[derive(Serialize)]
struct StatePayload {
    #[serde(rename = "monitorFolders")]
    monitor_folders: Vec<PathBuf>,
    #[serde(rename = "backupFolder")]
    backup_folder: PathBuf,
    #[serde(rename = "monitoringEnabled")]
    monitoring_enabled: bool,
}

#[derive(Serialize)]
struct StateResponse {
    success: bool,
    state: StatePayload,
    #[serde(rename = "monitoringActive")]
    monitoring_active: bool,
}

impl StateResponse {
    fn from_config(config: DeviceConfig, active: bool) -> Self {
        Self {
            success: true,
            state: StatePayload {
                monitor_folders: config.monitor_folders,
                backup_folder: config.backup_folder,
                monitoring_enabled: config.monitoring_enabled,
            },
            monitoring_active: active,
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"ok": true, "time": Utc::now().to_rfc3339()}))
}

impl AppState {
    fn resolve_device(&self, requested: Option<String>) -> String {
        requested
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.config.device_id.clone())
    }

    /// Stored config for the device, or agent defaults when none saved.
    async fn device_config(&self, device_id: &str) -> anyhow::Result<DeviceConfig> {
        Ok(self
            .storage
            .load_config(device_id)
            .await?
            .unwrap_or_else(|| {
                DeviceConfig::defaults(device_id, &self.config.default_backup_folder)
            }))
    }
}

async fn get_state(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let device_id = state.resolve_device(query.device_id);
    match state.device_config(&device_id).await {
        Ok(config) => {
            Json(StateResponse::from_config(config, state.supervisor.status())).into_response()
        }
        Err(e) => server_error(e),
    }
}

#[derive(Deserialize, Default)]
struct UpdateStateRequest {
    #[serde(rename = "deviceId", alias = "device_id")]
    device_id: Option<String>,
    #[serde(rename = "monitorFolders", alias = "monitor_folders")]
    monitor_folders: Option<Vec<PathBuf>>,
    #[serde(rename = "backupFolder", alias = "backup_folder")]
    backup_folder: Option<PathBuf>,
    #[serde(rename = "monitoringEnabled", alias = "monitoring_enabled")]
    monitoring_enabled: Option<bool>,
}

async fn update_state(
    State(state): State<AppState>,
    Json(req): Json<UpdateStateRequest>,
) -> Response {
    let device_id = state.resolve_device(req.device_id.clone());
    let mut config = match state.device_config(&device_id).await {
        Ok(config) => config,
        Err(e) => return server_error(e),
    };

    if let Some(folders) = req.monitor_folders {
        config.monitor_folders = folders;
    }
    if let Some(folder) = req.backup_folder {
        if folder.as_os_str().is_empty() {
            return bad_request("backupFolder must not be empty");
        }
        config.backup_folder = folder;
    }
    if let Some(enabled) = req.monitoring_enabled {
        config.monitoring_enabled = enabled;
    }

    if let Err(e) = state.storage.save_config(&config).await {
        return server_error(e);
    }
    state.sync.trigger();

    Json(StateResponse::from_config(config, state.supervisor.status())).into_response()
}

async fn start_monitoring(
    State(state): State<AppState>,
    body: Option<Json<UpdateStateRequest>>,
) -> Response {
    set_monitoring_flag(state, body, true).await
}

async fn stop_monitoring(
    State(state): State<AppState>,
    body: Option<Json<UpdateStateRequest>>,
) -> Response {
    set_monitoring_flag(state, body, false).await
}

async fn set_monitoring_flag(
    state: AppState,
    body: Option<Json<UpdateStateRequest>>,
    enabled: bool,
) -> Response {
    let requested = body.and_then(|Json(req)| req.device_id);
    let device_id = state.resolve_device(requested);

    let mut config = match state.device_config(&device_id).await {
        Ok(config) => config,
        Err(e) => return server_error(e),
    };
    config.monitoring_enabled = enabled;

    if let Err(e) = state.storage.save_config(&config).await {
        return server_error(e);
    }
    state.sync.trigger();

    let message = if enabled {
        "Monitoring signal sent"
    } else {
        "Stop signal sent"
    };
    Json(json!({"success": true, "message": message})).into_response()
}

async fn get_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"monitoringActive": state.supervisor.status()}))
}

#[derive(Serialize)]
struct LocalBackupsResponse {
    success: bool,
    files: Vec<BackupEntry>,
}

async fn list_local_backups(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let device_id = state.resolve_device(query.device_id);
    let config = match state.device_config(&device_id).await {
        Ok(config) => config,
        Err(e) => return server_error(e),
    };

    let store = RetentionStore::new(&config.backup_folder);
    match store.list_entries().await {
        Ok(files) => Json(LocalBackupsResponse {
            success: true,
            files,
        })
        .into_response(),
        Err(e) => server_error(e),
    }
}

async fn download_local_backup(
    State(state): State<AppState>,
    UrlPath(filename): UrlPath<String>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    if !is_bare_filename(&filename) {
        return bad_request("invalid backup name");
    }

    let device_id = state.resolve_device(query.device_id);
    let config = match state.device_config(&device_id).await {
        Ok(config) => config,
        Err(e) => return server_error(e),
    };

    let path = config.backup_folder.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            if let Ok(disposition) =
                HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
            {
                headers.insert(header::CONTENT_DISPOSITION, disposition);
            }
            (headers, Bytes::from(bytes)).into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => not_found("File not found"),
        Err(e) => server_error(e.into()),
    }
}

async fn delete_local_backup(
    State(state): State<AppState>,
    UrlPath(filename): UrlPath<String>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let device_id = state.resolve_device(query.device_id);
    let config = match state.device_config(&device_id).await {
        Ok(config) => config,
        Err(e) => return server_error(e),
    };

    let store = RetentionStore::new(&config.backup_folder);
    match store.remove_entry(&filename).await {
        Ok(true) => {
            Json(json!({"success": true, "message": format!("Deleted {}", filename)}))
                .into_response()
        }
        Ok(false) => not_found("File not found"),
        Err(e) => bad_request(&format!("{:#}", e)),
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Json<serde_json::Value> {
    let logs = state.activity.recent(query.limit.or(Some(100)));
    Json(json!({"logs": logs}))
}

fn server_error(e: anyhow::Error) -> Response {
    warn!("request failed: {:#}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "error": e.to_string()})),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "error": message})),
    )
        .into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "error": message})),
    )
        .into_response()
}
