//! Agent HTTP API - configuration, instance status and feature access.
//!
//! Routes:
//! - `GET|PUT /api/configuration` - baseline snapshot / reconcile against a new target
//! - `GET /api/instances` - status of every running connector and gateway
//! - `GET /api/resources/:name/features` - features bound for a resource
//! - `GET|PUT /api/resources/:name/features/:feature` - read / write a bound feature
//! - `GET /api/gateways/:name/features` - features a gateway exposes
//! - `GET|PUT /api/admin/settings` - runtime settings

use crate::agent::{Agent, ReconcileOutcome};
use crate::supervisor::InstanceStatus;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snamp::binding::FeatureDescriptor;
use snamp::config::RuntimeSettings;
use snamp::configuration::AgentConfiguration;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<Agent>,
    /// Bearer token required by PUT routes. None = unrestricted.
    pub admin_token: Option<String>,
}

/// Response for `GET /api/configuration`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigurationView {
    pub version: u64,
    pub configuration: AgentConfiguration,
}

/// Response for feature reads and writes.
#[derive(Debug, Serialize, Deserialize)]
pub struct FeatureValue {
    pub resource: String,
    pub feature: String,
    pub value: Value,
}

/// Partial update body - only fields present in the request are changed.
#[derive(Deserialize)]
pub struct SettingsUpdate {
    pub update_window_ms: Option<u64>,
    pub reload_enabled: Option<bool>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ---------------------------------------------------------------------------
// Business logic (called from HTTP handlers and unit tests)
// ---------------------------------------------------------------------------

pub fn handle_get_configuration(agent: &Agent) -> ConfigurationView {
    let configuration = agent.configuration();
    ConfigurationView {
        version: configuration.version(),
        configuration: configuration.snapshot(),
    }
}

pub fn handle_resource_features(
    agent: &Agent,
    resource: &str,
) -> Result<Vec<FeatureDescriptor>, AppError> {
    if !agent.lifecycle().resources().contains(resource) {
        return Err(AppError::NotFound(format!("resource '{}' is not running", resource)));
    }
    Ok(agent.lifecycle().bindings().features(resource))
}

pub async fn handle_read_feature(
    agent: &Agent,
    resource: &str,
    feature: &str,
) -> Result<FeatureValue, AppError> {
    let binding = agent
        .lifecycle()
        .bindings()
        .lookup(resource, feature)
        .ok_or_else(|| unbound(resource, feature))?;
    let value = binding.accessor.read().await.map_err(AppError::bad_request)?;
    Ok(FeatureValue {
        resource: resource.to_string(),
        feature: feature.to_string(),
        value,
    })
}

pub async fn handle_write_feature(
    agent: &Agent,
    resource: &str,
    feature: &str,
    value: Value,
) -> Result<FeatureValue, AppError> {
    let binding = agent
        .lifecycle()
        .bindings()
        .lookup(resource, feature)
        .ok_or_else(|| unbound(resource, feature))?;
    binding.accessor.write(value.clone()).await.map_err(AppError::bad_request)?;
    info!(resource = %resource, feature = %feature, "Feature written");
    Ok(FeatureValue {
        resource: resource.to_string(),
        feature: feature.to_string(),
        value,
    })
}

pub fn handle_gateway_features(
    agent: &Agent,
    gateway: &str,
) -> Result<BTreeMap<String, Vec<FeatureDescriptor>>, AppError> {
    let instance = agent
        .lifecycle()
        .gateways()
        .get(gateway)
        .ok_or_else(|| AppError::NotFound(format!("gateway '{}' is not running", gateway)))?;
    Ok(instance.exposed_features())
}

pub fn handle_update_settings(
    agent: &Agent,
    update: SettingsUpdate,
) -> Result<RuntimeSettings, AppError> {
    if update.update_window_ms == Some(0) {
        return Err(AppError::BadRequest("update_window_ms must be positive".to_string()));
    }

    let mut settings = agent.settings().write().unwrap_or_else(PoisonError::into_inner);
    if let Some(v) = update.update_window_ms {
        settings.update_window_ms = v;
    }
    if let Some(v) = update.reload_enabled {
        settings.reload_enabled = v;
    }
    info!(
        update_window_ms = settings.update_window_ms,
        reload_enabled = settings.reload_enabled,
        "Runtime settings updated"
    );
    Ok(settings.clone())
}

fn unbound(resource: &str, feature: &str) -> AppError {
    AppError::NotFound(format!(
        "feature '{}' of resource '{}' is not bound",
        feature, resource
    ))
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn get_configuration(State(state): State<Arc<ApiState>>) -> Json<ConfigurationView> {
    Json(handle_get_configuration(&state.agent))
}

async fn put_configuration(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(target): Json<AgentConfiguration>,
) -> Result<Json<ReconcileOutcome>, AppError> {
    authorize(&headers, &state.admin_token)?;
    Ok(Json(state.agent.reconcile(&target).await))
}

async fn list_instances(State(state): State<Arc<ApiState>>) -> Json<Vec<InstanceStatus>> {
    Json(state.agent.lifecycle().statuses())
}

async fn list_resource_features(
    State(state): State<Arc<ApiState>>,
    Path(resource): Path<String>,
) -> Result<Json<Vec<FeatureDescriptor>>, AppError> {
    handle_resource_features(&state.agent, &resource).map(Json)
}

async fn read_feature(
    State(state): State<Arc<ApiState>>,
    Path((resource, feature)): Path<(String, String)>,
) -> Result<Json<FeatureValue>, AppError> {
    handle_read_feature(&state.agent, &resource, &feature).await.map(Json)
}

async fn write_feature(
    State(state): State<Arc<ApiState>>,
    Path((resource, feature)): Path<(String, String)>,
    headers: HeaderMap,
    Json(value): Json<Value>,
) -> Result<Json<FeatureValue>, AppError> {
    authorize(&headers, &state.admin_token)?;
    handle_write_feature(&state.agent, &resource, &feature, value)
        .await
        .map(Json)
}

async fn list_gateway_features(
    State(state): State<Arc<ApiState>>,
    Path(gateway): Path<String>,
) -> Result<Json<BTreeMap<String, Vec<FeatureDescriptor>>>, AppError> {
    handle_gateway_features(&state.agent, &gateway).map(Json)
}

async fn get_settings(State(state): State<Arc<ApiState>>) -> Json<RuntimeSettings> {
    let settings = state
        .agent
        .settings()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Json(settings)
}

async fn put_settings(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<RuntimeSettings>, AppError> {
    authorize(&headers, &state.admin_token)?;
    handle_update_settings(&state.agent, update).map(Json)
}

/// Checks the bearer token in `Authorization` against the expected admin token.
/// Everything passes when no token is configured.
fn authorize(headers: &HeaderMap, expected: &Option<String>) -> Result<(), AppError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let token = headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match token {
        Some(token) if token == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Unauthorized,
}

impl AppError {
    fn bad_request(e: anyhow::Error) -> Self {
        AppError::BadRequest(format!("{:#}", e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/api/configuration",
            get(get_configuration).put(put_configuration),
        )
        .route("/api/instances", get(list_instances))
        .route("/api/resources/:name/features", get(list_resource_features))
        .route(
            "/api/resources/:name/features/:feature",
            get(read_feature).put(write_feature),
        )
        .route("/api/gateways/:name/features", get(list_gateway_features))
        .route("/api/admin/settings", get(get_settings).put(put_settings))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::FeatureBindings;
    use crate::manager::LifecycleManager;
    use crate::registry::builtin_registry;
    use serde_json::json;
    use snamp::config::{new_runtime_settings, SnampConfig};
    use snamp::configuration::{AttributeConfiguration, ConfigurationManager, ResourceConfiguration};
    use std::time::Duration;

    async fn make_agent() -> Agent {
        let settings = new_runtime_settings(&SnampConfig::default());
        let bindings = Arc::new(FeatureBindings::new());
        let lifecycle = LifecycleManager::new(
            builtin_registry(Arc::clone(&bindings)),
            bindings,
            Arc::clone(&settings),
            Duration::from_millis(50),
        );
        let agent = Agent::new(ConfigurationManager::default(), lifecycle, settings, false);

        let mut target = AgentConfiguration::new();
        target.resources.insert(
            "boiler",
            ResourceConfiguration::new("memory", "mem://boiler").with_attribute(
                "temperature",
                AttributeConfiguration::new().with_parameter("default", "20"),
            ),
        );
        agent.reconcile(&target).await;
        agent
    }

    #[tokio::test]
    async fn test_read_and_write_feature() {
        let agent = make_agent().await;

        let read = handle_read_feature(&agent, "boiler", "temperature").await.unwrap();
        assert_eq!(read.value, json!(20));

        handle_write_feature(&agent, "boiler", "temperature", json!(75))
            .await
            .unwrap();
        let read = handle_read_feature(&agent, "boiler", "temperature").await.unwrap();
        assert_eq!(read.value, json!(75));
    }

    #[tokio::test]
    async fn test_unbound_feature_not_found() {
        let agent = make_agent().await;

        let err = handle_read_feature(&agent, "boiler", "pressure").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = handle_resource_features(&agent, "furnace").unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = handle_gateway_features(&agent, "snmp").unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_settings_partial() {
        let agent = make_agent().await;

        let settings = handle_update_settings(
            &agent,
            SettingsUpdate {
                update_window_ms: Some(500),
                reload_enabled: None,
            },
        )
        .unwrap();
        assert_eq!(settings.update_window_ms, 500);
        assert_eq!(settings.reload_enabled, SnampConfig::default().reload.enabled);

        let err = handle_update_settings(
            &agent,
            SettingsUpdate {
                update_window_ms: Some(0),
                reload_enabled: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn test_authorize() {
        let mut headers = HeaderMap::new();
        assert!(authorize(&headers, &None).is_ok());
        assert!(authorize(&headers, &Some("secret".to_string())).is_err());

        headers.insert("Authorization", "Bearer secret".parse().unwrap());
        assert!(authorize(&headers, &Some("secret".to_string())).is_ok());
        assert!(authorize(&headers, &Some("other".to_string())).is_err());
    }
}
