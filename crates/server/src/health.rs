use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use switchboard_core::auth::{AuthProfileFailoverManager, ProfileSummary};
use switchboard_core::persistence::KvStore;
use switchboard_core::session::SessionRegistry;

#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn KvStore>,
    pub sessions: Arc<SessionRegistry>,
    pub profiles: Arc<AuthProfileFailoverManager>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub live: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub store: HealthCheck,
    pub sessions: SessionStats,
    pub profiles: ProfileSummary,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

/// Degraded (503) when the store is unreachable. Profile exhaustion is
/// reported but does not degrade readiness.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let store = store_check(state.store.as_ref()).await;
    let ready = store.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "switchboard gateway running".to_string(),
        },
        store,
        sessions: SessionStats { live: state.sessions.len().await },
        profiles: state.profiles.summary().await,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn store_check(store: &dyn KvStore) -> HealthCheck {
    match store.ping().await {
        Ok(()) => HealthCheck { status: "ready", detail: "store ping succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("store ping failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{extract::State, http::StatusCode, Json};
    use switchboard_core::auth::{AuthProfileFailoverManager, ExponentialBackoff, FailoverPolicy};
    use switchboard_core::clock::system_clock;
    use switchboard_core::config::{AppConfig, ProfileConfig};
    use switchboard_core::domain::channel::{ChannelIdentity, ChannelType};
    use switchboard_core::multiplexer::StreamMultiplexer;
    use switchboard_core::persistence::{InMemoryKvStore, KvStore, StoreError};
    use switchboard_core::session::{RegistrySettings, SessionRegistry};

    use crate::health::{health, HealthState};

    struct DownStore;

    #[async_trait]
    impl KvStore for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
    }

    fn state(store: Arc<dyn KvStore>) -> HealthState {
        let mut config = AppConfig::default();
        config.auth.profiles = vec![ProfileConfig {
            id: "p1".to_string(),
            provider: "test".to_string(),
            credential_ref: "env:P1".to_string(),
            api_key: None,
            priority: 1,
        }];
        let sessions = Arc::new(SessionRegistry::new(
            RegistrySettings::from(&config.sessions),
            StreamMultiplexer::new(8),
            system_clock(),
        ));
        let profiles = Arc::new(AuthProfileFailoverManager::new(
            &config.auth.profiles,
            FailoverPolicy::from(&config.auth),
            Arc::new(ExponentialBackoff::from(config.auth.backoff)),
            system_clock(),
        ));
        HealthState { store, sessions, profiles }
    }

    #[tokio::test]
    async fn health_reports_sessions_and_profiles_when_store_is_reachable() {
        let state = state(Arc::new(InMemoryKvStore::new()));
        state.sessions.resolve(&ChannelIdentity::direct(ChannelType::Matrix, "@a:hs")).await;

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.store.status, "ready");
        assert_eq!(payload.sessions.live, 1);
        assert_eq!(payload.profiles.available, 1);
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_store_is_down() {
        let (status, Json(payload)) = health(State(state(Arc::new(DownStore)))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.store.status, "degraded");
        assert!(payload.store.detail.contains("connection refused"));
    }
}
