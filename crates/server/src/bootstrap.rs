use std::sync::Arc;
use std::time::Duration;

use switchboard_agent::{AgentInvoker, AgentRuntime, EchoInvoker, ToolExecutionCoordinator, ToolRegistry};
use switchboard_channels::{
    AdapterTable, ChannelRouter, ChannelTransport, InboundSink, IngressRunner, RetryPolicy,
    RouterSettings,
};
use switchboard_core::auth::{AuthProfileFailoverManager, ExponentialBackoff, FailoverPolicy};
use switchboard_core::clock::{system_clock, SharedClock};
use switchboard_core::config::{AppConfig, ConfigError, LoadOptions};
use switchboard_core::multiplexer::StreamMultiplexer;
use switchboard_core::persistence::KvStore;
use switchboard_core::session::{RegistrySettings, SessionRegistry};
use switchboard_store::StoreSetupError;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gateway::Gateway;
use crate::sweeper::spawn_sweeper;

const DRAIN_POLL: Duration = Duration::from_secs(1);

/// Pluggable pieces supplied by the embedding binary: platform adapters and
/// transports, the tool set and the model invoker.
pub struct Collaborators {
    pub adapters: AdapterTable,
    pub transports: Vec<Arc<dyn ChannelTransport>>,
    pub tools: ToolRegistry,
    pub invoker: Arc<dyn AgentInvoker>,
    pub clock: SharedClock,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            adapters: AdapterTable::new(),
            transports: Vec::new(),
            tools: ToolRegistry::new(),
            invoker: Arc::new(EchoInvoker::default()),
            clock: system_clock(),
        }
    }
}

pub struct Application {
    pub config: AppConfig,
    pub store: Arc<dyn KvStore>,
    pub events: StreamMultiplexer,
    pub sessions: Arc<SessionRegistry>,
    pub profiles: Arc<AuthProfileFailoverManager>,
    pub coordinator: Arc<ToolExecutionCoordinator>,
    pub router: Arc<ChannelRouter>,
    pub gateway: Gateway,
    transports: Vec<Arc<dyn ChannelTransport>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreSetupError),
}

pub async fn bootstrap(
    options: LoadOptions,
    collaborators: Collaborators,
) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting gateway bootstrap");
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config, collaborators).await
}

/// Opens the store and wires the gateway. An unreachable store is fatal.
pub async fn bootstrap_with_config(
    config: AppConfig,
    collaborators: Collaborators,
) -> Result<Application, BootstrapError> {
    let store = switchboard_store::open(&config.store).await?;
    info!(
        event_name = "system.bootstrap.store_ready",
        max_connections = config.store.max_connections,
        "store connection established"
    );
    Ok(assemble(config, Arc::new(store), collaborators).await)
}

/// Wires every component over an already opened store.
pub async fn assemble(
    config: AppConfig,
    store: Arc<dyn KvStore>,
    collaborators: Collaborators,
) -> Application {
    let Collaborators { adapters, transports, tools, invoker, clock } = collaborators;
    let events = StreamMultiplexer::new(config.events.subscriber_buffer);

    let sessions = Arc::new(
        SessionRegistry::new(RegistrySettings::from(&config.sessions), events.clone(), clock.clone())
            .with_store(store.clone()),
    );

    let profiles = Arc::new(
        AuthProfileFailoverManager::new(
            &config.auth.profiles,
            FailoverPolicy::from(&config.auth),
            Arc::new(ExponentialBackoff::from(config.auth.backoff)),
            clock,
        )
        .with_store(store.clone()),
    );
    profiles.restore().await;

    let coordinator = ToolExecutionCoordinator::attach(
        Arc::new(tools),
        sessions.clone(),
        events.clone(),
        &config.tools,
    );
    let runtime = AgentRuntime::new(
        invoker,
        profiles.clone(),
        coordinator.clone(),
        events.clone(),
        config.auth.max_failover_attempts,
    );
    let router = Arc::new(ChannelRouter::new(adapters, RouterSettings::from(&config.channels)));
    let gateway = Gateway::new(sessions.clone(), router.clone(), runtime, events.clone());

    info!(
        event_name = "system.bootstrap.assembled",
        channels = router.adapters().len(),
        transports = transports.len(),
        profiles = config.auth.profiles.len(),
        tools = coordinator.tools().len(),
        "gateway components assembled"
    );

    Application {
        config,
        store,
        events,
        sessions,
        profiles,
        coordinator,
        router,
        gateway,
        transports,
    }
}

impl Application {
    /// Outbound drainers, the idle sweeper and one ingress runner per
    /// transport. All of them stop when `shutdown` fires.
    pub fn start_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = self.router.spawn_drainers(shutdown.clone(), DRAIN_POLL);
        handles.push(spawn_sweeper(
            self.sessions.clone(),
            self.config.sessions.idle_timeout(),
            self.config.sessions.sweep_interval(),
            shutdown.clone(),
        ));

        let sink: Arc<dyn InboundSink> = Arc::new(self.gateway.clone());
        for transport in &self.transports {
            let runner = IngressRunner::new(
                transport.clone(),
                sink.clone(),
                RetryPolicy::for_reconnects(&self.config.channels),
            )
            .with_shutdown(shutdown.clone());
            let channel = transport.channel_type();
            handles.push(tokio::spawn(async move {
                let exit = runner.start().await;
                info!(
                    event_name = "channel.ingress.exited",
                    channel = %channel,
                    exit = ?exit,
                    "ingress runner exited"
                );
            }));
        }
        handles
    }

    /// Stops accepting work: ingress lanes close and observers are
    /// disconnected. Background tasks stop through their shutdown token.
    pub fn shutdown(&self) {
        let lanes = self.gateway.close_lanes();
        self.events.close_all();
        info!(event_name = "system.shutdown.drained", lanes, "gateway stopped accepting work");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use switchboard_core::config::{
        AppConfig, ConfigError, ConfigOverrides, LoadOptions, ProfileConfig,
    };
    use switchboard_core::persistence::{InMemoryKvStore, KvStore};

    use super::{assemble, bootstrap, bootstrap_with_config, BootstrapError, Collaborators};

    fn profile(id: &str, priority: u32) -> ProfileConfig {
        ProfileConfig {
            id: id.to_string(),
            provider: "test".to_string(),
            credential_ref: format!("env:{}", id.to_uppercase()),
            api_key: None,
            priority,
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_without_auth_profiles() {
        let result = bootstrap(
            LoadOptions {
                overrides: ConfigOverrides {
                    store_url: Some("sqlite::memory:".to_string()),
                    profiles: Some(Vec::new()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            },
            Collaborators::default(),
        )
        .await;

        let Err(BootstrapError::Config(ConfigError::Validation(message))) = result else {
            panic!("missing profiles should fail validation");
        };
        assert!(message.contains("auth.profiles"));
    }

    #[tokio::test]
    async fn unreachable_store_is_fatal() {
        let mut config = AppConfig::default();
        config.auth.profiles = vec![profile("p1", 1)];
        config.store.url = "sqlite:///switchboard-missing-dir/nested/gateway.db".to_string();

        let result = bootstrap_with_config(config, Collaborators::default()).await;

        assert!(matches!(result, Err(BootstrapError::Store(_))));
    }

    #[tokio::test]
    async fn bootstrap_opens_a_file_store() {
        let Ok(dir) = tempfile::TempDir::new() else {
            panic!("temp dir should be creatable");
        };
        let url = format!("sqlite://{}", dir.path().join("gateway.db").display());
        let result = bootstrap(
            LoadOptions {
                overrides: ConfigOverrides {
                    store_url: Some(url),
                    profiles: Some(vec![profile("p1", 1), profile("p2", 2)]),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            },
            Collaborators::default(),
        )
        .await;

        let Ok(app) = result else {
            panic!("bootstrap should succeed with valid overrides");
        };
        assert!(app.store.ping().await.is_ok());
        assert_eq!(app.profiles.summary().await.available, 2);
        assert!(app.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn assemble_restores_persisted_profile_state() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let mut config = AppConfig::default();
        config.auth.profiles = vec![profile("p1", 1), profile("p2", 2)];

        let first = assemble(config.clone(), store.clone(), Collaborators::default()).await;
        let failing = switchboard_core::domain::profile::ProfileId("p1".to_string());
        first.profiles.report_failure(&failing).await;
        drop(first);

        let second = assemble(config, store, Collaborators::default()).await;
        let summary = second.profiles.summary().await;
        assert_eq!(summary.cooling, 1);
        assert_eq!(summary.available, 1);
    }
}
