pub mod auth;
pub mod config;
pub mod hub;
pub mod liveness;
pub mod registry;
pub mod routes;
pub mod tasks;
pub mod ws;

use tokio_util::sync::CancellationToken;

use crate::auth::CredentialStore;
use crate::config::Config;
use crate::hub::Hub;
use crate::liveness::{LivenessConfig, LivenessMonitor};
use crate::registry::AgentRegistry;
use crate::tasks::{TaskManager, TaskManagerConfig};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub credentials: CredentialStore,
    pub registry: AgentRegistry,
    pub liveness: LivenessMonitor,
    pub hub: Hub,
    pub tasks: TaskManager,
    /// Root of the cancellation tree; cancelling it stops every dispatcher,
    /// worker, and per-task monitor.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the components together and start the background workers.
    /// Must run inside a tokio runtime.
    pub fn new(config: Config) -> Self {
        let shutdown = CancellationToken::new();
        let credentials = CredentialStore::new(config.agent_tokens.clone());

        let registry = AgentRegistry::new();
        registry.spawn_sweeper(
            config.registry_cleanup_interval,
            config.registry_stale_ttl,
            shutdown.clone(),
        );

        let liveness = LivenessMonitor::new(
            registry.clone(),
            LivenessConfig {
                ping_interval: config.ping_interval,
                offline_timeout: config.offline_timeout,
            },
        );

        let hub = Hub::spawn(config.intake_capacity(), shutdown.clone());

        let tasks = TaskManager::new(
            registry.clone(),
            hub.clone(),
            TaskManagerConfig::from_config(&config),
            shutdown.clone(),
        );
        tasks.run_background();

        Self {
            config,
            credentials,
            registry,
            liveness,
            hub,
            tasks,
            shutdown,
        }
    }
}
