//! Service assembly and server startup.

use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::chat::{http::HttpChatClient, recording::RecordingChat, ChatClient, ChatNotifier, RetryPolicy};
use crate::commands::{BotConfig, BotRegistry, CommandService};
use crate::config::AppConfig;
use crate::gateway::{self, GatewayState};
use crate::handlers::LifecycleHandlers;
use crate::logging::OpTimer;
use crate::queue::OfflineQueue;
use crate::registry::AgentRegistry;
use crate::retention::RetentionSweep;
use crate::router::MessageRouter;
use crate::scheduler::Scheduler;
use crate::storage::Storage;
use crate::streaming::{StreamAccumulator, StreamSettings};
use crate::workflow::WorkflowDriver;

/// Everything the fabric runs on, wired once at boot.
pub struct Services {
    pub config: Arc<AppConfig>,
    pub storage: Storage,
    pub chat: Arc<ChatNotifier>,
    pub registry: Arc<AgentRegistry>,
    pub queue: Arc<OfflineQueue>,
    pub commands: Arc<CommandService>,
    pub driver: Arc<WorkflowDriver>,
    pub streams: Arc<StreamAccumulator>,
    pub router: Arc<MessageRouter>,
    pub scheduler: Arc<Scheduler>,
    pub retention: Arc<RetentionSweep>,
}

impl Services {
    /// Wire every service over the given collaborators.
    pub fn build(
        config: AppConfig,
        storage: Storage,
        chat_client: Arc<dyn ChatClient>,
        bots: Arc<BotRegistry>,
    ) -> Self {
        let config = Arc::new(config);
        let timer = OpTimer::new("server", "wire_services");

        let chat = Arc::new(ChatNotifier::new(chat_client, RetryPolicy::default()));
        let registry = Arc::new(AgentRegistry::new());
        let queue = Arc::new(OfflineQueue::new(
            storage.clone(),
            registry.clone(),
            chat.clone(),
            config.offline_queue.clone(),
        ));
        let streams = Arc::new(StreamAccumulator::new(
            chat.clone(),
            StreamSettings {
                edit_every_deltas: config.stream.edit_every_deltas,
                edit_min_interval: std::time::Duration::from_millis(
                    config.stream.edit_min_interval_ms,
                ),
                ..StreamSettings::default()
            },
        ));
        let commands = Arc::new(CommandService::new(
            storage.clone(),
            registry.clone(),
            queue.clone(),
            chat.clone(),
            bots.clone(),
            config.dispatch.clone(),
            config.rate_limit.clone(),
        ));
        let driver = Arc::new(WorkflowDriver::new(
            storage.clone(),
            chat.clone(),
            registry.clone(),
            commands.clone(),
            bots,
        ));
        commands.bind_driver(driver.clone());

        let handlers = Arc::new(LifecycleHandlers::new(
            storage.clone(),
            chat.clone(),
            streams.clone(),
            driver.clone(),
        ));
        let router = Arc::new(MessageRouter::new(handlers, registry.clone()));
        let scheduler = Arc::new(Scheduler::new(storage.clone(), commands.clone()));
        let retention = Arc::new(RetentionSweep::new(
            storage.clone(),
            config.retention.clone(),
        ));

        timer.finish();
        Self {
            config,
            storage,
            chat,
            registry,
            queue,
            commands,
            driver,
            streams,
            router,
            scheduler,
            retention,
        }
    }

    /// Spawn every periodic task: heartbeat sweep, offline drains, the
    /// scheduler tick, and the retention sweep. The returned set aborts
    /// them all on shutdown.
    pub fn start_background(&self) -> BackgroundTasks {
        let mut handles = Vec::new();
        handles.push(gateway::spawn_sweeper(
            self.registry.clone(),
            self.config.clone(),
        ));
        handles.extend(self.queue.spawn());
        handles.push(self.scheduler.spawn());
        handles.push(self.retention.spawn());
        BackgroundTasks { handles }
    }

    /// The axum application serving the worker socket endpoint.
    pub fn app(&self) -> Router {
        let state = GatewayState {
            registry: self.registry.clone(),
            storage: self.storage.clone(),
            router: self.router.clone(),
            config: self.config.clone(),
        };
        gateway::router()
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// Handles for every spawned ticker; aborted on shutdown so no timer leaks
/// past the server's lifetime.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Full boot: pick storage and chat implementations from config, wire
/// services, and serve until interrupted.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let storage = match &config.database.url {
        Some(url) => {
            let timer = OpTimer::new("server", "database");
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await?;
            let backend = crate::storage::postgres::PgBackend::new(pool.clone());
            backend.ensure_schema().await?;
            timer.finish();
            Storage::postgres(pool)
        }
        None => {
            tracing::warn!("no database configured, using in-memory storage");
            Storage::in_memory()
        }
    };

    let chat_client: Arc<dyn ChatClient> = match &config.chat.token {
        Some(token) => Arc::new(HttpChatClient::new(config.chat.base_url.clone(), token)),
        None => {
            tracing::warn!("no chat token configured, notifications stay in-process");
            Arc::new(RecordingChat::default())
        }
    };

    let mut bots = BotRegistry::new();
    bots.register(BotConfig {
        name: "coder".to_string(),
        system_prompt: "You are a careful software engineer working in the project checkout."
            .to_string(),
        model: None,
        allowed_tools: vec![
            "read_file".into(),
            "write_file".into(),
            "grep".into(),
            "shell".into(),
        ],
        max_budget: None,
        decompose: false,
        global_context: None,
    });

    let services = Services::build(config, storage, chat_client, Arc::new(bots));
    let background = services.start_background();

    let addr = format!(
        "{}:{}",
        services.config.server.host, services.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr, "foreman gateway listening");

    axum::serve(listener, services.app())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    background.shutdown();
    Ok(())
}
