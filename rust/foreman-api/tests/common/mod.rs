//! Shared fixtures for the integration suites: in-memory services, a
//! recording chat sink, and simulated worker connections.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;

use foreman_api::chat::recording::RecordingChat;
use foreman_api::commands::{BotConfig, BotRegistry, UserCommand};
use foreman_api::config::AppConfig;
use foreman_api::connection::{ConnectionHandle, Outbound};
use foreman_api::domain::{ApiKey, Project};
use foreman_api::server::Services;
use foreman_api::storage::Storage;
use foreman_protocol::{Frame, Inbound, Message, TaskSubmit};

pub const CHANNEL: &str = "C-proj";
pub const ANCHOR: &str = "1700000000.000100";
pub const USER: &str = "U-dev";

/// Wired services plus observability handles for assertions.
pub struct Harness {
    pub services: Services,
    pub chat: Arc<RecordingChat>,
}

/// Build services over in-memory storage with one seeded project and one
/// worker credential.
pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

/// Same as [`harness`] with a configuration hook.
pub async fn harness_with(configure: impl FnOnce(&mut AppConfig)) -> Harness {
    let mut config = AppConfig::default();
    config.offline_queue.retry_attempts = 2;
    config.offline_queue.retry_delay_ms = 1;
    configure(&mut config);

    let storage = Storage::in_memory();
    storage
        .projects
        .upsert(&Project {
            id: "p1".into(),
            name: "demo".into(),
            local_path: "/srv/demo".into(),
            preferred_agent_id: Some("w1".into()),
            default_model: "standard-1".into(),
            default_budget: 2.0,
            channel_id: CHANNEL.into(),
            deploy_target: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    storage
        .api_keys
        .upsert(&ApiKey {
            key: "fmk-w1".into(),
            agent_id: "w1".into(),
            created_at: Utc::now(),
            expires_at: None,
            revoked: false,
            last_used_at: None,
        })
        .await
        .unwrap();

    let mut bots = BotRegistry::new();
    bots.register(BotConfig {
        name: "coder".into(),
        system_prompt: "You are a careful engineer.".into(),
        model: None,
        allowed_tools: vec!["read_file".into(), "write_file".into(), "shell".into()],
        max_budget: None,
        decompose: false,
        global_context: None,
    });
    bots.register(BotConfig {
        name: "builder".into(),
        system_prompt: "You plan and build features.".into(),
        model: None,
        allowed_tools: vec!["read_file".into(), "write_file".into(), "shell".into()],
        max_budget: None,
        decompose: true,
        global_context: None,
    });

    let chat = Arc::new(RecordingChat::default());
    let services = Services::build(config, storage, chat.clone(), Arc::new(bots));
    Harness { services, chat }
}

/// A worker simulated as a registered connection handle.
pub struct WorkerSim {
    pub agent_id: String,
    receiver: tokio::sync::mpsc::UnboundedReceiver<Outbound>,
}

impl WorkerSim {
    /// Register a fresh connection for `agent_id`.
    pub fn connect(harness: &Harness, agent_id: &str) -> Self {
        let (handle, receiver) = ConnectionHandle::new();
        harness.services.registry.register(agent_id, handle);
        Self {
            agent_id: agent_id.into(),
            receiver,
        }
    }

    /// Everything the worker has received so far, decoded.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(outbound) = self.receiver.try_recv() {
            if let Outbound::Text(text) = outbound {
                messages.push(Frame::decode(&text).expect("worker received bad frame").message);
            }
        }
        messages
    }

    /// Next `TaskSubmit` the worker received; panics if none arrived.
    pub fn expect_submit(&mut self) -> TaskSubmit {
        for message in self.drain() {
            if let Message::TaskSubmit(submit) = message {
                return submit;
            }
        }
        panic!("no task_submit received by {}", self.agent_id);
    }

    /// Feed a worker-originated message through the router, as the gateway
    /// read loop would.
    pub async fn send(&self, harness: &Harness, message: Message) {
        let inbound = Inbound {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            message,
        };
        harness
            .services
            .router
            .dispatch(&self.agent_id, inbound)
            .await;
    }
}

/// A plain user command against the seeded project.
pub fn command(bot: &str, command_kind: &str, prompt: &str) -> UserCommand {
    UserCommand {
        channel_id: CHANNEL.into(),
        thread_ts: None,
        user_id: USER.into(),
        anchor_ts: Some(ANCHOR.into()),
        bot_name: bot.into(),
        command: command_kind.into(),
        prompt: prompt.into(),
        attachments: Vec::new(),
    }
}
