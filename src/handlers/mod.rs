//! Event handlers dispatched by the worker, one module per event family.

pub mod dm;
pub mod outbound;
pub mod recovery;
pub mod schedule;

use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::{AgentGateway, SessionStore};
use crate::channels::DiscordApi;
use crate::config::{BotConfig, Settings};
use crate::events::EventStore;

/// Everything a handler may touch. Built once at boot and shared.
pub struct HandlerContext {
    pub store: Arc<EventStore>,
    pub api: DiscordApi,
    pub agent: Arc<AgentGateway>,
    pub sessions: SessionStore,
    pub config: Arc<BotConfig>,
    /// Settings snapshot from boot; the schedule handler reloads from disk
    /// instead so edits take effect without a restart.
    pub settings: Arc<Settings>,
    pub settings_path: PathBuf,
}
