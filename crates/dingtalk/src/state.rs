use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use {tokio::task::JoinHandle, tokio_util::sync::CancellationToken};

use crate::{
    auth::TokenCache, config::DingTalkAccountConfig, outbound::DingTalkSender, stats::StatsHandle,
    stream::StreamClient,
};

/// Shared account state map.
pub type AccountStateMap = Arc<RwLock<HashMap<String, AccountState>>>;

/// Per-account runtime state, alive from `start_account` to `stop_account`.
pub struct AccountState {
    pub account_id: String,
    pub config: Arc<DingTalkAccountConfig>,
    pub app_key: String,
    pub tokens: Arc<TokenCache>,
    pub stats: StatsHandle,
    pub client: StreamClient,
    pub sender: Arc<DingTalkSender>,
    pub cancel: CancellationToken,
    pub task: Option<JoinHandle<()>>,
}

impl AccountState {
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}
