use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::activities::ActivitySubscription;
use crate::config::Config;
use crate::store::DocumentStore;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub config: Config,
    pub workspace: Option<PathBuf>,
    pub store: Option<DocumentStore>,
    /// Live activity views keyed by subscription id.
    pub subscriptions: BTreeMap<String, ActivitySubscription>,
    pub next_subscription: u64,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            workspace: None,
            store: None,
            subscriptions: BTreeMap::new(),
            next_subscription: 1,
        }
    }
}
