//! Shared application state handed to every handler.

use std::sync::Arc;

use crate::channel::ChannelRegistry;
use crate::ledger::AbuseLedger;
use crate::notes::NoteStore;
use crate::server::config::RelayConfig;

/// Cheap to clone: every service shares its tables behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub registry: ChannelRegistry,
    pub ledger: AbuseLedger,
    pub notes: NoteStore,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(ledger: AbuseLedger, notes: NoteStore, config: RelayConfig) -> Self {
        Self {
            registry: ChannelRegistry::new(),
            ledger,
            notes,
            config: Arc::new(config),
        }
    }
}
