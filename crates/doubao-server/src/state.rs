//! Shared server state.

use std::sync::Arc;

use doubao_chat::ChatRelay;

pub struct AppState {
    pub relay: Arc<ChatRelay>,
}

impl AppState {
    pub fn new(relay: Arc<ChatRelay>) -> Self {
        Self { relay }
    }
}
