//! HTTP routes.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub mod chat;
pub mod models;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(chat::routes())
        .merge(models::routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;

    use doubao_chat::ChatRelay;
    use doubao_core::config::{default_models, Fingerprint};
    use doubao_core::RelayConfig;
    use doubao_signer::{Signer, SignerError};

    use crate::state::AppState;

    /// Signer that refuses to sign; route tests only cover paths that
    /// fail before any signing happens, and this makes a violation loud.
    pub struct StubSigner;

    #[async_trait::async_trait]
    impl Signer for StubSigner {
        async fn signed_url(
            &self,
            _base_url: &str,
            _params: &[(&str, &str)],
        ) -> Result<String, SignerError> {
            Err(SignerError::TokenMissing)
        }

        fn current_token(&self) -> Option<String> {
            None
        }

        fn update_token(&self, _token: String) {}
    }

    pub fn test_router() -> Router {
        let config = RelayConfig {
            port: 0,
            request_timeout: Duration::from_secs(5),
            session_ttl: Duration::from_secs(60),
            chrome_debug_port: 0,
            headless: true,
            cookies: vec!["sessionid=test".into()],
            fingerprint: Fingerprint {
                device_id: "d".into(),
                fp: "f".into(),
                web_id: "w".into(),
                tea_uuid: "t".into(),
            },
            model_mapping: default_models(),
            default_model: "doubao-pro-chat".into(),
        };
        let relay = Arc::new(ChatRelay::new(config, Arc::new(StubSigner)).unwrap());
        super::build_router(Arc::new(AppState::new(relay)))
    }
}
