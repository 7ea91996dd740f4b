//! Common test utilities.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::Response;
use axum::http::header;

use stateroom::app::Application;
use stateroom::auth::MemoryAuthStore;
use stateroom::config::Config;
use stateroom::demo::DemoApp;
use stateroom::pool::{DbPool, NullConnector};
use stateroom::render::HtmlRenderer;
use stateroom::server::{self, AppState, Services};
use stateroom::session::{ReapParams, SessionRegistry};

/// Create a test `AppState` running the given application.
pub fn test_state_with_app(app: Arc<dyn Application>) -> AppState {
    AppState {
        services: Services {
            registry: Arc::new(SessionRegistry::new(
                ReapParams::default(),
                // Zero interval so every request may sweep.
                Duration::from_millis(0),
            )),
            pool: DbPool::new(Arc::new(NullConnector)),
            auth: Arc::new(MemoryAuthStore::new()),
            renderer: Arc::new(HtmlRenderer::new()),
            app,
            config: Arc::new(Config::default()),
        },
    }
}

/// Create a test `AppState` running the demo hit counter.
pub fn test_state() -> AppState {
    test_state_with_app(Arc::new(DemoApp))
}

/// Create a test app running the demo hit counter.
pub fn test_app() -> Router {
    server::build_app(test_state())
}

/// Extract the value of a cookie set by the response.
pub fn set_cookie(response: &Response<Body>, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            value
                .strip_prefix(&prefix)
                .map(|rest| rest.split(';').next().unwrap_or(rest).to_string())
        })
}

/// Pull the first `?action=<id>` link out of a rendered page.
pub fn first_action_id(body: &str) -> u64 {
    let start = body.find("?action=").expect("no action link in body") + "?action=".len();
    let digits: String = body[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().expect("malformed action link")
}
