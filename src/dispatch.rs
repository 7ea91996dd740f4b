//! Request dispatch.
//!
//! Every request outside the operational surface lands here and is resolved
//! against a session: a fresh one on first contact (or on an explicit
//! `reset=1`), the cookie-named one afterwards. With the session lock held
//! the dispatcher resolves the target window, runs the requested action, and
//! renders the current window. The reserved query parameters `reset`,
//! `window` and `action` drive this machinery and are never visible to
//! application code.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, warn};

use crate::auth;
use crate::error::ProtocolError;
use crate::server::AppState;
use crate::session::{Session, SessionCx, WindowKind, valid_session_id};

/// Cookie carrying the session id.
pub const SESSION_COOKIE: &str = "sessionid";
/// Cookie carrying the auth token.
pub const AUTH_COOKIE: &str = "auth";

const RESERVED_PARAMS: [&str; 3] = ["reset", "window", "action"];

/// Request body limit for form submissions.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

// ============================================================================
// Entry Point
// ============================================================================

pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let services = &state.services;

    // Opportunistic reaping; coalescing inside keeps this cheap.
    services.registry.sweep().await;

    let method = request.method().clone();
    if !matches!(method, Method::GET | Method::POST | Method::HEAD) {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET, HEAD, POST")],
            "",
        )
            .into_response();
    }

    let script_path = request.uri().path().to_string();
    let peer_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let host = header_string(request.headers(), header::HOST);
    let user_agent = header_string(request.headers(), header::USER_AGENT);
    let cookies = parse_cookies(request.headers());

    let query = request.uri().query().unwrap_or("").to_string();
    let content_type = header_string(request.headers(), header::CONTENT_TYPE);
    let body = match to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "").into_response();
        }
    };
    let params = collect_params(&query, &body, content_type.as_deref());

    let session_id = cookies
        .get(SESSION_COOKIE)
        .filter(|id| valid_session_id(id));
    let existing = if params.contains_key("reset") {
        // An explicit reset destroys the cookie-named session outright, so
        // its window and action ids cannot be replayed into the new one.
        if let Some(id) = session_id {
            services.registry.kill(id).await;
        }
        None
    } else {
        session_id.and_then(|id| services.registry.lookup(id))
    };

    let ingress = Ingress {
        method,
        script_path,
        peer_addr,
        host,
        user_agent,
        auth_token: cookies.get(AUTH_COOKIE).cloned(),
        params,
    };

    match existing {
        Some(session) => serve_existing(&state, &session, ingress).await,
        None => serve_new(&state, ingress).await,
    }
}

/// Per-request facts extracted before the session lock is taken.
struct Ingress {
    method: Method,
    script_path: String,
    peer_addr: Option<SocketAddr>,
    host: Option<String>,
    user_agent: Option<String>,
    auth_token: Option<String>,
    params: HashMap<String, String>,
}

impl Ingress {
    /// Parameters with the reserved dispatch keys stripped.
    fn app_params(&self) -> HashMap<String, String> {
        self.params
            .iter()
            .filter(|(key, _)| !RESERVED_PARAMS.contains(&key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

// ============================================================================
// New Sessions
// ============================================================================

async fn serve_new(state: &AppState, ingress: Ingress) -> Response {
    let services = &state.services;
    let session = services.registry.create();
    let mut guard = session.lock().await;

    guard.set_script_path(&ingress.script_path);
    guard.args = ingress.app_params();
    guard.submitted = ingress.app_params();
    guard.peer_addr = ingress.peer_addr;
    guard.host = ingress.host.clone();
    guard.user_agent = ingress.user_agent.clone();

    // Resolve the auth cookie once, at session birth. The poison sentinel
    // and unknown tokens both leave the session anonymous.
    if let Some(token) = &ingress.auth_token
        && token != auth::POISON
    {
        match services.auth.user_for_token(token) {
            Ok(Some(user_id)) => guard.user_id = user_id,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "auth store lookup failed, serving anonymously"),
        }
    }

    let mut cx = SessionCx {
        state: &mut *guard,
        services,
    };
    if let Err(e) = services.app.main(&mut cx) {
        error!(session_id = session.id(), error = %e, "application entry point failed");
        return error_response(state, &ingress, &e.to_string());
    }

    debug!(
        session_id = session.id(),
        user_id = guard.user_id,
        "created session for request"
    );

    let session_cookie = format!(
        "{}={}; path={}",
        SESSION_COOKIE,
        session.id(),
        guard.script_path
    );
    let mut response = render_current(state, &session, &mut *guard, &ingress);
    guard.submitted.clear();
    if let Ok(value) = HeaderValue::from_str(&session_cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

// ============================================================================
// Existing Sessions
// ============================================================================

async fn serve_existing(state: &AppState, session: &Session, ingress: Ingress) -> Response {
    let services = &state.services;
    let mut guard = session.lock().await;

    // Window resolution happens before anything is mutated, so a request
    // with a bogus window id leaves the session exactly as it found it.
    match ingress.params.get("window") {
        Some(raw) => match raw.parse::<u64>() {
            Ok(id) if guard.windows.get(id).is_some() => guard.current_window = Some(id),
            _ => {
                return error_response(
                    state,
                    &ingress,
                    &ProtocolError::UnknownWindow(raw.clone()).to_string(),
                );
            }
        },
        None => match guard.main_window {
            Some(id) if guard.windows.get(id).is_some() => guard.current_window = Some(id),
            Some(id) => {
                return error_response(
                    state,
                    &ingress,
                    &ProtocolError::UnregisteredCurrentWindow(id).to_string(),
                );
            }
            // No default yet. A session can legitimately reach its second
            // request without a nominated main window when the entry point
            // leaves nomination to an action; that action gets to run and
            // open the window, and render_current raises the protocol error
            // only if none does.
            None => {}
        },
    }

    session.record_hit();
    guard.submitted = ingress.app_params();
    guard.peer_addr = ingress.peer_addr;

    // A poison cookie from any window of this browser logs the session out.
    if ingress.auth_token.as_deref() == Some(auth::POISON) && guard.user_id != 0 {
        debug!(session_id = session.id(), "poison cookie, dropping user");
        guard.user_id = 0;
    }

    if let Some(raw) = ingress.params.get("action") {
        // Malformed ids are treated like stale ones: ignored.
        let action_id = raw.parse::<u64>().unwrap_or(0);
        let mut cx = SessionCx {
            state: &mut *guard,
            services,
        };
        if let Err(e) = cx.run_action(action_id) {
            error!(
                session_id = session.id(),
                action_id,
                error = %e,
                "action failed"
            );
            guard.submitted.clear();
            return error_response(state, &ingress, &e.to_string());
        }
    }

    let response = render_current(state, session, &mut *guard, &ingress);
    guard.submitted.clear();
    response
}

// ============================================================================
// Rendering
// ============================================================================

fn render_current(
    state: &AppState,
    session: &Session,
    guard: &mut crate::session::SessionState,
    ingress: &Ingress,
) -> Response {
    let services = &state.services;

    let window = match guard.current_window.and_then(|id| guard.windows.get(id)) {
        Some(window) => window,
        None => {
            error!(session_id = session.id(), "no current window after dispatch");
            return error_response(state, ingress, &ProtocolError::NoCurrentWindow.to_string());
        }
    };

    let status = window.status();
    let location = match &window.kind {
        WindowKind::Redirect(uri) => Some(uri.clone()),
        _ => None,
    };
    let charset = match &window.kind {
        WindowKind::Page(page) => page.charset.clone(),
        _ => "utf-8".to_string(),
    };
    let body = services.renderer.render(guard, window);

    let mut headers = no_cache_headers();
    if let Ok(value) = HeaderValue::from_str(&format!("text/html; charset={charset}")) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(uri) = location
        && let Ok(value) = HeaderValue::from_str(&uri)
    {
        headers.insert(header::LOCATION, value);
    }
    if let Some(cookie) = guard.auth_cookie.take() {
        let path = cookie.path.as_deref().unwrap_or(&guard.script_path);
        let mut value = format!("{}={}; path={}", AUTH_COOKIE, cookie.value, path);
        if let Some(expires) = &cookie.expires {
            value.push_str("; expires=");
            value.push_str(expires);
        }
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.append(header::SET_COOKIE, value);
        }
    }

    let body = if ingress.method == Method::HEAD {
        String::new()
    } else {
        body
    };

    (status, headers, body).into_response()
}

fn error_response(state: &AppState, ingress: &Ingress, message: &str) -> Response {
    let reset_uri = format!("{}?reset=1", ingress.script_path);
    let body = state.services.renderer.render_error(&reset_uri, message);
    let body = if ingress.method == Method::HEAD {
        String::new()
    } else {
        body
    };

    let mut headers = no_cache_headers();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    (StatusCode::INTERNAL_SERVER_ERROR, headers, body).into_response()
}

/// Session-dependent pages must never be served from a cache.
fn no_cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers
}

// ============================================================================
// Parsing
// ============================================================================

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }
    cookies
}

/// Merge query-string and form-body parameters; the body wins on duplicates.
fn collect_params(query: &str, body: &[u8], content_type: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();

    if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) {
        params.extend(pairs);
    }

    let is_form = content_type
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if is_form && let Ok(pairs) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
        params.extend(pairs);
    }

    params
}

// ============================================================================
// Tests
// ============================================================================
