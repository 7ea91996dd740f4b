//! Session management for Stateroom.
//!
//! A session is the per-user aggregate: one action registry, one window
//! registry, authentication state, and the bookkeeping for borrowed database
//! handles. All mutable state lives behind one async mutex per session, so
//! exactly one request mutates a session at a time while unrelated sessions
//! proceed fully in parallel.

pub mod actions;
pub mod registry;
pub mod windows;

pub use actions::{ActionFn, ActionId, ActionRegistry};
pub use registry::SessionRegistry;
pub use windows::{Frameset, Page, WidgetFn, Window, WindowId, WindowKind, WindowRegistry};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::auth::{self, AuthCookie, AuthError};
use crate::config::Config;
use crate::error::AppError;
use crate::pool::{BorrowedHandles, DbError, DbFactory, PooledHandle};
use crate::server::Services;

// ============================================================================
// Identifiers
// ============================================================================

/// Generate a 32-hex-digit random identifier (session ids, auth tokens).
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Check that a client-supplied session id has the valid form
/// (exactly 32 lowercase hex digits). Anything else is ignored.
pub fn valid_session_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

// ============================================================================
// Reap Parameters
// ============================================================================

/// Per-session eviction thresholds, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct ReapParams {
    /// Idle age at which a single-hit session is evicted.
    pub min_seconds: i64,
    /// Ceiling on the idle age regardless of hit count.
    pub max_seconds: i64,
    /// Extra idle allowance earned per hit beyond the first.
    pub inc_seconds: i64,
}

impl Default for ReapParams {
    fn default() -> Self {
        Self {
            min_seconds: 600,
            max_seconds: 3600,
            inc_seconds: 600,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// One user's server-side state.
///
/// The immutable id and the access counters are readable without the lock
/// (the reaper scans them); everything else requires [`Session::lock`].
pub struct Session {
    id: String,
    created: DateTime<Utc>,
    reap: ReapParams,
    hits: AtomicU64,
    last_access_ms: AtomicI64,
    /// Tasks currently trying to acquire the state lock.
    waiters: AtomicUsize,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(id: String, reap: ReapParams) -> Self {
        let now = Utc::now();
        Self {
            id,
            created: now,
            reap,
            hits: AtomicU64::new(1),
            last_access_ms: AtomicI64::new(now.timestamp_millis()),
            waiters: AtomicUsize::new(0),
            state: Mutex::new(SessionState::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        let ms = self.last_access_ms.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(self.created)
    }

    pub fn reap(&self) -> &ReapParams {
        &self.reap
    }

    /// Acquire exclusive access to the session state.
    ///
    /// Requests against the same session serialize here in arrival order;
    /// this is the only place a request legitimately blocks besides I/O.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        // The counter must come back down even if the waiting future is
        // dropped before it ever acquires the lock.
        struct Waiting<'a>(&'a AtomicUsize);
        impl Drop for Waiting<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }

        self.waiters.fetch_add(1, Ordering::SeqCst);
        let waiting = Waiting(&self.waiters);
        let guard = self.state.lock().await;
        drop(waiting);
        guard
    }

    /// Number of tasks currently queued on the lock. When called by a lock
    /// holder this counts only the *other* tasks, which is what the reaper's
    /// eviction protocol needs.
    pub fn queued(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Refresh the last-access timestamp.
    pub fn touch(&self) {
        self.last_access_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Count a request against this session. Returns the new hit count.
    pub fn record_hit(&self) -> u64 {
        self.touch();
        self.hits.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Pretend the session has been idle for `seconds`.
    #[cfg(test)]
    pub(crate) fn backdate(&self, seconds: i64) {
        let ms = Utc::now().timestamp_millis() - seconds * 1000;
        self.last_access_ms.store(ms, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("hits", &self.hits())
            .finish()
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Mutable session state, guarded by the session lock.
pub struct SessionState {
    /// Parameters of the first request, immutable for the session lifetime.
    /// The reserved `reset`/`window`/`action` parameters are stripped.
    pub args: HashMap<String, String>,
    /// Parameters of the current request; valid only while it is served.
    pub submitted: HashMap<String, String>,
    pub peer_addr: Option<SocketAddr>,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    /// Path the application is mounted at, used for cookies and self links.
    pub script_path: String,
    /// Final segment of the script path.
    pub script_name: String,
    pub windows: WindowRegistry,
    pub actions: ActionRegistry,
    pub current_window: Option<WindowId>,
    pub main_window: Option<WindowId>,
    /// Authenticated user (0 = anonymous).
    pub user_id: i64,
    /// Auth cookie scheduled for the current response, if any.
    pub auth_cookie: Option<AuthCookie>,
    /// Database handles currently lent to this session.
    pub borrowed: BorrowedHandles,
}

impl SessionState {
    fn new() -> Self {
        Self {
            args: HashMap::new(),
            submitted: HashMap::new(),
            peer_addr: None,
            host: None,
            user_agent: None,
            script_path: "/".to_string(),
            script_name: String::new(),
            windows: WindowRegistry::new(),
            actions: ActionRegistry::new(),
            current_window: None,
            main_window: None,
            user_id: 0,
            auth_cookie: None,
            borrowed: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    #[cfg(test)]
    pub(crate) fn test_blank() -> Self {
        Self::new()
    }

    pub(crate) fn set_script_path(&mut self, path: &str) {
        self.script_path = path.to_string();
        self.script_name = path.rsplit('/').next().unwrap_or("").to_string();
    }

    // ------------------------------------------------------------------------
    // Window construction
    // ------------------------------------------------------------------------

    /// Register a new ordinary page and make it the current window.
    pub fn open_page(&mut self) -> WindowId {
        let id = self.windows.insert(Window::new(WindowKind::Page(Page::default())));
        self.current_window = Some(id);
        id
    }

    /// Register a new frameset and make it the current window. Each frame's
    /// render callback is registered as its own action.
    pub fn open_frameset(
        &mut self,
        rows: Option<&str>,
        cols: Option<&str>,
        frames: Vec<ActionFn>,
    ) -> WindowId {
        let action_ids = frames
            .into_iter()
            .map(|frame| self.actions.register(frame))
            .collect();

        let id = self.windows.insert(Window::new(WindowKind::Frameset(Frameset {
            title: None,
            rows: rows.map(str::to_string),
            cols: cols.map(str::to_string),
            action_ids,
        })));
        self.current_window = Some(id);
        id
    }

    /// Register a new redirect window and make it the current window.
    pub fn open_redirect(&mut self, uri: &str) -> WindowId {
        let id = self
            .windows
            .insert(Window::new(WindowKind::Redirect(uri.to_string())));
        self.current_window = Some(id);
        id
    }

    /// Replace a frameset's frames. The actions backing the old frames are
    /// unregistered first so their ids go stale instead of lingering.
    pub fn set_frameset_frames(&mut self, id: WindowId, frames: Vec<ActionFn>) -> bool {
        let old_ids = match self.windows.get_mut(id).and_then(Window::as_frameset_mut) {
            Some(frameset) => std::mem::take(&mut frameset.action_ids),
            None => return false,
        };
        for action_id in old_ids {
            self.actions.unregister(action_id);
        }

        let action_ids: Vec<ActionId> = frames
            .into_iter()
            .map(|frame| self.actions.register(frame))
            .collect();

        match self.windows.get_mut(id).and_then(Window::as_frameset_mut) {
            Some(frameset) => {
                frameset.action_ids = action_ids;
                true
            }
            None => false,
        }
    }

    /// Nominate the window future requests default to.
    pub fn set_main_window(&mut self, id: WindowId) {
        self.main_window = Some(id);
    }
}

// ============================================================================
// Session Context
// ============================================================================

/// What application code sees while a request holds the session lock:
/// the session state plus the process-wide services.
pub struct SessionCx<'a> {
    pub state: &'a mut SessionState,
    pub services: &'a Services,
}

impl SessionCx<'_> {
    // ------------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------------

    /// Run a registered action. Unknown ids are ignored: stale ids from old
    /// page renders and guessed ids from probing are client-controlled and
    /// must not fail the request.
    pub fn run_action(&mut self, id: ActionId) -> Result<(), AppError> {
        match self.state.actions.get(id) {
            Some(callback) => callback(self),
            None => {
                debug!(action_id = id, "ignoring unknown action id");
                Ok(())
            }
        }
    }

    /// Register an action callback; see [`ActionRegistry::register`].
    pub fn register_action(&mut self, callback: ActionFn) -> ActionId {
        self.state.actions.register(callback)
    }

    pub fn unregister_action(&mut self, id: ActionId) -> bool {
        self.state.actions.unregister(id)
    }

    // ------------------------------------------------------------------------
    // Database handles
    // ------------------------------------------------------------------------

    /// Borrow a pooled database handle on behalf of this session.
    pub fn get_dbh(&self, factory: &Arc<DbFactory>) -> Result<PooledHandle, DbError> {
        self.services.pool.borrow(factory, &self.state.borrowed)
    }

    /// Return a handle to the pool explicitly (dropping it does the same).
    pub fn put_dbh(&self, handle: PooledHandle) {
        handle.release();
    }

    // ------------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------------

    pub fn user_id(&self) -> i64 {
        self.state.user_id
    }

    /// Log a user in: issue a fresh token through the auth store and schedule
    /// the auth cookie for the current response.
    pub fn login(
        &mut self,
        user_id: i64,
        path: Option<&str>,
        expires: Option<&str>,
    ) -> Result<(), AuthError> {
        let token = random_id();
        self.services.auth.set_token(user_id, &token)?;

        self.state.user_id = user_id;
        self.state.auth_cookie = Some(AuthCookie {
            value: token,
            path: path.map(str::to_string),
            expires: expires.map(auth::parse_expires),
        });
        Ok(())
    }

    /// Log the current user out and schedule the poison cookie so other
    /// windows of the same browser drop their authentication too.
    pub fn logout(&mut self, path: Option<&str>) -> Result<(), AuthError> {
        if self.state.user_id == 0 {
            return Ok(());
        }

        self.services.auth.clear_user(self.state.user_id)?;
        self.state.user_id = 0;
        self.state.auth_cookie = Some(AuthCookie {
            value: auth::POISON.to_string(),
            path: path.map(str::to_string),
            expires: Some(auth::parse_expires("+1y")),
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &Config {
        &self.services.config
    }
}

// ============================================================================
// Tests
// ============================================================================
