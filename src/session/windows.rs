//! Per-session window registry.
//!
//! A window is the unit the dispatcher renders: an ordinary page wrapping a
//! widget, a frameset whose frames are fetched through their own action ids,
//! or a redirect. Window ids come from a process-wide monotonic counter but
//! are only ever looked up within the owning session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::StatusCode;

use crate::session::SessionState;
use crate::session::actions::ActionId;

pub type WindowId = u64;

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

/// Renders the widget content of an ordinary page.
pub type WidgetFn = Arc<dyn Fn(&SessionState) -> String + Send + Sync>;

pub const DEFAULT_STYLESHEET: &str = "/styles/default.css";
pub const DEFAULT_CHARSET: &str = "utf-8";

// ============================================================================
// Window Kinds
// ============================================================================

pub struct Page {
    pub title: Option<String>,
    pub stylesheet: Option<String>,
    pub charset: String,
    /// Refresh period in seconds (0 = no refresh).
    pub refresh_seconds: u32,
    pub scroll_to: Option<(u32, u32)>,
    pub widget: Option<WidgetFn>,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            title: None,
            stylesheet: Some(DEFAULT_STYLESHEET.to_string()),
            charset: DEFAULT_CHARSET.to_string(),
            refresh_seconds: 0,
            scroll_to: None,
            widget: None,
        }
    }
}

pub struct Frameset {
    pub title: Option<String>,
    /// Frameset layout specs, e.g. `"70,*"`.
    pub rows: Option<String>,
    pub cols: Option<String>,
    /// One action id per frame; the frame src carries the id.
    pub action_ids: Vec<ActionId>,
}

pub enum WindowKind {
    Page(Page),
    Frameset(Frameset),
    Redirect(String),
}

// ============================================================================
// Window
// ============================================================================

pub struct Window {
    id: WindowId,
    pub kind: WindowKind,
}

impl Window {
    pub(crate) fn new(kind: WindowKind) -> Self {
        Self {
            id: NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed),
            kind,
        }
    }

    pub fn id(&self) -> WindowId {
        self.id
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            WindowKind::Redirect(_) => StatusCode::FOUND,
            _ => StatusCode::OK,
        }
    }

    pub fn as_page_mut(&mut self) -> Option<&mut Page> {
        match &mut self.kind {
            WindowKind::Page(page) => Some(page),
            _ => None,
        }
    }

    pub fn as_frameset_mut(&mut self) -> Option<&mut Frameset> {
        match &mut self.kind {
            WindowKind::Frameset(frameset) => Some(frameset),
            _ => None,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Map from window id to window, owned by one session.
#[derive(Default)]
pub struct WindowRegistry {
    windows: HashMap<WindowId, Window>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, window: Window) -> WindowId {
        let id = window.id();
        self.windows.insert(id, window);
        id
    }

    pub fn get(&self, id: WindowId) -> Option<&Window> {
        self.windows.get(&id)
    }

    pub fn get_mut(&mut self, id: WindowId) -> Option<&mut Window> {
        self.windows.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<WindowId> {
        let mut ids: Vec<WindowId> = self.windows.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
