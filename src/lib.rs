//! Stateroom: a server-side stateful application runtime.
//!
//! Applications run entirely on the server. Each browser gets a session
//! holding its windows, its registered action callbacks, and its borrowed
//! database handles; the dispatcher routes every request to the right
//! session, serializes access to it, and renders the resulting window.
//! Idle sessions are reclaimed by a reaper whose patience grows with use.

pub mod app;
pub mod auth;
pub mod config;
pub mod demo;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod pool;
pub mod render;
pub mod server;
pub mod session;

pub use app::Application;
pub use error::{AppError, ProtocolError};
