mod admin;
mod health;

pub use admin::{delete_session, get_session, list_sessions, pool_occupancy};
pub use health::{livez, readyz, version};
