//! The application seam.
//!
//! An [`Application`] is invoked exactly once per session, on the first
//! request, with the session lock held. It builds the initial windows and
//! registers the actions everything else flows through. All later requests
//! are served from the registries it populated.

use crate::error::AppError;
use crate::session::SessionCx;

pub trait Application: Send + Sync {
    /// Entry point, called once when a session is created.
    fn main(&self, cx: &mut SessionCx<'_>) -> Result<(), AppError>;
}

impl<F> Application for F
where
    F: Fn(&mut SessionCx<'_>) -> Result<(), AppError> + Send + Sync,
{
    fn main(&self, cx: &mut SessionCx<'_>) -> Result<(), AppError> {
        self(cx)
    }
}
