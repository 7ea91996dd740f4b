//! Built-in demo application.
//!
//! A single-page hit counter that exercises the action and window machinery:
//! the page widget renders a link back into the session, the linked action
//! bumps a counter captured by both closures, and the next render shows the
//! new value. Serves as the default application when none is wired in.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::app::Application;
use crate::error::AppError;
use crate::session::{SessionCx, Window};

pub struct DemoApp;

impl Application for DemoApp {
    fn main(&self, cx: &mut SessionCx<'_>) -> Result<(), AppError> {
        let title = cx.config().get_string("title", "Stateroom demo");
        let clicks = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&clicks);
        let bump = cx.register_action(Arc::new(move |_cx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let window = cx.state.open_page();
        let counter = Arc::clone(&clicks);
        if let Some(page) = cx.state.windows.get_mut(window).and_then(Window::as_page_mut) {
            page.title = Some(title.clone());
            page.widget = Some(Arc::new(move |state| {
                let who = state
                    .submitted
                    .get("name")
                    .or_else(|| state.args.get("name"))
                    .map(String::as_str)
                    .unwrap_or("world");
                format!(
                    "<h1>{title}</h1>\n<p>Hello, {who}.</p>\n\
                     <p>Clicked {} times.</p>\n\
                     <p><a href=\"?action={bump}\">Click me</a></p>",
                    counter.load(Ordering::SeqCst)
                )
            }));
        }
        cx.state.set_main_window(window);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{HtmlRenderer, Renderer};
    use crate::server::test_support::test_services;
    use crate::session::SessionState;

    #[tokio::test]
    async fn counter_page_round_trip() {
        let services = test_services();
        let mut state = SessionState::test_blank();
        let mut cx = SessionCx {
            state: &mut state,
            services: &services,
        };

        DemoApp.main(&mut cx).unwrap();
        let window = cx.state.main_window.unwrap();
        assert_eq!(cx.state.current_window, Some(window));

        let action = *cx.state.actions.ids().first().unwrap();
        cx.run_action(action).unwrap();
        cx.run_action(action).unwrap();

        let renderer = HtmlRenderer::new();
        let html = renderer.render(&state, state.windows.get(window).unwrap());
        assert!(html.contains("Clicked 2 times."));
        assert!(html.contains(&format!("?action={action}")));
        assert!(html.contains("Hello, world."));
    }
}
