//! HTML rendering of windows.
//!
//! The dispatcher hands the current window to a [`Renderer`] once the
//! application has finished mutating the session. Rendering never mutates
//! state, so a window can be re-rendered on every request that targets it.

use crate::session::{SessionState, Window, WindowKind};

/// Turns a window into a response body.
pub trait Renderer: Send + Sync {
    fn render(&self, state: &SessionState, window: &Window) -> String;

    /// Body for an internal error response. `reset_uri` restarts the session.
    fn render_error(&self, reset_uri: &str, message: &str) -> String;
}

// ============================================================================
// HtmlRenderer
// ============================================================================

/// The built-in HTML 4 renderer.
#[derive(Default)]
pub struct HtmlRenderer;

impl HtmlRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl Renderer for HtmlRenderer {
    fn render(&self, state: &SessionState, window: &Window) -> String {
        match &window.kind {
            WindowKind::Page(page) => {
                let mut out = String::with_capacity(1024);
                out.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
                out.push_str(&format!(
                    "<meta http-equiv=\"Content-Type\" content=\"text/html; charset={}\">\n",
                    page.charset
                ));
                if page.refresh_seconds > 0 {
                    out.push_str(&format!(
                        "<meta http-equiv=\"Refresh\" content=\"{}\">\n",
                        page.refresh_seconds
                    ));
                }
                if let Some(title) = &page.title {
                    out.push_str(&format!("<title>{}</title>\n", escape(title)));
                }
                if let Some(stylesheet) = &page.stylesheet {
                    out.push_str(&format!(
                        "<link rel=\"stylesheet\" type=\"text/css\" href=\"{}\">\n",
                        escape(stylesheet)
                    ));
                }
                out.push_str("</head>\n");
                match page.scroll_to {
                    Some((x, y)) => out.push_str(&format!(
                        "<body onload=\"window.scrollTo({x}, {y});\">\n"
                    )),
                    None => out.push_str("<body>\n"),
                }
                if let Some(widget) = &page.widget {
                    out.push_str(&widget(state));
                }
                out.push_str("\n</body>\n</html>\n");
                out
            }

            WindowKind::Frameset(frameset) => {
                let target = if state.script_name.is_empty() {
                    state.script_path.as_str()
                } else {
                    state.script_name.as_str()
                };

                let mut out = String::with_capacity(512);
                out.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
                if let Some(title) = &frameset.title {
                    out.push_str(&format!("<title>{}</title>\n", escape(title)));
                }
                out.push_str("</head>\n<frameset");
                if let Some(rows) = &frameset.rows {
                    out.push_str(&format!(" rows=\"{}\"", escape(rows)));
                }
                if let Some(cols) = &frameset.cols {
                    out.push_str(&format!(" cols=\"{}\"", escape(cols)));
                }
                out.push_str(">\n");
                for action_id in &frameset.action_ids {
                    out.push_str(&format!(
                        "<frame src=\"{target}?action={action_id}\">\n"
                    ));
                }
                out.push_str("</frameset>\n</html>\n");
                out
            }

            // The Location header carries the target; the body is empty.
            WindowKind::Redirect(_) => String::new(),
        }
    }

    fn render_error(&self, reset_uri: &str, message: &str) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<title>Internal error</title>\n</head>\n<body>\n\
             <h1>Internal error</h1>\n<p>{}</p>\n\
             <p><a href=\"{}\">Restart your session</a></p>\n\
             </body>\n</html>\n",
            escape(message),
            escape(reset_uri)
        )
    }
}

fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
