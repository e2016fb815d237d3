use std::fmt::Write;

use crate::app::{DetailState, DetailView, IconState};

/// Render the message detail pane as plain text.
pub fn view(state: &DetailState) -> String {
    let mut out = String::new();
    match state {
        DetailState::Empty => {
            let _ = writeln!(out, "No message selected");
        }
        DetailState::Unavailable { .. } => {
            let _ = writeln!(out, "{}", DetailState::UNAVAILABLE_TEXT);
        }
        DetailState::Showing { message, icon } => {
            let icon = match icon {
                IconState::None => String::new(),
                IconState::Loading => "[icon loading] ".to_string(),
                IconState::Loaded(image) => format!("[icon {}x{}] ", image.width, image.height),
                IconState::Placeholder => "[icon] ".to_string(),
            };
            let _ = writeln!(out, "{}{}", icon, message.subject);
            let _ = writeln!(
                out,
                "Received: {}",
                crate::app::format_date(message.received_at)
            );
            if let Some(main) = &message.main_image_url {
                let _ = writeln!(out, "Image: {main}");
            }
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", message.content);
        }
    }
    out
}

/// Prints every frame to stdout.
#[derive(Debug, Default)]
pub struct TerminalDetail;

impl DetailView for TerminalDetail {
    fn render(&mut self, state: &DetailState) {
        println!("{}", view(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use crate::core::images::DecodedImage;
    use crate::core::models::InboxMessage;

    fn message() -> InboxMessage {
        let mut m = InboxMessage::new("a", "Hello", Utc.timestamp_opt(0, 0).unwrap());
        m.content = "Body text".into();
        m
    }

    #[test]
    fn unavailable_has_explicit_text() {
        let text = view(&DetailState::Unavailable { id: "x".into() });
        assert_eq!(text.trim(), "message no longer available");
    }

    #[test]
    fn showing_includes_icon_and_body() {
        let image = Arc::new(DecodedImage {
            width: 4,
            height: 2,
            rgba: vec![0; 32],
        });
        let text = view(&DetailState::Showing {
            message: message(),
            icon: IconState::Loaded(image),
        });
        assert!(text.starts_with("[icon 4x2] Hello"));
        assert!(text.contains("Received: 1970-01-01 00:00:00"));
        assert!(text.ends_with("Body text\n"));
    }
}
