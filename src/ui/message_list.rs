use std::fmt::Write;

use crate::app::{ListView, ListViewState};

/// Render the inbox list as plain text, one numbered row per message.
pub fn view(state: &ListViewState) -> String {
    let mut out = String::new();

    let status = if state.refreshing { "  (refreshing...)" } else { "" };
    let _ = writeln!(out, "Inbox ({} unread){}", state.unread, status);

    if let Some(banner) = &state.banner {
        let _ = writeln!(out, "! {banner}");
    }

    if let Some(hint) = state.empty_hint {
        let _ = writeln!(out, "{hint}");
        return out;
    }

    for (index, row) in state.rows.iter().enumerate() {
        let unread = if row.unread { "● " } else { "  " };
        let icon = if row.icon_url.is_some() { " [icon]" } else { "" };
        let _ = writeln!(out, "{:>3}. {}{}{}", index + 1, unread, row.subject, icon);
        let _ = writeln!(out, "       {}", row.date);
        if !row.preview.is_empty() {
            let _ = writeln!(out, "       {}", row.preview);
        }
    }
    out
}

/// Prints every frame to stdout.
#[derive(Debug, Default)]
pub struct TerminalList;

impl ListView for TerminalList {
    fn render(&mut self, state: &ListViewState) {
        println!("{}", view(state));
    }
}
