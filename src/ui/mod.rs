//! Plain-text render surfaces for the demo binary.

pub mod message_list;
pub mod message_view;

pub use message_list::TerminalList;
pub use message_view::TerminalDetail;
