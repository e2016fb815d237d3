//! Client-side inbox: fetches in-app messages, keeps a reconciled local
//! store with read state, loads icons, and drives list/detail presenters.

pub mod app;
pub mod config;
pub mod core;
pub mod ui;
