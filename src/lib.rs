pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod filter;
pub mod output;
pub mod prompt;
pub mod target;
pub mod transfer;
pub mod tui;
