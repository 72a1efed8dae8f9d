#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod config;
pub mod controller;
pub mod cursor;
pub mod data;
pub mod feed;
pub mod identity;
pub mod logging;
pub mod merge;
pub mod model;
pub mod reactions;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
