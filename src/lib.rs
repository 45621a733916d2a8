//! Live notification sync for the ops dashboard: a reconnecting push-stream
//! client, a cached notification store and per-category unread badges.

pub mod api;
pub mod badges;
mod consts;
mod core;
pub mod diagnostics;
mod error;
pub mod model;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod store;
pub mod stream;
pub mod transport;

pub use error::{Error, Result};
