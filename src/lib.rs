pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod escrow;
pub mod handlers;
pub mod ledger;
pub mod milestone;
pub mod notifications;
pub mod reconcile;
pub mod server;
pub mod webhook;

pub use error::{AppError, AppResult};
