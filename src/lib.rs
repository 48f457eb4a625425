pub mod adapters;
pub mod api;
pub mod broker;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod error;
pub mod retry;
pub mod services;
pub mod store;
pub mod validation;

pub use config::AppConfig;
pub use error::{FarmError, Result};
pub use services::TerminalFarm;
pub use store::FarmStore;
