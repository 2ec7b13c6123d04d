pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod registry;
pub mod state;
pub mod ws;

pub use config::Config;
pub use error::{AppError, Result};
pub use state::AppState;
