#![doc = "Common types shared across the fine-delay workspace."]

pub mod config;
pub mod error;
pub mod metrics;
pub mod state;
pub mod time;
pub mod units;

pub use config::*;
pub use error::*;
pub use metrics::*;
pub use state::*;
pub use time::*;
pub use units::*;
