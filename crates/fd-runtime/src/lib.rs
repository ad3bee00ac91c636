#![doc = "Runtime engine for the fine-delay timing core."]

pub mod board;
pub mod calibrator;
pub mod capture;
pub mod compensator;
pub mod output;
pub mod periodic;
pub mod ring;
pub mod timebase;

pub use board::*;
pub use calibrator::*;
pub use capture::*;
pub use compensator::*;
pub use output::*;
pub use periodic::PeriodicWorker;
pub use ring::*;
pub use timebase::*;
