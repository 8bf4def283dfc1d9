pub mod config;
pub mod counter;
mod engine;
pub mod error;
pub mod history;
pub mod http;
pub mod keys;
pub mod reconcile;
pub mod recorder;
pub mod session;
pub mod signature;
pub mod telemetry;

pub use engine::{CounterEngine, CounterEngineBuilder};
pub use error::CounterError;
