pub mod coordinator;
pub mod engine;
pub mod order_tracker;
pub mod session;

pub use coordinator::MultiExchangeCoordinator;
pub use engine::ExchangeEngine;
pub use order_tracker::OrderTracker;
pub use session::{ExecutionParams, ExecutionSink, SessionHost, TimedOrderState};
