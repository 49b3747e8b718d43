//! Test doubles shared by unit and integration tests.

pub mod mock_exchange;

pub use mock_exchange::{MockExchange, ScriptedFeed};
