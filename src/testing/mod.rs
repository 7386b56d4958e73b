//! Testing utilities and mock implementations
//!
//! In-memory transport and a scripted broker for exercising sessions without
//! a real MQTT server.

pub mod mocks;

pub use mocks::*;
