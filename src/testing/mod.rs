//! Testing utilities and mock implementations
//!
//! In-memory stand-ins for the bus and the device connection so bridge
//! behaviour can be exercised without a broker or a matter-server.

pub mod mocks;

pub use mocks::*;
