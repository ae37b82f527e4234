// Library exports for integration tests and the binary target.

pub mod config;
pub mod proxy;
pub mod tunnel;
