//! Built-in connectors.

pub mod memory;
