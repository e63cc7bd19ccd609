//! Built-in gateways.

pub mod journal;
