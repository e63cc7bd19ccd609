// Error kinds shared by every layer
pub mod error;

// Configuration entity model, diff engine and baseline manager
pub mod configuration;

// Configuration persistence (file and in-memory stores)
pub mod persistence;

// Host settings
pub mod config;

// Update-window state machine and shared deadline timer
pub mod update_window;

// Live feature binding registry
pub mod binding;

pub use error::SnampError;
