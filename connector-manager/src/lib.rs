//! SNAMP connector manager - runs connectors and gateways from configuration.
//!
//! Connectors attach to managed resources and expose their features;
//! gateways republish those features through outward protocols. Both are
//! plugins created by factories registered at startup, and both are driven
//! by configuration changes computed by the `snamp` crate.
//!
//! # Architecture
//!
//! ```text
//!   target configuration (file / HTTP)
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       Agent                              │
//! │  - diff against baseline                 │
//! │  - persist, forget failed activations    │
//! └─────────────────────────────────────────┘
//!          ↓ changeset
//! ┌─────────────────────────────────────────┐
//! │       Lifecycle Manager                  │
//! │  - resources first, then gateways        │
//! │  - one update window per instance        │
//! └─────────────────────────────────────────┘
//!          ↓
//!   connectors → feature bindings → gateways
//! ```
//!
//! # Writing a Connector
//!
//! ```no_run
//! use anyhow::Result;
//! use async_trait::async_trait;
//! use connector_manager::{CoalescedUpdate, Connector, ManagedInstance};
//! use serde_json::Value;
//! use snamp::binding::FeatureDescriptor;
//! use snamp::configuration::ResourceConfiguration;
//!
//! struct Thermometer;
//!
//! #[async_trait]
//! impl ManagedInstance<ResourceConfiguration> for Thermometer {
//!     fn name(&self) -> &str {
//!         "thermometer"
//!     }
//!
//!     async fn end_update(&self, _update: &CoalescedUpdate<ResourceConfiguration>) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn close(&self) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[async_trait]
//! impl Connector for Thermometer {
//!     fn list_features(&self) -> Vec<FeatureDescriptor> {
//!         vec![FeatureDescriptor::attribute("temperature")]
//!     }
//!
//!     async fn read_feature(&self, _name: &str) -> Result<Value> {
//!         Ok(Value::from(21.5))
//!     }
//!
//!     async fn write_feature(&self, _name: &str, _value: Value) -> Result<()> {
//!         anyhow::bail!("read-only")
//!     }
//! }
//! ```

mod connector;
pub mod agent;
pub mod api;
pub mod connectors;
pub mod gateways;
pub mod manager;
pub mod registry;
pub mod reload;
pub mod supervisor;

pub use agent::{Agent, ReconcileOutcome};
pub use connector::{
    sync_bindings, CoalescedUpdate, Connector, FeatureAccessor, FeatureBindings, Gateway,
    ManagedInstance,
};
pub use manager::{ApplyFailure, ApplyReport, LifecycleManager};
pub use registry::{builtin_registry, InstanceFactory, PluginRegistry};
