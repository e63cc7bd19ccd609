//! Registry of live feature bindings.
//!
//! Maps `(resource, feature)` to the accessor a connector handed out when the
//! feature was enabled. Gateways subscribe to [`BindingEvent`]s to learn when
//! features appear and disappear.

use crate::configuration::FeatureKind;
use crate::error::SnampError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};


const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A feature as exposed by a running connector.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub name: String,
    pub kind: FeatureKind,
}

impl FeatureDescriptor {
    pub fn new(name: impl Into<String>, kind: FeatureKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn attribute(name: impl Into<String>) -> Self {
        Self::new(name, FeatureKind::Attribute)
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self::new(name, FeatureKind::Event)
    }

    pub fn operation(name: impl Into<String>) -> Self {
        Self::new(name, FeatureKind::Operation)
    }
}

/// One bound feature with its live accessor.
#[derive(Clone, Debug)]
pub struct FeatureBinding<H> {
    pub resource: String,
    pub descriptor: FeatureDescriptor,
    pub accessor: H,
}

/// Change notification published on every bind and unbind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BindingEvent {
    Bound {
        resource: String,
        feature: FeatureDescriptor,
    },
    Unbound {
        resource: String,
        feature: FeatureDescriptor,
    },
}

impl BindingEvent {
    pub fn resource(&self) -> &str {
        match self {
            BindingEvent::Bound { resource, .. } | BindingEvent::Unbound { resource, .. } => {
                resource
            }
        }
    }
}

/// Handle on the binding event stream. Dropping it ends the subscription.
pub struct BindingSubscription {
    receiver: broadcast::Receiver<BindingEvent>,
}

impl BindingSubscription {
    /// Waits for the next event. Returns `None` once the registry is gone.
    ///
    /// A subscriber that fell behind skips the events it missed and carries on
    /// with the oldest one still buffered.
    pub async fn recv(&mut self) -> Option<BindingEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Binding subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<BindingEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Thread-safe registry of feature bindings keyed by resource then feature.
pub struct BindingRegistry<H> {
    bindings: DashMap<String, HashMap<String, FeatureBinding<H>>>,
    events: broadcast::Sender<BindingEvent>,
}

impl<H: Clone + Send + Sync + 'static> BindingRegistry<H> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            bindings: DashMap::new(),
            events,
        }
    }

    /// Binds a feature. Fails with `BindingConflict` if it is already bound.
    pub fn bind(
        &self,
        resource: &str,
        descriptor: FeatureDescriptor,
        accessor: H,
    ) -> Result<(), SnampError> {
        let mut features = self.bindings.entry(resource.to_string()).or_default();
        if features.contains_key(&descriptor.name) {
            return Err(SnampError::BindingConflict {
                resource: resource.to_string(),
                feature: descriptor.name,
            });
        }

        features.insert(
            descriptor.name.clone(),
            FeatureBinding {
                resource: resource.to_string(),
                descriptor: descriptor.clone(),
                accessor,
            },
        );
        drop(features);

        debug!(
            resource = %resource,
            feature = %descriptor.name,
            kind = %descriptor.kind,
            "Feature bound"
        );
        self.publish(BindingEvent::Bound {
            resource: resource.to_string(),
            feature: descriptor,
        });
        Ok(())
    }

    /// Unbinds a feature. Absent bindings are a no-op.
    pub fn unbind(&self, resource: &str, feature: &str) -> Option<FeatureBinding<H>> {
        let removed = {
            let mut features = self.bindings.get_mut(resource)?;
            features.remove(feature)
        };
        // Drop empty resource entries so listing stays clean
        self.bindings.remove_if(resource, |_, features| features.is_empty());

        let binding = removed?;
        debug!(resource = %resource, feature = %feature, "Feature unbound");
        self.publish(BindingEvent::Unbound {
            resource: resource.to_string(),
            feature: binding.descriptor.clone(),
        });
        Some(binding)
    }

    /// Unbinds every feature of a resource, returning how many were bound.
    pub fn unbind_all(&self, resource: &str) -> usize {
        let Some((_, features)) = self.bindings.remove(resource) else {
            return 0;
        };
        let count = features.len();
        for binding in features.into_values() {
            self.publish(BindingEvent::Unbound {
                resource: resource.to_string(),
                feature: binding.descriptor,
            });
        }
        debug!(resource = %resource, count = count, "All features unbound");
        count
    }

    pub fn lookup(&self, resource: &str, feature: &str) -> Option<FeatureBinding<H>> {
        self.bindings
            .get(resource)
            .and_then(|features| features.get(feature).cloned())
    }

    /// Copy of the current bindings of a resource, sorted by feature name.
    ///
    /// Later binds and unbinds never show up in a returned list.
    pub fn list_bindings(&self, resource: &str) -> Vec<FeatureBinding<H>> {
        let mut bindings: Vec<FeatureBinding<H>> = self
            .bindings
            .get(resource)
            .map(|features| features.values().cloned().collect())
            .unwrap_or_default();
        bindings.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        bindings
    }

    /// Descriptors bound for a resource, sorted by name.
    pub fn features(&self, resource: &str) -> Vec<FeatureDescriptor> {
        self.list_bindings(resource)
            .into_iter()
            .map(|binding| binding.descriptor)
            .collect()
    }

    /// Names of resources with at least one binding, sorted.
    pub fn resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = self.bindings.iter().map(|e| e.key().clone()).collect();
        resources.sort();
        resources
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.iter().map(|e| e.value().len()).sum()
    }

    pub fn subscribe(&self) -> BindingSubscription {
        BindingSubscription {
            receiver: self.events.subscribe(),
        }
    }

    fn publish(&self, event: BindingEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl<H: Clone + Send + Sync + 'static> Default for BindingRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
