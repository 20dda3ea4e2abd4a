//! # System
//!
//! Owns the process's StateNode, the property registry, and the background
//! update queue, and wires them together. One `System` exists per running
//! service process: created at startup, handed by reference to
//! collaborators, shut down explicitly. State is discarded at shutdown.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::NodeConfig;
use crate::error::NimbusResult;
use crate::message::{LogMessage, SystemSnapshot};
use crate::registry::{PropertyRegistry, RegistryError, RegistryResult, Value};
use crate::state::StateNode;
use crate::update_queue::{DispatcherState, SubscriptionId, SubscriptionReceiver, UpdateQueue};

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("registry construction failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("shutdown failed: {0}")]
    ShutdownFailed(String),
}

pub type SystemResult<T> = Result<T, SystemError>;

/// Point-in-time observability snapshot of the node itself.
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub dispatcher_state: DispatcherState,
    pub queue_depth: usize,
    pub dropped_events: u64,
    pub subscriber_count: usize,
    pub total_messages: u64,
    pub buffered_messages: usize,
    pub evicted_messages: u64,
}

pub struct System {
    state: Arc<StateNode>,
    registry: PropertyRegistry,
    updates: UpdateQueue,
    shutdown_tx: broadcast::Sender<()>,
}

impl System {
    /// Builds the node: update queue first, then the StateNode holding a
    /// producer handle to it, then the registry bound to the node. Fails
    /// if the registry declaration list is inconsistent, so a broken field
    /// table prevents startup rather than surfacing per request.
    pub fn new(config: &NodeConfig) -> SystemResult<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let updates = UpdateQueue::start(config, shutdown_tx.subscribe());
        let state = Arc::new(StateNode::new(config, updates.sink()));
        let registry = PropertyRegistry::standard(state.clone())?;

        info!(
            properties = registry.property_names().len(),
            functions = registry.function_names().len(),
            "status node initialized"
        );

        Ok(Self {
            state,
            registry,
            updates,
            shutdown_tx,
        })
    }

    // Ingress from the backend collector.

    /// Replaces the stored backend snapshot.
    pub fn on_system_snapshot(&self, snapshot: SystemSnapshot) {
        self.state.set_system_view(snapshot);
    }

    /// Records one log event.
    pub fn on_log_message(&self, message: LogMessage) {
        self.state.push_message(message);
    }

    // Egress to remote clients.

    pub fn read_property(&self, name: &str) -> RegistryResult<Value> {
        self.registry.read_property(name)
    }

    pub fn invoke(&self, name: &str, argument: Value) -> RegistryResult<Value> {
        self.registry.invoke(name, argument)
    }

    /// Registers interest in a property; the receiver gets one
    /// notification per observed version transition until unsubscribed.
    /// Unknown property names are rejected.
    pub fn subscribe(
        &self,
        property: &str,
    ) -> NimbusResult<(SubscriptionId, SubscriptionReceiver)> {
        let field = self.registry.field_of_property(property)?;
        Ok(self.updates.subscribe(field)?)
    }

    /// Idempotent; unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.updates.unsubscribe(id);
    }

    pub fn state(&self) -> &Arc<StateNode> {
        &self.state
    }

    pub fn registry(&self) -> &PropertyRegistry {
        &self.registry
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            dispatcher_state: self.updates.state(),
            queue_depth: self.updates.queue_depth(),
            dropped_events: self.updates.dropped_events(),
            subscriber_count: self.updates.subscriber_count(),
            total_messages: self.state.total_message_count(),
            buffered_messages: self.state.recent_messages().len(),
            evicted_messages: self.state.evicted_messages(),
        }
    }

    /// Signals the dispatcher to drain and stop, bounded by the configured
    /// grace period even if subscribers are unresponsive.
    pub async fn shutdown(&self) -> SystemResult<()> {
        info!("system shutting down");
        self.shutdown_tx
            .send(())
            .map_err(|e| SystemError::ShutdownFailed(e.to_string()))?;
        self.updates
            .join()
            .await
            .map_err(|e| SystemError::ShutdownFailed(e.to_string()))?;
        Ok(())
    }
}
