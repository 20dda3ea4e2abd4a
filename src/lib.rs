//! # nimbus: Live Status-Aggregation Node
//!
//! nimbus collects point-in-time snapshots and log events emitted by a
//! distributed compute backend, holds them as versioned mutable state, and
//! exposes that state to remote clients through named readable properties
//! and invokable functions, pushing change notifications asynchronously.
//!
//! ## Architecture
//!
//! ```text
//! Collector ──▶ StateNode ──▶ UpdateQueue ──▶ Subscribers
//!                  ▲
//!                  │
//!            PropertyRegistry ◀── remote reads / invokes
//! ```
//!
//! - [`state::StateNode`] holds the versioned field set behind a single
//!   mutation section, so readers never observe a torn write.
//! - [`registry::PropertyRegistry`] is the fixed name → handler table
//!   built once at startup.
//! - [`update_queue::UpdateQueue`] decouples mutation from notification
//!   delivery: producers enqueue O(1) change records, a background
//!   dispatcher fans them out, and a slow subscriber can never block the
//!   producing path.
//! - [`system::System`] wires the three together with an explicit
//!   lifecycle: construct at startup, `shutdown()` to stop.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use nimbus::{config::NodeConfig, message::LogMessage, system::System};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let system = System::new(&NodeConfig::default())?;
//! let (_id, mut updates) = system.subscribe("totalMessagesEver")?;
//!
//! system.on_log_message(LogMessage::new("backend worker joined"));
//!
//! let notification = updates.recv().await.unwrap();
//! println!("version is now {}", notification.version);
//! system.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod registry;
pub mod state;
pub mod system;
pub mod timestamp;
pub mod update_queue;

// Re-exports
pub use config::NodeConfig;
pub use error::{NimbusError, NimbusResult};
pub use message::{LogBuffer, LogMessage, SystemSnapshot};
pub use registry::{PropertyRegistry, RegistryError, Value};
pub use state::{Field, FieldValue, StateError, StateNode, Versioned};
pub use system::{System, SystemError, SystemStatus};
pub use timestamp::Timestamp;
pub use update_queue::{
    ChangeEvent, DispatchError, DispatcherState, Notification, SubscriptionId,
    SubscriptionReceiver, UpdateQueue, UpdateSink,
};
