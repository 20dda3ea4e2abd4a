//! # Property Registry
//!
//! The remote-facing API surface: a fixed table mapping exposed names to
//! either a read-only property getter or an invokable function handler,
//! both bound to the process's [`StateNode`]. The table is built once at
//! startup through [`RegistryBuilder`] and immutable afterwards; requests
//! look entries up by name.
//!
//! Handlers that mutate state do so through the StateNode's own mutation
//! section. The registry adds no second lock.

use std::collections::HashMap;
use std::sync::Arc;

use strum::IntoEnumIterator;
use thiserror::Error;
use tracing::debug;

use crate::message::{LogMessage, SystemSnapshot};
use crate::state::{Field, FieldValue, StateNode};

/// Argument and result type for the exposed surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Count(u64),
    Message(LogMessage),
    Messages(Vec<LogMessage>),
    Snapshot(SystemSnapshot),
}

impl From<FieldValue> for Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Messages(messages) => Value::Messages(messages),
            FieldValue::Count(count) => Value::Count(count),
            FieldValue::Snapshot(snapshot) => Value::Snapshot(snapshot),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown property: {0}")]
    UnknownProperty(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("invalid argument for {name}: {message}")]
    InvalidArgument { name: String, message: String },

    #[error("name already registered: {0}")]
    AlreadyRegistered(String),

    #[error("field {0} has no exposed property")]
    UncoveredField(Field),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

type PropertyGetter = Arc<dyn Fn(&StateNode) -> Value + Send + Sync>;
type FunctionHandler = Arc<dyn Fn(&StateNode, Value) -> RegistryResult<Value> + Send + Sync>;

/// Tagged handler variant: a registry entry is one or the other, decided
/// at registration time.
#[derive(Clone)]
enum Handler {
    Property { getter: PropertyGetter, field: Field },
    Function(FunctionHandler),
}

/// Immutable name → handler table bound to one StateNode.
pub struct PropertyRegistry {
    node: Arc<StateNode>,
    entries: HashMap<String, Handler>,
}

impl PropertyRegistry {
    pub fn builder(node: Arc<StateNode>) -> RegistryBuilder {
        RegistryBuilder {
            node,
            entries: HashMap::new(),
        }
    }

    /// The standard exposed surface of the status node.
    pub fn standard(node: Arc<StateNode>) -> RegistryResult<Self> {
        Self::builder(node)
            .property("mostRecentMessages", Field::RecentMessages, |node| {
                Value::Messages(node.recent_messages())
            })?
            .property("totalMessagesEver", Field::TotalMessageCount, |node| {
                Value::Count(node.total_message_count())
            })?
            .property("viewOfCumulusSystem", Field::SystemView, |node| {
                Value::Snapshot(node.system_view())
            })?
            .function("clearMostRecentMessages", |node, _arg| {
                node.clear_messages();
                Ok(Value::Unit)
            })?
            .function("clearAndReturnMostRecentMessages", |node, _arg| {
                Ok(Value::Messages(node.drain_messages()))
            })?
            .function("pushNewGlobalUserFacingLogMessage", |node, arg| {
                let Value::Message(message) = arg else {
                    return Err(RegistryError::InvalidArgument {
                        name: "pushNewGlobalUserFacingLogMessage".to_string(),
                        message: "expected a log message".to_string(),
                    });
                };
                node.push_message(message);
                Ok(Value::Unit)
            })?
            .build()
    }

    /// Reads a property by name.
    pub fn read_property(&self, name: &str) -> RegistryResult<Value> {
        match self.entries.get(name) {
            Some(Handler::Property { getter, .. }) => Ok(getter(&self.node)),
            _ => Err(RegistryError::UnknownProperty(name.to_string())),
        }
    }

    /// Invokes a function handler by name against the bound StateNode.
    pub fn invoke(&self, name: &str, argument: Value) -> RegistryResult<Value> {
        match self.entries.get(name) {
            Some(Handler::Function(handler)) => {
                debug!(name, "invoking exposed function");
                handler(&self.node, argument)
            }
            _ => Err(RegistryError::UnknownFunction(name.to_string())),
        }
    }

    /// The field a property reads from, for change subscription.
    pub fn field_of_property(&self, name: &str) -> RegistryResult<Field> {
        match self.entries.get(name) {
            Some(Handler::Property { field, .. }) => Ok(*field),
            _ => Err(RegistryError::UnknownProperty(name.to_string())),
        }
    }

    pub fn property_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, handler)| matches!(handler, Handler::Property { .. }))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, handler)| matches!(handler, Handler::Function(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn node(&self) -> &Arc<StateNode> {
        &self.node
    }
}

/// Builds the registry from a fixed declaration list at startup.
pub struct RegistryBuilder {
    node: Arc<StateNode>,
    entries: HashMap<String, Handler>,
}

impl RegistryBuilder {
    pub fn property<F>(mut self, name: &str, field: Field, getter: F) -> RegistryResult<Self>
    where
        F: Fn(&StateNode) -> Value + Send + Sync + 'static,
    {
        self.insert(
            name,
            Handler::Property {
                getter: Arc::new(getter),
                field,
            },
        )?;
        Ok(self)
    }

    pub fn function<F>(mut self, name: &str, handler: F) -> RegistryResult<Self>
    where
        F: Fn(&StateNode, Value) -> RegistryResult<Value> + Send + Sync + 'static,
    {
        self.insert(name, Handler::Function(Arc::new(handler)))?;
        Ok(self)
    }

    /// Finalizes the table. Every declared field must be covered by at
    /// least one property, so a field-table inconsistency fails startup
    /// instead of surfacing at runtime.
    pub fn build(self) -> RegistryResult<PropertyRegistry> {
        for field in Field::iter() {
            let covered = self.entries.values().any(
                |handler| matches!(handler, Handler::Property { field: f, .. } if *f == field),
            );
            if !covered {
                return Err(RegistryError::UncoveredField(field));
            }
        }
        Ok(PropertyRegistry {
            node: self.node,
            entries: self.entries,
        })
    }

    fn insert(&mut self, name: &str, handler: Handler) -> RegistryResult<()> {
        if self.entries.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        self.entries.insert(name.to_string(), handler);
        Ok(())
    }
}
