use thiserror::Error;

use crate::registry::RegistryError;
use crate::state::StateError;
use crate::system::SystemError;
use crate::update_queue::DispatchError;

#[derive(Error, Debug)]
pub enum NimbusError {
    #[error("State error: {0}")]
    State(#[from] StateError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("System error: {0}")]
    System(#[from] SystemError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type NimbusResult<T> = Result<T, NimbusError>;

impl NimbusError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        NimbusError::Internal(message.into())
    }
}
