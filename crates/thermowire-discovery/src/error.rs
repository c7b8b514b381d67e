use thermowire_core::{AddressParseError, BusId, RegistryError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Bus {0} is already registered")]
    DuplicateBus(BusId),
    #[error("Bus {0} is not registered")]
    UnknownBus(BusId),
    #[error("Name {0} is already used by another device")]
    NameInUse(String),
    #[error("Device name must not be empty")]
    EmptyName,
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressParseError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Failed to start notification worker: {0}")]
    Worker(#[from] std::io::Error),
    #[error("Engine task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
