use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a BLE backend behind the [`Transport`](crate::transport::Transport) trait.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// Link-level hiccup (dropped connection, GATT write failure, ...)
    #[error("BLE communication failed: {0}")]
    Transient(String),

    /// Backend/bus error (DBus-style); the engine backs off before tearing down
    #[error("BLE backend error: {0}")]
    Backend(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Errors the dispatch layer retries within its attempt budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Backend(_) | Self::Closed)
    }

    /// Errors normalized to the single user-facing "not found" message.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Unreachable(_))
    }
}

/// The primary error type for the `chihiros-lib` library.
#[derive(Error, Debug)]
pub enum ChihirosError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Dose {ml} mL out of range (0.2..=999.9)")]
    DoseOutOfRange { ml: String },

    #[error("Invalid hex payload: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Characteristic {0} missing")]
    CharacteristicMissing(Uuid),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{}", crate::constants::NOT_FOUND_MSG)]
    DeviceUnreachable { detail: String },

    #[error("Disconnected while waiting for a notification")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChihirosError {
    /// Wrap a transport error, folding not-found/unreachable into [`ChihirosError::DeviceUnreachable`].
    pub fn from_transport(err: TransportError) -> Self {
        if err.is_unreachable() {
            ChihirosError::DeviceUnreachable {
                detail: err.to_string(),
            }
        } else {
            ChihirosError::Transport(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, ChihirosError>;
