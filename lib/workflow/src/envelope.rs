//! Versioned envelope for everything the engine persists.
//!
//! History events and queued tasks outlive the process that wrote them, so
//! each record carries a format version. Readers accept any version up to
//! [`CURRENT_VERSION`] and refuse newer ones rather than guess.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The envelope version this build writes.
pub const CURRENT_VERSION: u32 = 1;

/// A versioned wrapper around a persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub payload: T,
}

/// Why a persisted record could not be read or written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The bytes are not a valid envelope for this record type.
    Malformed { message: String },
    /// Written by a newer build.
    UnsupportedVersion { version: u32 },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { message } => write!(f, "malformed envelope: {message}"),
            Self::UnsupportedVersion { version } => write!(
                f,
                "envelope version {version} is newer than supported version {CURRENT_VERSION}"
            ),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl<T> Envelope<T> {
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> Envelope<T> {
    /// Wraps `payload` and serializes it to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(payload: T) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(&Self::new(payload)).map_err(|e| EnvelopeError::Malformed {
            message: e.to_string(),
        })
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Reads a payload back out of JSON bytes.
    ///
    /// The version is checked before the payload is interpreted.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed bytes or a version newer than this build.
    pub fn decode(bytes: &[u8]) -> Result<T, EnvelopeError> {
        #[derive(Deserialize)]
        struct Header {
            version: u32,
            payload: serde_json::Value,
        }

        let header: Header = serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed {
            message: e.to_string(),
        })?;
        if header.version > CURRENT_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                version: header.version,
            });
        }
        serde_json::from_value(header.payload).map_err(|e| EnvelopeError::Malformed {
            message: e.to_string(),
        })
    }
}
