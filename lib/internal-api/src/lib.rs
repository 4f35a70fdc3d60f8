//! Client for the keel internal API.
//!
//! The internal API listens on a local Unix domain socket and speaks
//! newline-delimited JSON frames. Activities use it to reach platform
//! services; workers use it to wait for the platform before they start.

pub mod client;
pub mod error;
pub mod protocol;

pub use client::{InternalApiClient, InternalApiConfig, READY_PATH};
pub use error::InternalApiError;
pub use protocol::{ApiOutcome, ApiRequest, ApiResponse, Method};
