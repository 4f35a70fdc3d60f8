//! Wire frames for the internal API socket.
//!
//! One JSON object per line in each direction. A connection carries one
//! request and its response.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    #[serde(default)]
    pub body: JsonValue,
}

/// How a request ended, classified by status class.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiOutcome {
    /// 2xx.
    Success { status: u16, body: JsonValue },
    /// 4xx. The request was wrong; retrying it unchanged will not help.
    ClientError { status: u16, body: JsonValue },
    /// 5xx.
    ServerError { status: u16, body: JsonValue },
    /// No response within the request timeout.
    Timeout,
}

impl ApiOutcome {
    /// Classifies a response, or returns `None` for statuses outside 2xx, 4xx and 5xx.
    #[must_use]
    pub fn from_response(response: ApiResponse) -> Option<Self> {
        let ApiResponse { status, body } = response;
        match status {
            200..=299 => Some(Self::Success { status, body }),
            400..=499 => Some(Self::ClientError { status, body }),
            500..=599 => Some(Self::ServerError { status, body }),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns true for outcomes worth retrying: server errors and timeouts.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServerError { .. } | Self::Timeout)
    }
}
