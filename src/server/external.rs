//! Kiku server external API module implementation.

use crate::server::{RequestId, RequesterId};

use serde::{Deserialize, Serialize};

/// Request received from client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Put a new value into key.
    Put {
        requester: RequesterId,
        req_id: RequestId,
        key: String,
        value: String,
    },

    /// Get the value of given key.
    Get {
        requester: RequesterId,
        req_id: RequestId,
        key: String,
    },

    /// Progress probe, replied with the server's next free instance ID.
    StorageSize,
}

/// Reply back to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Reply to Put request.
    Put { ok: bool },

    /// Reply to Get request. `value` is `None` if key not found, in which
    /// case `ok` is false.
    Get { ok: bool, value: Option<String> },

    /// Reply to progress probe.
    StorageSize { size: u64 },

    /// Server could not serve the request (e.g., it is closing).
    Error { msg: String },
}
