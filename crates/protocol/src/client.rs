//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Roles
    AnnounceAgent {
        name: String,
    },
    RequestAgent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred_name: Option<String>,
    },

    // Chat
    MessageFromRequester {
        text: String,
    },
    MessageFromAgent {
        to_session_id: String,
        text: String,
    },

    // Keepalive
    Ping,
}
