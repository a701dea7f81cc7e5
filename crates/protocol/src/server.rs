//! Server → Client messages

use serde::{Deserialize, Serialize};

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Lifecycle
    Hello {
        session_id: String,
    },

    // Relay notifications
    AgentAvailable {
        name: String,
    },
    RequesterWaiting {
        requester_session_id: String,
    },
    RequesterDisconnected {
        requester_session_id: String,
    },

    // Chat payload. `from_session_id` is set when a requester wrote it.
    ChatMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_session_id: Option<String>,
    },

    // Record store notifications
    CourseAdded {
        message: String,
    },

    Pong,

    // Errors
    Error {
        code: String,
        message: String,
    },
}
