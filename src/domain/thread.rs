use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one conversation thread: `(server_id, room_id, thread_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey {
    pub server_id: String,
    pub room_id: String,
    pub thread_id: String,
}

impl ThreadKey {
    pub fn new(
        server_id: impl Into<String>,
        room_id: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            room_id: room_id.into(),
            thread_id: thread_id.into(),
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.server_id, self.room_id, self.thread_id)
    }
}
