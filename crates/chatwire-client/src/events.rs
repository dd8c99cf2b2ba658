//! Events emitted by the network agent.

use std::path::PathBuf;

/// Something the presentation layer should react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A user appeared in the roster (first sighting of the uid)
    UserConnected {
        /// Session identifier
        uid: String,
        /// Display name
        username: String,
    },

    /// A user left
    UserDisconnected {
        /// Session identifier
        uid: String,
        /// Display name, if the uid was in the roster
        username: Option<String>,
    },

    /// Chat line from the server
    MessageReceived {
        /// Author, or `None` for server lines
        sender: Option<String>,
        /// Message body without the author prefix
        text: String,
    },

    /// A file is available for download
    FileAnnounced {
        /// Uploader
        sender: String,
        /// Name to request it by
        name: String,
    },

    /// A download chunk was written
    DownloadProgress {
        /// File being downloaded
        name: String,
        /// Completion percentage (0-100)
        percent: u8,
    },

    /// A download finished
    DownloadComplete {
        /// File name
        name: String,
        /// Where it was saved
        path: PathBuf,
    },

    /// A download was abandoned and its partial file removed
    DownloadFailed {
        /// File name
        name: String,
        /// Human-readable cause
        reason: String,
    },

    /// The connection ended
    Disconnected {
        /// Human-readable cause
        reason: String,
    },
}

impl AgentEvent {
    /// Get the event type name
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            AgentEvent::UserConnected { .. } => "UserConnected",
            AgentEvent::UserDisconnected { .. } => "UserDisconnected",
            AgentEvent::MessageReceived { .. } => "MessageReceived",
            AgentEvent::FileAnnounced { .. } => "FileAnnounced",
            AgentEvent::DownloadProgress { .. } => "DownloadProgress",
            AgentEvent::DownloadComplete { .. } => "DownloadComplete",
            AgentEvent::DownloadFailed { .. } => "DownloadFailed",
            AgentEvent::Disconnected { .. } => "Disconnected",
        }
    }
}
