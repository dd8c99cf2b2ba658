//! chatwire client library.
//!
//! [`NetworkAgent`] drives the chat protocol from the client end:
//!
//! ```no_run
//! use chatwire_client::{AgentConfig, AgentEvent, NetworkAgent};
//!
//! # async fn run() -> Result<(), chatwire_client::ClientError> {
//! let (agent, mut events) = NetworkAgent::new(AgentConfig::default());
//! agent.connect("alice").await?;
//! agent.send_message("hello").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let AgentEvent::MessageReceived { sender, text } = event {
//!         println!("{}: {text}", sender.as_deref().unwrap_or("*"));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod error;
pub mod events;
pub mod progress;

pub use agent::{AgentConfig, NetworkAgent, RosterEntry};
pub use error::ClientError;
pub use events::AgentEvent;
