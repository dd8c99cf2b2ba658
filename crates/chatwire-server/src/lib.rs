//! chatwire relay server.
//!
//! One tokio task per connected client runs its [`Session`] read loop. The
//! shared [`SessionRegistry`] fans chat lines, roster updates and file
//! announcements out to every session and serves stored files from the
//! [`FileStore`].
//!
//! ```no_run
//! use chatwire_server::{ChatServer, ServerConfig};
//!
//! # async fn run() -> Result<(), chatwire_server::ServerError> {
//! let server = ChatServer::bind_with_config(
//!     "0.0.0.0:9000".parse().unwrap(),
//!     ServerConfig::default(),
//! )
//! .await?;
//! server.run().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;

pub use config::Config;
pub use registry::SessionRegistry;
pub use server::{ChatServer, ServerConfig, ServerError};
pub use session::{Session, SessionId};
pub use store::{FileSource, FileStore, StoreError, StoredFile};
