//! Live session set, event broadcast and file serving.

use crate::session::{Session, SessionId};
use crate::store::{FileSource, FileStore, StoreError};
use chatwire_proto::frame::encode_chunk;
use chatwire_proto::{CompletedTransfer, DownloadNotice, Opcode, ServerFrame};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Relay line for a chat message
#[must_use]
pub fn chat_line(sender: &str, text: &str) -> String {
    format!("{sender}: {text}")
}

/// Set of connected sessions plus the shared file store
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<Vec<Arc<Session>>>,
    /// Serializes roster announcements against disconnect announcements so
    /// no client sees a departed user re-announced
    announce: Mutex<()>,
    store: FileStore,
    download_chunk_size: usize,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(store: FileStore, download_chunk_size: usize) -> Self {
        Self {
            sessions: RwLock::new(Vec::new()),
            announce: Mutex::new(()),
            store,
            download_chunk_size: download_chunk_size.max(1),
        }
    }

    /// Shared file store
    #[must_use]
    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Add a session without announcing it
    pub async fn add(&self, session: Arc<Session>) {
        self.sessions.write().await.push(session);
    }

    /// Remove a session by id
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let index = sessions.iter().position(|s| s.id() == id)?;
        Some(sessions.remove(index))
    }

    /// Weak handles to every live session, in join order
    pub async fn snapshot(&self) -> Vec<Weak<Session>> {
        self.sessions.read().await.iter().map(Arc::downgrade).collect()
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Usernames of live sessions, in join order
    pub async fn usernames(&self) -> Vec<String> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|s| s.username().to_string())
            .collect()
    }

    /// Add a session and broadcast the full roster to everyone
    pub async fn register(&self, session: Arc<Session>) {
        let _announce = self.announce.lock().await;
        info!(
            user = %session.username(),
            session = %session.id(),
            peer = %session.peer_addr(),
            "client connected"
        );
        self.add(session).await;
        self.broadcast_roster().await;
    }

    /// Send one opcode-1 frame per live session to every live session
    pub async fn broadcast_roster(&self) {
        let roster: Vec<u8> = self
            .sessions
            .read()
            .await
            .iter()
            .flat_map(|s| {
                ServerFrame::UserConnected {
                    username: s.username().to_string(),
                    uid: s.id().to_string(),
                }
                .encode()
            })
            .collect();
        self.broadcast(&roster).await;
    }

    /// Write already encoded frames to every live session
    ///
    /// Best-effort: a failed write is logged and the loop moves on.
    pub async fn broadcast(&self, frames: &[u8]) {
        for session in self.snapshot().await {
            let Some(session) = session.upgrade() else {
                continue;
            };
            if session.is_closed() {
                continue;
            }
            if let Err(e) = session.send(frames).await {
                warn!(
                    user = %session.username(),
                    session = %session.id(),
                    "broadcast write failed: {e}"
                );
            }
        }
    }

    /// Relay a chat message from `sender`
    pub async fn broadcast_message(&self, sender: &str, text: &str) {
        let frame = ServerFrame::Message {
            text: chat_line(sender, text),
        };
        self.broadcast(&frame.encode()).await;
    }

    /// Relay a server line with no sender prefix
    pub async fn broadcast_system(&self, text: &str) {
        let frame = ServerFrame::Message {
            text: text.to_string(),
        };
        self.broadcast(&frame.encode()).await;
    }

    /// Move a finished upload into storage and announce it
    pub async fn publish_upload(&self, sender: &Session, done: CompletedTransfer<PathBuf>) {
        let staged = done.output;
        match self.store.persist(&staged, &done.file_name).await {
            Ok(stored) => {
                info!(
                    user = %sender.username(),
                    file = %stored.name,
                    size = stored.size,
                    elapsed_ms = done.elapsed.as_millis() as u64,
                    "upload stored"
                );
                let frame = ServerFrame::FileAnnounced {
                    sender: sender.username().to_string(),
                    name: stored.name,
                };
                self.broadcast(&frame.encode()).await;
            }
            Err(e) => {
                warn!(
                    user = %sender.username(),
                    file = %done.file_name,
                    "failed to store upload: {e}"
                );
                if let Err(e) = tokio::fs::remove_file(&staged).await {
                    debug!(path = %staged.display(), "staging cleanup: {e}");
                }
                sender
                    .notify_error(&format!(
                        "Upload of {} failed (server storage error)",
                        done.file_name
                    ))
                    .await;
            }
        }
    }

    /// Stream a stored file back to the requesting session only
    pub async fn serve_download(&self, session: &Session, name: &str) {
        let source = match self.store.lookup(name).await {
            Ok(source) => source,
            Err(StoreError::NotFound(_) | StoreError::UnsafeName(_)) => {
                warn!(user = %session.username(), file = name, "download of unknown file refused");
                session
                    .notify_error(&DownloadNotice::Unavailable(name).line())
                    .await;
                return;
            }
            Err(e) => {
                warn!(user = %session.username(), file = name, "download lookup failed: {e}");
                session
                    .notify_error(&DownloadNotice::Failed(name).line())
                    .await;
                return;
            }
        };

        let start = ServerFrame::DownloadStart {
            name: name.to_string(),
            size: i64::try_from(source.size()).unwrap_or(i64::MAX),
        };
        if session.send_frame(&start).await.is_err() {
            return;
        }

        let streamed = match source {
            FileSource::Cached(bytes) => self.stream_cached(session, &bytes).await,
            FileSource::Disk { path, size } => self.stream_disk(session, &path, size).await,
        };

        match streamed {
            Ok(true) => {
                if session.send_frame(&ServerFrame::DownloadComplete).await.is_ok() {
                    info!(user = %session.username(), file = name, "download served");
                }
            }
            Ok(false) => debug!(
                user = %session.username(),
                file = name,
                "download interrupted by disconnect"
            ),
            Err(e) => {
                warn!(user = %session.username(), file = name, "download read failed: {e}");
                session
                    .notify_error(&DownloadNotice::Failed(name).line())
                    .await;
            }
        }
    }

    /// Returns `false` if the recipient went away
    async fn stream_cached(&self, session: &Session, bytes: &[u8]) -> std::io::Result<bool> {
        for piece in bytes.chunks(self.download_chunk_size) {
            if session
                .send(&encode_chunk(Opcode::DownloadChunk, piece))
                .await
                .is_err()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn stream_disk(
        &self,
        session: &Session,
        path: &std::path::Path,
        size: u64,
    ) -> std::io::Result<bool> {
        let file = tokio::fs::File::open(path).await?;
        let mut file = file.take(size);
        let mut buf = vec![0u8; self.download_chunk_size];

        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                return Ok(true);
            }
            if session
                .send(&encode_chunk(Opcode::DownloadChunk, &buf[..filled]))
                .await
                .is_err()
            {
                return Ok(false);
            }
        }
    }

    /// Remove a session and tell the others it left
    pub async fn disconnect(&self, session: &Session) {
        let _announce = self.announce.lock().await;
        if self.remove(session.id()).await.is_none() {
            return;
        }

        let frame = ServerFrame::UserDisconnected {
            uid: session.id().to_string(),
        };
        self.broadcast(&frame.encode()).await;
        self.broadcast_system(&format!("{} has disconnected.", session.username()))
            .await;
    }

    /// Abort every upload that has outlived its timeout
    ///
    /// Returns the number of uploads aborted.
    pub async fn reap_stale_uploads(&self) -> usize {
        let mut reaped = 0;
        for session in self.snapshot().await {
            let Some(session) = session.upgrade() else {
                continue;
            };
            if session.abort_stale_upload().await {
                reaped += 1;
            }
        }
        reaped
    }

    /// Spawn the periodic upload reaper
    ///
    /// The task ends once the registry is dropped.
    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let reaped = registry.reap_stale_uploads().await;
                if reaped > 0 {
                    info!(reaped, "aborted stale uploads");
                }
            }
        })
    }
}
