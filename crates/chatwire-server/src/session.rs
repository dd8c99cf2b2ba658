//! Per-connection session: handshake, read loop, upload state machine.

use crate::registry::SessionRegistry;
use chatwire_proto::{
    ClientFrame, FileSink, FrameReader, ProtocolError, ServerFrame, Transfer, TransferError,
    TransferLimits, ValidationError,
};
use rand::Rng;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Server-side upload state machine
pub type UploadTransfer = Transfer<FileSink>;

/// Opaque session identifier (128 random bits, hex encoded)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier
    #[must_use]
    pub fn random() -> Self {
        let mut id = [0u8; 16];
        rand::thread_rng().fill(&mut id[..]);
        Self(hex::encode(id))
    }

    /// Identifier as sent on the wire
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One connected client
///
/// The socket write half and the upload state each sit behind their own
/// lock: broadcasts from other sessions write concurrently with this
/// session's own replies, and the cleanup task may abort the upload while
/// a chunk is being handled.
pub struct Session {
    id: SessionId,
    username: String,
    peer_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    upload: Mutex<UploadTransfer>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Read the opening handshake from a freshly accepted socket
    ///
    /// Returns the session together with the reader its loop consumes.
    ///
    /// # Errors
    ///
    /// Fails if the first frame is not a handshake, the username is empty,
    /// the peer disconnects, or nothing arrives within `timeout`.
    pub async fn handshake(
        stream: TcpStream,
        limits: TransferLimits,
        timeout: Duration,
    ) -> Result<(Arc<Self>, FrameReader<OwnedReadHalf>), ProtocolError> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half).with_max_chunk_size(limits.max_chunk_size);

        let username = tokio::time::timeout(timeout, reader.read_handshake())
            .await
            .map_err(|_| ProtocolError::HandshakeTimeout)??;
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(ProtocolError::EmptyUsername);
        }

        let session = Arc::new(Self {
            id: SessionId::random(),
            username,
            peer_addr,
            writer: Mutex::new(write_half),
            upload: Mutex::new(Transfer::new(limits)),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        Ok((session, reader))
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Username from the handshake
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Remote address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether teardown has started
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one encoded frame to this client
    ///
    /// A failed write wakes the read loop so the session is torn down.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Disconnected`] once the session is closed,
    /// or the socket error.
    pub async fn send(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Disconnected);
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(frame).await {
            drop(writer);
            self.shutdown.notify_one();
            return Err(e.into());
        }
        Ok(())
    }

    /// Encode and write one frame
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn send_frame(&self, frame: &ServerFrame) -> Result<(), ProtocolError> {
        self.send(&frame.encode()).await
    }

    /// Send a server line to this client only
    pub async fn notify_error(&self, text: &str) {
        let frame = ServerFrame::Message {
            text: text.to_string(),
        };
        if let Err(e) = self.send_frame(&frame).await {
            debug!(session = %self.id, "failed to deliver notification: {e}");
        }
    }

    /// Run the read loop until the connection ends, then tear down
    pub async fn run(
        self: Arc<Self>,
        mut reader: FrameReader<OwnedReadHalf>,
        registry: Arc<SessionRegistry>,
    ) {
        loop {
            let result = tokio::select! {
                result = reader.read_client_frame() => result,
                () = self.shutdown.notified() => break,
            };

            match result {
                Ok(frame) => self.dispatch(frame, &registry).await,
                Err(ProtocolError::Disconnected) => {
                    debug!(session = %self.id, "peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(session = %self.id, user = %self.username, "read error: {e}");
                    break;
                }
            }
        }

        self.disconnect(&registry).await;
    }

    async fn dispatch(&self, frame: ClientFrame, registry: &SessionRegistry) {
        debug!(session = %self.id, frame = frame.frame_type(), "frame received");
        match frame {
            ClientFrame::Message { text } => {
                info!(user = %self.username, "{text}");
                registry.broadcast_message(&self.username, &text).await;
            }
            ClientFrame::UploadStart { name, size } => {
                self.begin_upload(&name, size, registry).await;
            }
            ClientFrame::UploadChunk { data } => {
                let result = self.upload.lock().await.chunk(&data).await;
                match result {
                    Ok(progress) => {
                        debug!(
                            session = %self.id,
                            received = progress.transferred,
                            expected = progress.expected,
                            "chunk accepted"
                        );
                    }
                    Err(e) => self.reject_upload(e).await,
                }
            }
            ClientFrame::InvalidChunk { declared } => {
                let max = self.upload.lock().await.limits().max_chunk_size;
                self.reject_upload(
                    ValidationError::InvalidChunkSize {
                        size: i64::from(declared),
                        max,
                    }
                    .into(),
                )
                .await;
            }
            ClientFrame::UploadComplete => {
                let result = self.upload.lock().await.complete().await;
                match result {
                    Ok(done) => registry.publish_upload(self, done).await,
                    Err(e) => self.reject_upload(e).await,
                }
            }
            ClientFrame::DownloadRequest { name } => {
                info!(user = %self.username, file = %name, "download requested");
                registry.serve_download(self, &name).await;
            }
            ClientFrame::Handshake { .. } => {
                warn!(session = %self.id, "repeated handshake ignored");
            }
            ClientFrame::Unknown(opcode) => {
                warn!(session = %self.id, user = %self.username, opcode, "unknown opcode");
            }
        }
    }

    async fn begin_upload(&self, raw_name: &str, size: i64, registry: &SessionRegistry) {
        let mut upload = self.upload.lock().await;
        let (file_name, size) = match upload.prepare(raw_name, size) {
            Ok(prepared) => prepared,
            Err(e) => {
                drop(upload);
                warn!(user = %self.username, file = raw_name, "upload rejected: {e}");
                self.notify_error(&format!("Upload of {raw_name} rejected ({e})")).await;
                return;
            }
        };

        let sink = match registry.store().create_staging().await {
            Ok(sink) => sink,
            Err(e) => {
                drop(upload);
                warn!(user = %self.username, file = %file_name, "cannot stage upload: {e}");
                self.notify_error(&format!("Upload of {file_name} failed (server storage error)"))
                    .await;
                return;
            }
        };

        info!(user = %self.username, file = %file_name, size, "upload started");
        if let Err(e) = upload.start(file_name.clone(), size, sink).await {
            drop(upload);
            self.notify_error(&format!("Upload of {file_name} rejected ({e})")).await;
        }
    }

    /// Report a failed upload step to this client
    ///
    /// Chunks and completions arriving with no upload in progress are
    /// dropped quietly: they trail an upload that was already rejected.
    async fn reject_upload(&self, err: TransferError) {
        if matches!(
            err,
            TransferError::Validation(ValidationError::NoActiveTransfer)
        ) {
            debug!(session = %self.id, "upload frame without active upload discarded");
            return;
        }

        warn!(user = %self.username, "upload error: {err}");
        let text = match &err {
            TransferError::Validation(e) => format!("Upload rejected ({e})"),
            TransferError::Timeout { elapsed } => {
                format!("Upload timed out after {} seconds", elapsed.as_secs())
            }
            TransferError::Io(_) => "Upload failed (server storage error)".to_string(),
        };
        self.notify_error(&text).await;
    }

    /// Abort the upload if it has outlived its timeout
    ///
    /// Returns `true` if an upload was aborted.
    pub async fn abort_stale_upload(&self) -> bool {
        let mut upload = self.upload.lock().await;
        if !upload.is_timed_out() {
            return false;
        }
        let aborted = upload.abort("timed out").await;
        drop(upload);

        if let Some(file_name) = aborted {
            self.notify_error(&format!("Upload of {file_name} timed out")).await;
        }
        true
    }

    /// Tear the session down; only the first call has any effect
    pub async fn disconnect(&self, registry: &SessionRegistry) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.upload.lock().await.abort("connection closed").await;
        registry.disconnect(self).await;

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(session = %self.id, "socket shutdown: {e}");
        }
        info!(user = %self.username, session = %self.id, "client disconnected");
    }
}
