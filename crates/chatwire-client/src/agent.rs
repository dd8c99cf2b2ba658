//! Client side of the chat protocol.
//!
//! A [`NetworkAgent`] owns one outbound connection. Commands are async
//! methods on the agent; everything the server pushes arrives as
//! [`AgentEvent`]s on the channel returned by [`NetworkAgent::new`].

use crate::error::ClientError;
use crate::events::AgentEvent;
use chatwire_proto::frame::encode_chunk;
use chatwire_proto::{
    ChunkProgress, ClientFrame, DEFAULT_CHUNK_SIZE, DEFAULT_PORT, DownloadNotice, FileSink,
    FrameReader, MAX_CHUNK_SIZE, MAX_FILE_SIZE, Opcode, ProtocolError, ServerFrame, Transfer,
    TransferError, TransferLimits, ValidationError, sanitize_file_name,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server address (`host:port`)
    pub server_addr: String,
    /// Upload chunk size
    pub chunk_size: usize,
    /// Time allowed for the TCP connect
    pub connect_timeout: Duration,
    /// Where downloads without an explicit path are saved
    pub download_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(10),
            download_dir: PathBuf::from("."),
        }
    }
}

/// One connected user as seen by this client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    /// Session identifier
    pub uid: String,
    /// Display name
    pub username: String,
}

/// Connected users in announcement order, unique by uid
#[derive(Debug, Default)]
struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    /// Returns `false` if the uid was already known
    fn insert(&mut self, uid: &str, username: &str) -> bool {
        if self.entries.iter().any(|e| e.uid == uid) {
            return false;
        }
        self.entries.push(RosterEntry {
            uid: uid.to_string(),
            username: username.to_string(),
        });
        true
    }

    fn remove(&mut self, uid: &str) -> Option<String> {
        let index = self.entries.iter().position(|e| e.uid == uid)?;
        Some(self.entries.remove(index).username)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn split_sender(&self, line: &str) -> (Option<String>, String) {
        split_sender(line, self.entries.iter().map(|e| e.username.as_str()))
    }
}

/// Split a relayed chat line into author and body
///
/// The author is the longest known name followed by `": "`; lines that match
/// no known name are server lines.
#[must_use]
pub fn split_sender<'a>(
    line: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> (Option<String>, String) {
    let mut best: Option<&str> = None;
    for name in names {
        if name.is_empty() || best.is_some_and(|b| b.len() >= name.len()) {
            continue;
        }
        let matches = line
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with(": "));
        if matches {
            best = Some(name);
        }
    }

    match best {
        Some(name) => (Some(name.to_string()), line[name.len() + 2..].to_string()),
        None => (None, line.to_string()),
    }
}

#[derive(Debug, Default)]
struct Shared {
    writer: Mutex<Option<OwnedWriteHalf>>,
    roster: RwLock<Roster>,
    pending_downloads: Mutex<HashMap<String, PathBuf>>,
}

#[derive(Debug)]
struct ReadLoop {
    handle: JoinHandle<()>,
    stop: Arc<Notify>,
}

/// Network agent for one chat connection
#[derive(Debug)]
pub struct NetworkAgent {
    config: AgentConfig,
    events: mpsc::UnboundedSender<AgentEvent>,
    shared: Arc<Shared>,
    read_loop: Mutex<Option<ReadLoop>>,
    /// Held for the whole start, chunks, complete sequence of one upload
    upload: Mutex<()>,
}

impl NetworkAgent {
    /// Create a disconnected agent and the receiving end of its event channel
    #[must_use]
    pub fn new(mut config: AgentConfig) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        config.chunk_size = config.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        let (events, rx) = mpsc::unbounded_channel();

        let agent = Self {
            config,
            events,
            shared: Arc::new(Shared::default()),
            read_loop: Mutex::new(None),
            upload: Mutex::new(()),
        };
        (agent, rx)
    }

    /// Agent configuration
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Whether a connection is live
    pub async fn is_connected(&self) -> bool {
        self.shared.writer.lock().await.is_some()
    }

    /// Connect, send the handshake and start receiving
    ///
    /// # Errors
    ///
    /// - [`ClientError::AlreadyConnected`] if a connection is live
    /// - [`ClientError::Connect`] if the server cannot be reached in time
    /// - [`ClientError::Protocol`] for an empty username
    pub async fn connect(&self, username: &str) -> Result<(), ClientError> {
        let mut read_loop = self.read_loop.lock().await;
        if read_loop.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(ClientError::AlreadyConnected);
        }

        let username = username.trim();
        if username.is_empty() {
            return Err(ProtocolError::EmptyUsername.into());
        }

        let addr = self.config.server_addr.clone();
        let stream =
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => return Err(ClientError::Connect { addr, source }),
                Err(_) => {
                    return Err(ClientError::Connect {
                        addr,
                        source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                    });
                }
            };

        let (read_half, mut write_half) = stream.into_split();
        let handshake = ClientFrame::Handshake {
            username: username.to_string(),
        };
        write_half.write_all(&handshake.encode()).await?;

        self.shared.roster.write().await.clear();
        self.shared.pending_downloads.lock().await.clear();
        *self.shared.writer.lock().await = Some(write_half);

        let stop = Arc::new(Notify::new());
        let inbound = Inbound {
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
            download_dir: self.config.download_dir.clone(),
            download: Transfer::new(TransferLimits::download()),
        };
        let handle = tokio::spawn(inbound.run(FrameReader::new(read_half), Arc::clone(&stop)));
        *read_loop = Some(ReadLoop { handle, stop });

        info!(server = %addr, user = username, "connected");
        Ok(())
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<(), ClientError> {
        let mut writer = self.shared.writer.lock().await;
        let writer = writer.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(frame).await?;
        Ok(())
    }

    /// Send a chat message
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] when idle, or the socket error.
    pub async fn send_message(&self, text: &str) -> Result<(), ClientError> {
        let frame = ClientFrame::Message {
            text: text.to_string(),
        };
        self.send_frame(&frame.encode()).await
    }

    /// Upload a file, reporting progress percentages as chunks go out
    ///
    /// Chat messages may be sent while an upload runs; each frame is written
    /// whole. Uploads on one agent run one at a time: a second call waits
    /// until the first has sent its completion frame.
    ///
    /// Returns the local file name sent in the upload start. The server may
    /// announce the file under a collision-resolved variant of it.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NotConnected`] when idle
    /// - [`ClientError::Io`] if the file cannot be read
    /// - [`ClientError::Transfer`] if the file is empty or too large
    pub async fn send_file<F>(
        &self,
        path: impl AsRef<Path>,
        mut on_progress: F,
    ) -> Result<String, ClientError>
    where
        F: FnMut(u8) + Send,
    {
        let path = path.as_ref();
        let _upload = self.upload.lock().await;
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }

        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        if size == 0 || size > MAX_FILE_SIZE {
            return Err(ValidationError::InvalidFileSize {
                size: i64::try_from(size).unwrap_or(i64::MAX),
                max: MAX_FILE_SIZE,
            }
            .into());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;

        let start = ClientFrame::UploadStart {
            name: name.clone(),
            size: size as i64,
        };
        self.send_frame(&start.encode()).await?;
        info!(file = %name, size, "upload started");

        let mut buf = vec![0u8; self.config.chunk_size];
        let mut sent = 0u64;
        while sent < size {
            let remaining = usize::try_from(size - sent).unwrap_or(usize::MAX);
            let want = remaining.min(buf.len());
            let n = read_full(&mut file, &mut buf[..want]).await?;
            if n == 0 {
                warn!(file = %name, sent, size, "file shrank during upload");
                break;
            }

            self.send_frame(&encode_chunk(Opcode::Chunk, &buf[..n]))
                .await?;
            sent += n as u64;
            on_progress(
                ChunkProgress {
                    transferred: sent,
                    expected: size,
                }
                .percent(),
            );
        }

        self.send_frame(&ClientFrame::UploadComplete.encode())
            .await?;
        info!(file = %name, sent, "upload finished");
        Ok(name)
    }

    /// Ask the server for a stored file
    ///
    /// The file is saved to `save_path`, or under its own name in the
    /// download directory.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] when idle, or the socket error.
    pub async fn request_download(
        &self,
        name: &str,
        save_path: Option<PathBuf>,
    ) -> Result<(), ClientError> {
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }

        let path =
            save_path.unwrap_or_else(|| self.config.download_dir.join(sanitize_file_name(name)));
        self.shared
            .pending_downloads
            .lock()
            .await
            .insert(name.to_string(), path);

        let frame = ClientFrame::DownloadRequest {
            name: name.to_string(),
        };
        if let Err(e) = self.send_frame(&frame.encode()).await {
            self.shared.pending_downloads.lock().await.remove(name);
            return Err(e);
        }
        debug!(file = name, "download requested");
        Ok(())
    }

    /// Close the connection and wait for the read loop to finish
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] if `connect` was never called.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let Some(read_loop) = self.read_loop.lock().await.take() else {
            return Err(ClientError::NotConnected);
        };

        read_loop.stop.notify_one();
        if let Err(e) = read_loop.handle.await {
            warn!("read loop ended abnormally: {e}");
        }
        Ok(())
    }

    /// Users currently connected, in announcement order
    pub async fn roster(&self) -> Vec<RosterEntry> {
        self.shared.roster.read().await.entries.clone()
    }
}

/// Fill `buf` unless the reader hits end of file first
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// State owned by the read loop
struct Inbound {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<AgentEvent>,
    download_dir: PathBuf,
    download: Transfer<FileSink>,
}

impl Inbound {
    async fn run(mut self, mut reader: FrameReader<OwnedReadHalf>, stop: Arc<Notify>) {
        let reason = loop {
            let frame = tokio::select! {
                frame = reader.read_server_frame() => frame,
                () = stop.notified() => break "disconnected".to_string(),
            };

            match frame {
                Ok(frame) => self.handle(frame).await,
                Err(ProtocolError::Disconnected) => {
                    break "connection closed by server".to_string();
                }
                Err(e) => {
                    warn!("read error: {e}");
                    break e.to_string();
                }
            }
        };

        if let Some(name) = self.download.abort(&reason).await {
            self.emit(AgentEvent::DownloadFailed {
                name,
                reason: reason.clone(),
            });
        }

        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("socket shutdown: {e}");
            }
        }
        self.shared.roster.write().await.clear();
        self.shared.pending_downloads.lock().await.clear();

        info!(reason = %reason, "disconnected");
        self.emit(AgentEvent::Disconnected { reason });
    }

    fn emit(&self, event: AgentEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    async fn handle(&mut self, frame: ServerFrame) {
        debug!(frame = frame.frame_type(), "frame received");
        match frame {
            ServerFrame::UserConnected { username, uid } => {
                let added = self.shared.roster.write().await.insert(&uid, &username);
                if added {
                    self.emit(AgentEvent::UserConnected { uid, username });
                }
            }
            ServerFrame::Message { text } => {
                let (sender, text) = self.shared.roster.read().await.split_sender(&text);
                if sender.is_none() {
                    self.release_download(&text).await;
                }
                self.emit(AgentEvent::MessageReceived { sender, text });
            }
            ServerFrame::UserDisconnected { uid } => {
                let username = self.shared.roster.write().await.remove(&uid);
                self.emit(AgentEvent::UserDisconnected { uid, username });
            }
            ServerFrame::FileAnnounced { sender, name } => {
                self.emit(AgentEvent::FileAnnounced { sender, name });
            }
            ServerFrame::DownloadStart { name, size } => self.begin_download(name, size).await,
            ServerFrame::DownloadChunk { data } => {
                let name = self.download.file_name().map(str::to_string);
                let result = self.download.chunk(&data).await;
                match (result, name) {
                    (Ok(progress), Some(name)) => {
                        self.emit(AgentEvent::DownloadProgress {
                            name,
                            percent: progress.percent(),
                        });
                    }
                    (Ok(_), None) => {}
                    (Err(e), name) => self.fail_download(name, e).await,
                }
            }
            ServerFrame::InvalidChunk { declared } => {
                let name = self.download.file_name().map(str::to_string);
                let max = self.download.limits().max_chunk_size;
                self.fail_download(
                    name,
                    ValidationError::InvalidChunkSize {
                        size: i64::from(declared),
                        max,
                    }
                    .into(),
                )
                .await;
            }
            ServerFrame::DownloadComplete => {
                let name = self.download.file_name().map(str::to_string);
                match self.download.complete().await {
                    Ok(done) => {
                        info!(
                            file = %done.file_name,
                            path = %done.output.display(),
                            "download complete"
                        );
                        self.emit(AgentEvent::DownloadComplete {
                            name: done.file_name,
                            path: done.output,
                        });
                    }
                    Err(TransferError::Validation(ValidationError::NoActiveTransfer)) => {
                        debug!("download completion without active download");
                    }
                    Err(e) => {
                        warn!("failed to finish download: {e}");
                        if let Some(name) = name {
                            self.emit(AgentEvent::DownloadFailed {
                                name,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
            ServerFrame::Unknown(opcode) => warn!(opcode, "unknown opcode"),
        }
    }

    async fn begin_download(&mut self, name: String, size: i64) {
        let pending = self.shared.pending_downloads.lock().await.remove(&name);
        let path = pending.unwrap_or_else(|| self.download_dir.join(sanitize_file_name(&name)));

        let size = match self.download.prepare(&name, size) {
            Ok((_, size)) => size,
            Err(e) => {
                warn!(file = %name, "download rejected: {e}");
                self.emit(AgentEvent::DownloadFailed {
                    name,
                    reason: e.to_string(),
                });
                return;
            }
        };

        if let Some(previous) = self.download.file_name().map(str::to_string) {
            self.download.abort("replaced by a new download").await;
            self.emit(AgentEvent::DownloadFailed {
                name: previous,
                reason: "replaced by a new download".to_string(),
            });
        }

        let sink = match create_download_file(&path).await {
            Ok(sink) => sink,
            Err(e) => {
                warn!(file = %name, path = %path.display(), "cannot create download file: {e}");
                self.emit(AgentEvent::DownloadFailed {
                    name,
                    reason: e.to_string(),
                });
                return;
            }
        };

        debug!(file = %name, size, path = %path.display(), "download started");
        if let Err(e) = self.download.start(name.clone(), size, sink).await {
            self.emit(AgentEvent::DownloadFailed {
                name,
                reason: e.to_string(),
            });
        }
    }

    /// Drop the request or active download a server notice refers to
    async fn release_download(&mut self, line: &str) {
        let Some(notice) = DownloadNotice::parse(line) else {
            return;
        };
        let name = notice.file_name();

        let pending = self.shared.pending_downloads.lock().await.remove(name).is_some();
        let active = matches!(notice, DownloadNotice::Failed(_))
            && self.download.file_name() == Some(name);
        if active {
            self.download.abort(line).await;
        }

        if pending || active {
            warn!(file = name, "download refused by server");
            self.emit(AgentEvent::DownloadFailed {
                name: name.to_string(),
                reason: line.to_string(),
            });
        }
    }

    /// `name` is the active download before the failing step ran
    async fn fail_download(&mut self, name: Option<String>, err: TransferError) {
        if matches!(
            err,
            TransferError::Validation(ValidationError::NoActiveTransfer)
        ) {
            debug!("download frame without active download");
            return;
        }

        warn!("download failed: {err}");
        self.download.abort(&err.to_string()).await;
        if let Some(name) = name {
            self.emit(AgentEvent::DownloadFailed {
                name,
                reason: err.to_string(),
            });
        }
    }
}

async fn create_download_file(path: &Path) -> io::Result<FileSink> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    FileSink::create(path).await
}
