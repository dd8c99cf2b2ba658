//! Frame encoding and decoding for the chatwire wire protocol.
//!
//! A frame is a single opcode byte followed by the fields that opcode
//! implies. Strings carry an `i32` byte-length prefix, integers are fixed
//! width, and all multi-byte fields are little-endian.

use crate::error::ProtocolError;
use crate::{MAX_CHUNK_SIZE, MAX_STRING_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Opcodes as assigned by the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Client handshake carrying the username
    Handshake = 0,
    /// Roster entry (username, uid)
    UserConnected = 1,
    /// Chat line
    Message = 5,
    /// Roster removal (uid)
    UserDisconnected = 10,
    /// Upload start (client) or file announcement (server)
    FileStart = 15,
    /// Upload chunk
    Chunk = 16,
    /// Upload finished
    UploadComplete = 17,
    /// Request a stored file
    DownloadRequest = 18,
    /// Download header (name, size)
    DownloadStart = 19,
    /// Download chunk
    DownloadChunk = 20,
    /// Download finished
    DownloadComplete = 21,
}

impl TryFrom<u8> for Opcode {
    /// The unrecognized byte
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::UserConnected),
            5 => Ok(Self::Message),
            10 => Ok(Self::UserDisconnected),
            15 => Ok(Self::FileStart),
            16 => Ok(Self::Chunk),
            17 => Ok(Self::UploadComplete),
            18 => Ok(Self::DownloadRequest),
            19 => Ok(Self::DownloadStart),
            20 => Ok(Self::DownloadChunk),
            21 => Ok(Self::DownloadComplete),
            other => Err(other),
        }
    }
}

impl Opcode {
    /// Get raw byte value
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Builder for a single encoded frame
///
/// The opcode is written on construction; fields are appended in call order.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    buf: Vec<u8>,
}

impl FrameBuilder {
    /// Start a frame with the given opcode
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self::with_raw_opcode(opcode.as_u8())
    }

    /// Start a frame with an arbitrary opcode byte
    #[must_use]
    pub fn with_raw_opcode(opcode: u8) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.push(opcode);
        Self { buf }
    }

    /// Append a length-prefixed UTF-8 string (length counted in bytes)
    #[must_use]
    pub fn write_string(self, s: &str) -> Self {
        debug_assert!(s.len() <= i32::MAX as usize);
        self.write_int32(s.len() as i32).write_raw_bytes(s.as_bytes())
    }

    /// Append a 4-byte little-endian integer
    #[must_use]
    pub fn write_int32(mut self, value: i32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append an 8-byte little-endian integer
    #[must_use]
    pub fn write_int64(mut self, value: i64) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append raw bytes with no prefix
    #[must_use]
    pub fn write_raw_bytes(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Finish the frame
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

/// Encode a chunk frame (`[opcode][i32 size][bytes]`) straight from a slice
#[must_use]
pub fn encode_chunk(opcode: Opcode, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 5);
    buf.push(opcode.as_u8());
    buf.extend_from_slice(&(data.len() as i32).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Frames sent from client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Opcode 0
    Handshake {
        /// Chosen display name
        username: String,
    },
    /// Opcode 5
    Message {
        /// Chat text
        text: String,
    },
    /// Opcode 15
    UploadStart {
        /// File name as chosen by the client (unsanitized)
        name: String,
        /// Declared total size
        size: i64,
    },
    /// Opcode 16 with an in-range size
    UploadChunk {
        /// Chunk bytes
        data: Vec<u8>,
    },
    /// Opcode 16 whose declared size was out of range; its bytes were skipped
    InvalidChunk {
        /// Declared size
        declared: i32,
    },
    /// Opcode 17
    UploadComplete,
    /// Opcode 18
    DownloadRequest {
        /// Stored file name
        name: String,
    },
    /// Any opcode this side does not understand; nothing after it was consumed
    Unknown(u8),
}

impl ClientFrame {
    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientFrame::Handshake { username } => FrameBuilder::new(Opcode::Handshake)
                .write_string(username)
                .build(),
            ClientFrame::Message { text } => {
                FrameBuilder::new(Opcode::Message).write_string(text).build()
            }
            ClientFrame::UploadStart { name, size } => FrameBuilder::new(Opcode::FileStart)
                .write_string(name)
                .write_int64(*size)
                .build(),
            ClientFrame::UploadChunk { data } => encode_chunk(Opcode::Chunk, data),
            ClientFrame::InvalidChunk { declared } => FrameBuilder::new(Opcode::Chunk)
                .write_int32(*declared)
                .build(),
            ClientFrame::UploadComplete => FrameBuilder::new(Opcode::UploadComplete).build(),
            ClientFrame::DownloadRequest { name } => FrameBuilder::new(Opcode::DownloadRequest)
                .write_string(name)
                .build(),
            ClientFrame::Unknown(op) => FrameBuilder::with_raw_opcode(*op).build(),
        }
    }

    /// Get the frame type name
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            ClientFrame::Handshake { .. } => "Handshake",
            ClientFrame::Message { .. } => "Message",
            ClientFrame::UploadStart { .. } => "UploadStart",
            ClientFrame::UploadChunk { .. } => "UploadChunk",
            ClientFrame::InvalidChunk { .. } => "InvalidChunk",
            ClientFrame::UploadComplete => "UploadComplete",
            ClientFrame::DownloadRequest { .. } => "DownloadRequest",
            ClientFrame::Unknown(_) => "Unknown",
        }
    }
}

/// Frames sent from server to client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Opcode 1
    UserConnected {
        /// Display name
        username: String,
        /// Session identifier
        uid: String,
    },
    /// Opcode 5
    Message {
        /// Relayed chat line
        text: String,
    },
    /// Opcode 10
    UserDisconnected {
        /// Session identifier
        uid: String,
    },
    /// Opcode 15
    FileAnnounced {
        /// Uploader's username
        sender: String,
        /// Stored (collision-resolved) name
        name: String,
    },
    /// Opcode 19
    DownloadStart {
        /// Stored name
        name: String,
        /// Total size in bytes
        size: i64,
    },
    /// Opcode 20 (opcode 16 is accepted with the same layout)
    DownloadChunk {
        /// Chunk bytes
        data: Vec<u8>,
    },
    /// Opcode 16/20 whose declared size was out of range; its bytes were skipped
    InvalidChunk {
        /// Declared size
        declared: i32,
    },
    /// Opcode 21
    DownloadComplete,
    /// Any opcode this side does not understand; nothing after it was consumed
    Unknown(u8),
}

impl ServerFrame {
    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServerFrame::UserConnected { username, uid } => {
                FrameBuilder::new(Opcode::UserConnected)
                    .write_string(username)
                    .write_string(uid)
                    .build()
            }
            ServerFrame::Message { text } => {
                FrameBuilder::new(Opcode::Message).write_string(text).build()
            }
            ServerFrame::UserDisconnected { uid } => FrameBuilder::new(Opcode::UserDisconnected)
                .write_string(uid)
                .build(),
            ServerFrame::FileAnnounced { sender, name } => FrameBuilder::new(Opcode::FileStart)
                .write_string(sender)
                .write_string(name)
                .build(),
            ServerFrame::DownloadStart { name, size } => FrameBuilder::new(Opcode::DownloadStart)
                .write_string(name)
                .write_int64(*size)
                .build(),
            ServerFrame::DownloadChunk { data } => encode_chunk(Opcode::DownloadChunk, data),
            ServerFrame::InvalidChunk { declared } => FrameBuilder::new(Opcode::DownloadChunk)
                .write_int32(*declared)
                .build(),
            ServerFrame::DownloadComplete => FrameBuilder::new(Opcode::DownloadComplete).build(),
            ServerFrame::Unknown(op) => FrameBuilder::with_raw_opcode(*op).build(),
        }
    }

    /// Get the frame type name
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            ServerFrame::UserConnected { .. } => "UserConnected",
            ServerFrame::Message { .. } => "Message",
            ServerFrame::UserDisconnected { .. } => "UserDisconnected",
            ServerFrame::FileAnnounced { .. } => "FileAnnounced",
            ServerFrame::DownloadStart { .. } => "DownloadStart",
            ServerFrame::DownloadChunk { .. } => "DownloadChunk",
            ServerFrame::InvalidChunk { .. } => "InvalidChunk",
            ServerFrame::DownloadComplete => "DownloadComplete",
            ServerFrame::Unknown(_) => "Unknown",
        }
    }
}

/// Chunk field as decoded from the wire
enum ChunkField {
    Data(Vec<u8>),
    Invalid(i32),
}

/// Frame decoder over an async byte stream
///
/// Every read either returns exactly the requested number of bytes or
/// fails; a stream that ends early yields [`ProtocolError::Disconnected`].
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_chunk_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a stream
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }

    /// Override the largest chunk that will be buffered
    #[must_use]
    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    /// Read until `buf` is full
    async fn fill(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(ProtocolError::Disconnected);
            }
            filled += n;
        }
        Ok(())
    }

    /// Read the opcode byte of the next frame
    pub async fn read_opcode(&mut self) -> Result<u8, ProtocolError> {
        let mut byte = [0u8; 1];
        self.fill(&mut byte).await?;
        Ok(byte[0])
    }

    /// Read a 4-byte little-endian integer
    pub async fn read_int32(&mut self) -> Result<i32, ProtocolError> {
        let mut bytes = [0u8; 4];
        self.fill(&mut bytes).await?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Read an 8-byte little-endian integer
    pub async fn read_int64(&mut self) -> Result<i64, ProtocolError> {
        let mut bytes = [0u8; 8];
        self.fill(&mut bytes).await?;
        Ok(i64::from_le_bytes(bytes))
    }

    /// Read exactly `len` raw bytes
    pub async fn read_raw_bytes(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf).await?;
        Ok(buf)
    }

    /// Read a length-prefixed UTF-8 string
    pub async fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_int32().await?;
        if len < 0 || len as usize > MAX_STRING_LEN {
            return Err(ProtocolError::InvalidLength(len));
        }
        let bytes = self.read_raw_bytes(len as usize).await?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Consume and drop exactly `len` bytes without buffering them
    pub async fn skip_bytes(&mut self, len: u64) -> Result<(), ProtocolError> {
        let mut limited = (&mut self.inner).take(len);
        let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        if skipped < len {
            return Err(ProtocolError::Disconnected);
        }
        Ok(())
    }

    /// Read `[i32 size][bytes]`, draining out-of-range chunks to stay in sync
    async fn read_chunk(&mut self) -> Result<ChunkField, ProtocolError> {
        let declared = self.read_int32().await?;
        if declared <= 0 {
            return Ok(ChunkField::Invalid(declared));
        }
        if declared as usize > self.max_chunk_size {
            self.skip_bytes(declared as u64).await?;
            return Ok(ChunkField::Invalid(declared));
        }
        Ok(ChunkField::Data(self.read_raw_bytes(declared as usize).await?))
    }

    /// Read the handshake frame that must open every connection
    pub async fn read_handshake(&mut self) -> Result<String, ProtocolError> {
        let opcode = self.read_opcode().await?;
        if opcode != Opcode::Handshake.as_u8() {
            return Err(ProtocolError::UnexpectedOpcode(opcode));
        }
        self.read_string().await
    }

    /// Decode one client-to-server frame
    pub async fn read_client_frame(&mut self) -> Result<ClientFrame, ProtocolError> {
        let opcode = self.read_opcode().await?;
        let frame = match Opcode::try_from(opcode) {
            Ok(Opcode::Handshake) => ClientFrame::Handshake {
                username: self.read_string().await?,
            },
            Ok(Opcode::Message) => ClientFrame::Message {
                text: self.read_string().await?,
            },
            Ok(Opcode::FileStart) => {
                let name = self.read_string().await?;
                let size = self.read_int64().await?;
                ClientFrame::UploadStart { name, size }
            }
            Ok(Opcode::Chunk) => match self.read_chunk().await? {
                ChunkField::Data(data) => ClientFrame::UploadChunk { data },
                ChunkField::Invalid(declared) => ClientFrame::InvalidChunk { declared },
            },
            Ok(Opcode::UploadComplete) => ClientFrame::UploadComplete,
            Ok(Opcode::DownloadRequest) => ClientFrame::DownloadRequest {
                name: self.read_string().await?,
            },
            _ => ClientFrame::Unknown(opcode),
        };
        Ok(frame)
    }

    /// Decode one server-to-client frame
    pub async fn read_server_frame(&mut self) -> Result<ServerFrame, ProtocolError> {
        let opcode = self.read_opcode().await?;
        let frame = match Opcode::try_from(opcode) {
            Ok(Opcode::UserConnected) => {
                let username = self.read_string().await?;
                let uid = self.read_string().await?;
                ServerFrame::UserConnected { username, uid }
            }
            Ok(Opcode::Message) => ServerFrame::Message {
                text: self.read_string().await?,
            },
            Ok(Opcode::UserDisconnected) => ServerFrame::UserDisconnected {
                uid: self.read_string().await?,
            },
            Ok(Opcode::FileStart) => {
                let sender = self.read_string().await?;
                let name = self.read_string().await?;
                ServerFrame::FileAnnounced { sender, name }
            }
            Ok(Opcode::DownloadStart) => {
                let name = self.read_string().await?;
                let size = self.read_int64().await?;
                ServerFrame::DownloadStart { name, size }
            }
            Ok(Opcode::Chunk | Opcode::DownloadChunk) => match self.read_chunk().await? {
                ChunkField::Data(data) => ServerFrame::DownloadChunk { data },
                ChunkField::Invalid(declared) => ServerFrame::InvalidChunk { declared },
            },
            Ok(Opcode::DownloadComplete) => ServerFrame::DownloadComplete,
            _ => ServerFrame::Unknown(opcode),
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(bytes: &[u8]) -> FrameReader<&[u8]> {
        FrameReader::new(bytes)
    }

    #[test]
    fn test_opcode_try_from() {
        assert_eq!(Opcode::try_from(0), Ok(Opcode::Handshake));
        assert_eq!(Opcode::try_from(21), Ok(Opcode::DownloadComplete));
        assert_eq!(Opcode::try_from(2), Err(2));
        assert_eq!(Opcode::try_from(255), Err(255));
    }

    #[test]
    fn test_string_layout() {
        // "hé" is 3 UTF-8 bytes but 2 characters
        let frame = FrameBuilder::new(Opcode::Message).write_string("hé").build();
        assert_eq!(frame, vec![5, 3, 0, 0, 0, b'h', 0xC3, 0xA9]);
    }

    #[test]
    fn test_integers_little_endian() {
        let frame = FrameBuilder::new(Opcode::DownloadStart)
            .write_int32(0x0102_0304)
            .write_int64(0x0102_0304_0506_0708)
            .build();
        assert_eq!(frame, vec![19, 4, 3, 2, 1, 8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_client_frame_roundtrip() {
        let frames = vec![
            ClientFrame::Handshake {
                username: "alice".to_string(),
            },
            ClientFrame::Message {
                text: "hi there".to_string(),
            },
            ClientFrame::UploadStart {
                name: "report.pdf".to_string(),
                size: 204_800,
            },
            ClientFrame::UploadChunk {
                data: vec![7u8; 300],
            },
            ClientFrame::UploadComplete,
            ClientFrame::DownloadRequest {
                name: "report.pdf".to_string(),
            },
        ];

        let wire: Vec<u8> = frames.iter().flat_map(ClientFrame::encode).collect();
        let mut reader = reader(&wire);
        for expected in &frames {
            let decoded = reader.read_client_frame().await.unwrap();
            assert_eq!(&decoded, expected);
        }
        assert!(matches!(
            reader.read_opcode().await,
            Err(ProtocolError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_server_frame_roundtrip() {
        let frames = vec![
            ServerFrame::UserConnected {
                username: "bob".to_string(),
                uid: "abcd".to_string(),
            },
            ServerFrame::UserDisconnected {
                uid: "abcd".to_string(),
            },
            ServerFrame::FileAnnounced {
                sender: "bob".to_string(),
                name: "a.txt".to_string(),
            },
            ServerFrame::DownloadStart {
                name: "a.txt".to_string(),
                size: 3,
            },
            ServerFrame::DownloadChunk {
                data: b"abc".to_vec(),
            },
            ServerFrame::DownloadComplete,
        ];

        let wire: Vec<u8> = frames.iter().flat_map(ServerFrame::encode).collect();
        let mut reader = reader(&wire);
        for expected in &frames {
            assert_eq!(&reader.read_server_frame().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_short_read_is_disconnect() {
        // Declares 10 bytes, carries 4
        let wire = [5u8, 10, 0, 0, 0, b'a', b'b', b'c', b'd'];
        let result = reader(&wire).read_client_frame().await;
        assert!(matches!(result, Err(ProtocolError::Disconnected)));

        let result = reader(&[1u8, 2]).read_int32().await;
        assert!(matches!(result, Err(ProtocolError::Disconnected)));
    }

    #[tokio::test]
    async fn test_negative_string_length_rejected() {
        let wire = FrameBuilder::new(Opcode::Message).write_int32(-1).build();
        let result = reader(&wire).read_client_frame().await;
        assert!(matches!(result, Err(ProtocolError::InvalidLength(-1))));
    }

    #[tokio::test]
    async fn test_invalid_utf8_rejected() {
        let wire = FrameBuilder::new(Opcode::Message)
            .write_int32(2)
            .write_raw_bytes(&[0xFF, 0xFE])
            .build();
        let result = reader(&wire).read_client_frame().await;
        assert!(matches!(result, Err(ProtocolError::InvalidUtf8(_))));
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_drained() {
        let mut wire = encode_chunk(Opcode::Chunk, &[1u8; 32]);
        wire.extend(ClientFrame::UploadComplete.encode());

        let mut reader = reader(&wire).with_max_chunk_size(16);
        assert_eq!(
            reader.read_client_frame().await.unwrap(),
            ClientFrame::InvalidChunk { declared: 32 }
        );
        // Stream is still aligned on the next frame
        assert_eq!(
            reader.read_client_frame().await.unwrap(),
            ClientFrame::UploadComplete
        );
    }

    #[tokio::test]
    async fn test_zero_chunk_consumes_nothing() {
        let mut wire = ClientFrame::InvalidChunk { declared: 0 }.encode();
        wire.extend(ClientFrame::UploadComplete.encode());

        let mut reader = reader(&wire);
        assert_eq!(
            reader.read_client_frame().await.unwrap(),
            ClientFrame::InvalidChunk { declared: 0 }
        );
        assert_eq!(
            reader.read_client_frame().await.unwrap(),
            ClientFrame::UploadComplete
        );
    }

    #[tokio::test]
    async fn test_unknown_opcode_consumes_only_opcode() {
        let mut wire = vec![42u8];
        wire.extend(ClientFrame::Message { text: "x".into() }.encode());

        let mut reader = reader(&wire);
        assert_eq!(
            reader.read_client_frame().await.unwrap(),
            ClientFrame::Unknown(42)
        );
        assert_eq!(
            reader.read_client_frame().await.unwrap(),
            ClientFrame::Message { text: "x".into() }
        );
    }

    #[tokio::test]
    async fn test_opcode_16_accepted_as_download_chunk() {
        let wire = encode_chunk(Opcode::Chunk, b"xyz");
        assert_eq!(
            reader(&wire).read_server_frame().await.unwrap(),
            ServerFrame::DownloadChunk {
                data: b"xyz".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn test_handshake() {
        let wire = ClientFrame::Handshake {
            username: "carol".into(),
        }
        .encode();
        assert_eq!(reader(&wire).read_handshake().await.unwrap(), "carol");

        let wire = ClientFrame::Message { text: "x".into() }.encode();
        assert!(matches!(
            reader(&wire).read_handshake().await,
            Err(ProtocolError::UnexpectedOpcode(5))
        ));
    }

    #[test]
    fn test_frame_type() {
        assert_eq!(ClientFrame::UploadComplete.frame_type(), "UploadComplete");
        assert_eq!(ServerFrame::Unknown(3).frame_type(), "Unknown");
    }
}
