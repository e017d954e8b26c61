//! RFC 6455 framing: frame reader, frame writer and fragment reassembly.

use std::fmt;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(bits: u8) -> Option<Self> {
        Some(match bits {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// A WebSocket close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: Self = Self(1000);
    pub const GOING_AWAY: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    pub const INVALID_PAYLOAD: Self = Self(1007);
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    pub const INTERNAL_ERROR: Self = Self(1011);
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol violation: {reason}")]
    Protocol { code: CloseCode, reason: &'static str },

    #[error("message exceeds the {limit} byte limit")]
    MessageTooBig { limit: usize },

    #[error("connection is closed")]
    Closed,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl WebSocketError {
    fn protocol(reason: &'static str) -> Self {
        Self::Protocol {
            code: CloseCode::PROTOCOL_ERROR,
            reason,
        }
    }

    /// The close code to send the peer for this failure, if any.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            Self::MessageTooBig { .. } => Some(CloseCode::MESSAGE_TOO_BIG),
            Self::Io(_) | Self::Closed | Self::Serialize(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

// Any short read ends the stream: EOF in the middle of a frame is not an error.
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, WebSocketError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Reads one client frame, unmasking its payload.
///
/// Returns `Ok(None)` at end of stream. A data frame larger than
/// `max_payload` fails before its payload is read.
///
/// # Errors
///
/// [`WebSocketError::Protocol`] for unmasked frames, reserved bits or
/// opcodes, and malformed control frames; [`WebSocketError::MessageTooBig`]
/// for an oversized frame; I/O errors otherwise.
pub async fn read_frame<R>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Option<Frame>, WebSocketError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    if !read_exact_or_eof(reader, &mut head).await? {
        return Ok(None);
    }

    let fin = head[0] & 0x80 != 0;
    if head[0] & 0x70 != 0 {
        return Err(WebSocketError::protocol("reserved bits set"));
    }
    let opcode = Opcode::from_u8(head[0] & 0x0F)
        .ok_or_else(|| WebSocketError::protocol("reserved opcode"))?;

    if head[1] & 0x80 == 0 {
        return Err(WebSocketError::protocol("client frame is not masked"));
    }

    let length = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            if !read_exact_or_eof(reader, &mut ext).await? {
                return Ok(None);
            }
            u64::from(u16::from_be_bytes(ext))
        }
        127 => {
            let mut ext = [0u8; 8];
            if !read_exact_or_eof(reader, &mut ext).await? {
                return Ok(None);
            }
            let length = u64::from_be_bytes(ext);
            if length >> 63 != 0 {
                return Err(WebSocketError::protocol("invalid payload length"));
            }
            length
        }
        short => u64::from(short),
    };

    if opcode.is_control() {
        if !fin {
            return Err(WebSocketError::protocol("fragmented control frame"));
        }
        if length > MAX_CONTROL_PAYLOAD as u64 {
            return Err(WebSocketError::protocol("control frame too large"));
        }
    } else if length > max_payload as u64 {
        return Err(WebSocketError::MessageTooBig { limit: max_payload });
    }

    let mut mask = [0u8; 4];
    if !read_exact_or_eof(reader, &mut mask).await? {
        return Ok(None);
    }

    // Bounded by `max_payload` or the control limit above.
    let mut payload = vec![0u8; usize::try_from(length).unwrap_or(usize::MAX)];
    if !read_exact_or_eof(reader, &mut payload).await? {
        return Ok(None);
    }
    apply_mask(&mut payload, mask);

    Ok(Some(Frame {
        fin,
        opcode,
        payload: Bytes::from(payload),
    }))
}

pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Encodes a server frame: always final, never masked.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> BytesMut {
    let len = payload.len();
    let mut buf = BytesMut::with_capacity(len + 10);
    buf.put_u8(0x80 | opcode.as_u8());

    if len < 126 {
        buf.put_u8(len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        buf.put_u8(126);
        buf.put_u16(short);
    } else {
        buf.put_u8(127);
        buf.put_u64(len as u64);
    }

    buf.put_slice(payload);
    buf
}

/// Close frame payload: the code, then a UTF-8 reason cut to fit a control
/// frame.
pub fn encode_close_payload(code: CloseCode, reason: &str) -> BytesMut {
    let mut cut = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut buf = BytesMut::with_capacity(2 + cut);
    buf.put_u16(code.0);
    buf.put_slice(&reason.as_bytes()[..cut]);
    buf
}

/// Splits a received close payload. An empty payload carries no code.
///
/// # Errors
///
/// A one-byte payload is a protocol error; a reason that is not UTF-8 is
/// [`CloseCode::INVALID_PAYLOAD`].
pub fn parse_close_payload(
    payload: &[u8],
) -> Result<Option<(CloseCode, String)>, WebSocketError> {
    if payload.is_empty() {
        return Ok(None);
    }
    let Some((code, reason)) = payload.split_first_chunk::<2>() else {
        return Err(WebSocketError::protocol("truncated close code"));
    };
    let reason = std::str::from_utf8(reason).map_err(|_| WebSocketError::Protocol {
        code: CloseCode::INVALID_PAYLOAD,
        reason: "close reason is not UTF-8",
    })?;
    Ok(Some((CloseCode(u16::from_be_bytes(*code)), reason.to_owned())))
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// Joins data frames into messages, bounded by a maximum message size.
#[derive(Debug)]
pub struct MessageAssembler {
    max_size: usize,
    kind: Option<Opcode>,
    buffer: BytesMut,
}

impl MessageAssembler {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            kind: None,
            buffer: BytesMut::new(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Whether a fragmented message is in progress.
    pub fn in_progress(&self) -> bool {
        self.kind.is_some()
    }

    fn reset(&mut self) {
        self.kind = None;
        self.buffer = BytesMut::new();
    }

    /// Feeds one data frame; returns the message once its final frame lands.
    ///
    /// # Errors
    ///
    /// Out-of-order continuation frames, oversized messages and invalid UTF-8
    /// text. The partial message is discarded in every case.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, WebSocketError> {
        match (frame.opcode, self.kind) {
            (Opcode::Continuation, None) => {
                return Err(WebSocketError::protocol("continuation without a message"));
            }
            (Opcode::Text | Opcode::Binary, Some(_)) => {
                self.reset();
                return Err(WebSocketError::protocol("new message inside a fragmented one"));
            }
            (Opcode::Text | Opcode::Binary, None) => self.kind = Some(frame.opcode),
            (Opcode::Continuation, Some(_)) => {}
            (Opcode::Close | Opcode::Ping | Opcode::Pong, _) => {
                return Err(WebSocketError::protocol("control frame in data path"));
            }
        }

        if self.buffer.len() + frame.payload.len() > self.max_size {
            self.reset();
            return Err(WebSocketError::MessageTooBig {
                limit: self.max_size,
            });
        }
        self.buffer.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        let kind = self.kind.take();
        let data = std::mem::take(&mut self.buffer).freeze();
        match kind {
            Some(Opcode::Text) => String::from_utf8(data.to_vec())
                .map(|text| Some(Message::Text(text)))
                .map_err(|_| WebSocketError::Protocol {
                    code: CloseCode::INVALID_PAYLOAD,
                    reason: "text message is not valid UTF-8",
                }),
            _ => Ok(Some(Message::Binary(data))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encodes a masked client frame.
    pub(crate) fn client_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut out = vec![(if fin { 0x80 } else { 0 }) | opcode];
        let len = payload.len();
        if len < 126 {
            out.push(0x80 | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        let mut body = payload.to_vec();
        apply_mask(&mut body, mask);
        out.extend_from_slice(&body);
        out
    }

    async fn read(bytes: &[u8], max: usize) -> Result<Option<Frame>, WebSocketError> {
        let mut reader = bytes;
        read_frame(&mut reader, max).await
    }

    #[tokio::test]
    async fn reads_masked_text_frame() {
        let frame = read(&client_frame(true, 0x1, b"Hello"), 1024).await.unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[tokio::test]
    async fn reads_extended_lengths() {
        let medium = vec![7u8; 300];
        let frame = read(&client_frame(true, 0x2, &medium), 1 << 20).await.unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);

        let large = vec![1u8; 70_000];
        let frame = read(&client_frame(true, 0x2, &large), 1 << 20).await.unwrap().unwrap();
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[tokio::test]
    async fn end_of_stream_is_not_an_error() {
        assert!(read(&[], 16).await.unwrap().is_none());
        let truncated = &client_frame(true, 0x1, b"Hello")[..5];
        assert!(read(truncated, 16).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unmasked_client_frame_is_a_protocol_error() {
        let err = read(&[0x81, 0x01, b'a'], 16).await.unwrap_err();
        assert_eq!(err.close_code(), Some(CloseCode::PROTOCOL_ERROR));
    }

    #[tokio::test]
    async fn reserved_bits_and_opcodes_are_rejected() {
        let mut rsv = client_frame(true, 0x1, b"a");
        rsv[0] |= 0x40;
        assert!(matches!(read(&rsv, 16).await, Err(WebSocketError::Protocol { .. })));
        assert!(matches!(
            read(&client_frame(true, 0x3, b"a"), 16).await,
            Err(WebSocketError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn malformed_control_frames_are_rejected() {
        assert!(read(&client_frame(false, 0x9, b"p"), 16).await.is_err());
        assert!(read(&client_frame(true, 0x9, &[0u8; 126]), 1024).await.is_err());
    }

    #[tokio::test]
    async fn oversized_single_frame_is_too_big() {
        let err = read(&client_frame(true, 0x2, &[0u8; 32]), 16).await.unwrap_err();
        assert_eq!(err.close_code(), Some(CloseCode::MESSAGE_TOO_BIG));
    }

    #[test]
    fn encodes_unmasked_final_frames() {
        let small = encode_frame(Opcode::Text, b"hi");
        assert_eq!(&small[..], &[0x81, 0x02, b'h', b'i']);

        let medium = encode_frame(Opcode::Binary, &[0u8; 200]);
        assert_eq!(&medium[..4], &[0x82, 126, 0, 200]);

        let large = encode_frame(Opcode::Binary, &vec![0u8; 70_000]);
        assert_eq!(large[1], 127);
        assert_eq!(&large[2..10], &70_000u64.to_be_bytes());
    }

    #[test]
    fn reassembles_fragments() {
        let mut assembler = MessageAssembler::new(1024);
        let parts = [
            (false, Opcode::Text, "ab"),
            (false, Opcode::Continuation, "cd"),
            (true, Opcode::Continuation, "ef"),
        ];
        let mut out = None;
        for (fin, opcode, text) in parts {
            out = assembler
                .push(Frame {
                    fin,
                    opcode,
                    payload: Bytes::from(text),
                })
                .unwrap();
        }
        assert_eq!(out, Some(Message::Text("abcdef".into())));
        assert!(!assembler.in_progress());
    }

    #[test]
    fn cumulative_size_limit_aborts_reassembly() {
        let mut assembler = MessageAssembler::new(4);
        let first = Frame {
            fin: false,
            opcode: Opcode::Binary,
            payload: Bytes::from_static(b"abc"),
        };
        assert_eq!(assembler.push(first).unwrap(), None);

        let second = Frame {
            fin: true,
            opcode: Opcode::Continuation,
            payload: Bytes::from_static(b"de"),
        };
        let err = assembler.push(second).unwrap_err();
        assert_eq!(err.close_code(), Some(CloseCode::MESSAGE_TOO_BIG));
        assert!(!assembler.in_progress());
    }

    #[test]
    fn stray_continuation_and_bad_utf8_are_rejected() {
        let mut assembler = MessageAssembler::new(64);
        let stray = Frame {
            fin: true,
            opcode: Opcode::Continuation,
            payload: Bytes::new(),
        };
        assert!(assembler.push(stray).is_err());

        let bad = Frame {
            fin: true,
            opcode: Opcode::Text,
            payload: Bytes::from_static(&[0xff, 0xfe]),
        };
        let err = assembler.push(bad).unwrap_err();
        assert_eq!(err.close_code(), Some(CloseCode::INVALID_PAYLOAD));
    }

    #[test]
    fn close_payload_round_trip_and_truncation() {
        let payload = encode_close_payload(CloseCode::GOING_AWAY, "bye");
        assert_eq!(
            parse_close_payload(&payload).unwrap(),
            Some((CloseCode::GOING_AWAY, "bye".to_owned()))
        );
        assert_eq!(parse_close_payload(&[]).unwrap(), None);

        let long = "é".repeat(100);
        assert!(encode_close_payload(CloseCode::NORMAL, &long).len() <= MAX_CONTROL_PAYLOAD);
    }

    #[test]
    fn malformed_close_payloads() {
        let one_byte = parse_close_payload(&[0x03]).unwrap_err();
        assert_eq!(one_byte.close_code(), Some(CloseCode::PROTOCOL_ERROR));

        let bad_reason = parse_close_payload(&[0x03, 0xE8, 0xFF, 0xFE]).unwrap_err();
        assert_eq!(bad_reason.close_code(), Some(CloseCode::INVALID_PAYLOAD));
    }
}
