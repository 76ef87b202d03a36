use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fixed frame header size: 24-bit length, 8-bit type, 8-bit flags,
/// 1 reserved bit + 31-bit stream identifier.
pub const FRAME_HEADER_LEN: usize = 9;

/// Client connection preface that precedes the first frame in h2c mode.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Payload size limit applied until the peer's SETTINGS say otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;

/// Initial window credit for connections and newly opened streams.
pub const DEFAULT_WINDOW_SIZE: i64 = 65_535;

/// Largest window value a peer may grant before increments overflow.
pub const MAX_WINDOW_SIZE: i64 = (1 << 31) - 1;

/// Frame flag bits. `ACK` shares a bit with `END_STREAM` but applies only
/// to SETTINGS and PING.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Error codes carried by RST_STREAM and GOAWAY.
pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const STREAM_CLOSED: u32 = 0x5;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const CANCEL: u32 = 0x8;
}

/// SETTINGS parameter identifiers.
pub mod settings_id {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// Errors raised while decoding or interpreting frames
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    /// Declared payload length exceeds the negotiated frame size limit
    #[error("frame payload of {got} bytes exceeds the {limit} byte limit")]
    Oversized { got: usize, limit: usize },
    /// Frame violates the wire format
    #[error("malformed {kind:?} frame: {reason}")]
    Malformed { kind: FrameKind, reason: &'static str },
}

/// Result type for frame codec operations
pub type FrameResult<T> = Result<T, FrameError>;

/// Frame type registry. Types this relay does not act on decode as
/// `Unknown` and are carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl FrameKind {
    /// Map a wire type octet to a frame kind
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => FrameKind::Data,
            0x1 => FrameKind::Headers,
            0x2 => FrameKind::Priority,
            0x3 => FrameKind::RstStream,
            0x4 => FrameKind::Settings,
            0x5 => FrameKind::PushPromise,
            0x6 => FrameKind::Ping,
            0x7 => FrameKind::GoAway,
            0x8 => FrameKind::WindowUpdate,
            0x9 => FrameKind::Continuation,
            other => FrameKind::Unknown(other),
        }
    }

    /// Map a frame kind back to its wire type octet
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Data => 0x0,
            FrameKind::Headers => 0x1,
            FrameKind::Priority => 0x2,
            FrameKind::RstStream => 0x3,
            FrameKind::Settings => 0x4,
            FrameKind::PushPromise => 0x5,
            FrameKind::Ping => 0x6,
            FrameKind::GoAway => 0x7,
            FrameKind::WindowUpdate => 0x8,
            FrameKind::Continuation => 0x9,
            FrameKind::Unknown(other) => other,
        }
    }
}

/// One decoded frame: header fields plus the raw payload bytes.
///
/// The codec is purely bytes-in/frames-out; window accounting and stream
/// lifecycle are applied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Build a DATA frame
    pub fn data(stream_id: u32, payload: Bytes, end_stream: bool) -> Self {
        Frame {
            kind: FrameKind::Data,
            flags: if end_stream { flags::END_STREAM } else { 0 },
            stream_id,
            payload,
        }
    }

    /// Build a HEADERS frame carrying an already-encoded header block
    pub fn headers(stream_id: u32, block: Bytes, end_stream: bool) -> Self {
        let mut frame_flags = flags::END_HEADERS;
        if end_stream {
            frame_flags |= flags::END_STREAM;
        }
        Frame {
            kind: FrameKind::Headers,
            flags: frame_flags,
            stream_id,
            payload: block,
        }
    }

    /// Build a SETTINGS frame from parameter pairs
    pub fn settings(pairs: &[(u16, u32)]) -> Self {
        let mut payload = BytesMut::with_capacity(pairs.len() * 6);
        for (id, value) in pairs {
            payload.put_u16(*id);
            payload.put_u32(*value);
        }
        Frame {
            kind: FrameKind::Settings,
            flags: 0,
            stream_id: 0,
            payload: payload.freeze(),
        }
    }

    /// Build a SETTINGS acknowledgement
    pub fn settings_ack() -> Self {
        Frame {
            kind: FrameKind::Settings,
            flags: flags::ACK,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Build a PING acknowledgement echoing the opaque payload
    pub fn ping_ack(payload: Bytes) -> Self {
        Frame {
            kind: FrameKind::Ping,
            flags: flags::ACK,
            stream_id: 0,
            payload,
        }
    }

    /// Build a WINDOW_UPDATE frame; stream id zero targets the connection
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment & 0x7fff_ffff);
        Frame {
            kind: FrameKind::WindowUpdate,
            flags: 0,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Build a RST_STREAM frame
    pub fn rst_stream(stream_id: u32, code: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(code);
        Frame {
            kind: FrameKind::RstStream,
            flags: 0,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Build a GOAWAY frame with an optional debug note
    pub fn goaway(last_stream_id: u32, code: u32, debug: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(8 + debug.len());
        payload.put_u32(last_stream_id & 0x7fff_ffff);
        payload.put_u32(code);
        payload.put_slice(debug);
        Frame {
            kind: FrameKind::GoAway,
            flags: 0,
            stream_id: 0,
            payload: payload.freeze(),
        }
    }

    /// Whether the END_STREAM flag is set (DATA/HEADERS)
    pub fn end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    /// Whether the END_HEADERS flag is set (HEADERS/CONTINUATION)
    pub fn end_headers(&self) -> bool {
        self.flags & flags::END_HEADERS != 0
    }

    /// Whether the ACK flag is set (SETTINGS/PING)
    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }

    /// Interpret a RST_STREAM or GOAWAY payload's error code
    pub fn error_code(&self) -> FrameResult<u32> {
        match self.kind {
            FrameKind::RstStream => {
                if self.payload.len() != 4 {
                    return Err(FrameError::Malformed {
                        kind: self.kind,
                        reason: "RST_STREAM payload must be 4 bytes",
                    });
                }
                Ok(u32::from_be_bytes([
                    self.payload[0],
                    self.payload[1],
                    self.payload[2],
                    self.payload[3],
                ]))
            }
            FrameKind::GoAway => {
                if self.payload.len() < 8 {
                    return Err(FrameError::Malformed {
                        kind: self.kind,
                        reason: "GOAWAY payload must be at least 8 bytes",
                    });
                }
                Ok(u32::from_be_bytes([
                    self.payload[4],
                    self.payload[5],
                    self.payload[6],
                    self.payload[7],
                ]))
            }
            _ => Err(FrameError::Malformed {
                kind: self.kind,
                reason: "frame carries no error code",
            }),
        }
    }

    /// Interpret a WINDOW_UPDATE payload's increment
    pub fn window_increment(&self) -> FrameResult<u32> {
        if self.kind != FrameKind::WindowUpdate || self.payload.len() != 4 {
            return Err(FrameError::Malformed {
                kind: self.kind,
                reason: "WINDOW_UPDATE payload must be 4 bytes",
            });
        }
        let raw = u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        Ok(raw & 0x7fff_ffff)
    }

    /// Serialize this frame into `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(FRAME_HEADER_LEN + self.payload.len());
        let len = self.payload.len();
        dst.put_u8(((len >> 16) & 0xff) as u8);
        dst.put_u8(((len >> 8) & 0xff) as u8);
        dst.put_u8((len & 0xff) as u8);
        dst.put_u8(self.kind.as_u8());
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & 0x7fff_ffff);
        dst.put_slice(&self.payload);
    }

    /// Serialize this frame into a freshly allocated buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Decoded view of a SETTINGS payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pairs: Vec<(u16, u32)>,
}

impl Settings {
    /// Parse a SETTINGS frame payload into parameter pairs
    pub fn parse(payload: &[u8]) -> FrameResult<Self> {
        if payload.len() % 6 != 0 {
            return Err(FrameError::Malformed {
                kind: FrameKind::Settings,
                reason: "SETTINGS length not a multiple of 6",
            });
        }
        let pairs = payload
            .chunks_exact(6)
            .map(|chunk| {
                let id = u16::from_be_bytes([chunk[0], chunk[1]]);
                let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
                (id, value)
            })
            .collect();
        Ok(Settings { pairs })
    }

    fn get(&self, id: u16) -> Option<u32> {
        // Last occurrence wins when a peer repeats a parameter
        self.pairs
            .iter()
            .rev()
            .find(|(pair_id, _)| *pair_id == id)
            .map(|(_, value)| *value)
    }

    /// Peer's advertised initial per-stream window, if present
    pub fn initial_window_size(&self) -> Option<u32> {
        self.get(settings_id::INITIAL_WINDOW_SIZE)
    }

    /// Peer's advertised frame size limit, if present
    pub fn max_frame_size(&self) -> Option<u32> {
        self.get(settings_id::MAX_FRAME_SIZE)
    }

    /// Peer's advertised HPACK table size, if present
    pub fn header_table_size(&self) -> Option<u32> {
        self.get(settings_id::HEADER_TABLE_SIZE)
    }
}

/// Incremental frame decoder over an accumulating byte buffer.
///
/// `decode` consumes at most one complete frame per call and leaves
/// partial frames in place until more bytes arrive.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder with the protocol-default frame size limit
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Adopt the frame size limit announced by the peer's SETTINGS
    pub fn set_max_frame_size(&mut self, limit: usize) {
        self.max_frame_size = limit;
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame. The reserved stream-id bit must be zero; a set bit fails
    /// decoding rather than being masked away.
    pub fn decode(&self, buf: &mut BytesMut) -> FrameResult<Option<Frame>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize;
        let kind = FrameKind::from_u8(buf[3]);

        if len > self.max_frame_size {
            return Err(FrameError::Oversized {
                got: len,
                limit: self.max_frame_size,
            });
        }
        if buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        if buf[5] & 0x80 != 0 {
            return Err(FrameError::Malformed {
                kind,
                reason: "reserved stream-id bit is set",
            });
        }

        let header = buf.split_to(FRAME_HEADER_LEN);
        let flags = header[4];
        let stream_id =
            u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff;
        let payload = buf.split_to(len).freeze();

        Ok(Some(Frame {
            kind,
            flags,
            stream_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> FrameResult<Option<Frame>> {
        let mut buf = BytesMut::from(bytes);
        FrameDecoder::new().decode(&mut buf)
    }

    #[test]
    fn test_data_frame_round_trip() {
        let frame = Frame::data(3, Bytes::from_static(b"hello"), true);
        let wire = frame.encode();

        let mut buf = BytesMut::from(&wire[..]);
        let decoded = FrameDecoder::new()
            .decode(&mut buf)
            .expect("well-formed frame")
            .expect("complete frame");

        assert_eq!(decoded, frame);
        assert!(decoded.end_stream());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frame_returns_none() {
        let frame = Frame::data(1, Bytes::from_static(b"abcdef"), false);
        let wire = frame.encode();

        // Header alone, then header plus a truncated payload
        assert_eq!(decode_one(&wire[..FRAME_HEADER_LEN]).unwrap(), None);
        assert_eq!(decode_one(&wire[..wire.len() - 1]).unwrap(), None);
    }

    #[test]
    fn test_decode_consumes_exactly_one_frame() {
        let first = Frame::settings_ack();
        let second = Frame::data(1, Bytes::from_static(b"x"), false);
        let mut buf = BytesMut::new();
        first.encode_into(&mut buf);
        second.encode_into(&mut buf);

        let decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_reserved_bit_is_malformed() {
        let mut wire = BytesMut::from(&Frame::data(1, Bytes::from_static(b"hi"), false).encode()[..]);
        wire[5] |= 0x80;

        let err = decode_one(&wire).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { .. }));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.set_max_frame_size(4);

        let mut buf = BytesMut::from(&Frame::data(1, Bytes::from_static(b"hello"), false).encode()[..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err, FrameError::Oversized { got: 5, limit: 4 });
    }

    #[test]
    fn test_unknown_frame_kind_round_trips() {
        let frame = Frame {
            kind: FrameKind::Unknown(0xfa),
            flags: 0x2,
            stream_id: 7,
            payload: Bytes::from_static(b"opaque"),
        };
        let decoded = decode_one(&frame.encode()).unwrap().unwrap();
        assert_eq!(decoded.kind, FrameKind::Unknown(0xfa));
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_settings_parse_last_value_wins() {
        let frame = Frame::settings(&[
            (settings_id::INITIAL_WINDOW_SIZE, 1000),
            (settings_id::MAX_FRAME_SIZE, 32_768),
            (settings_id::INITIAL_WINDOW_SIZE, 2000),
        ]);
        let settings = Settings::parse(&frame.payload).unwrap();

        assert_eq!(settings.initial_window_size(), Some(2000));
        assert_eq!(settings.max_frame_size(), Some(32_768));
        assert_eq!(settings.header_table_size(), None);
    }

    #[test]
    fn test_settings_length_must_be_multiple_of_six() {
        let err = Settings::parse(&[0, 4, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { .. }));
    }

    #[test]
    fn test_window_update_masks_reserved_increment_bit() {
        let frame = Frame::window_update(5, 0x8000_0001);
        assert_eq!(frame.window_increment().unwrap(), 1);
    }

    #[test]
    fn test_rst_and_goaway_error_codes() {
        let rst = Frame::rst_stream(9, error_code::CANCEL);
        assert_eq!(rst.error_code().unwrap(), error_code::CANCEL);

        let goaway = Frame::goaway(7, error_code::PROTOCOL_ERROR, b"bad preface");
        assert_eq!(goaway.error_code().unwrap(), error_code::PROTOCOL_ERROR);
        assert_eq!(&goaway.payload[8..], b"bad preface");
    }
}
