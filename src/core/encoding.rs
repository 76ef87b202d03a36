use std::io::Write;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{
    Compression,
    write::{DeflateEncoder, GzEncoder},
};
use http::Version;
use thiserror::Error;

/// Terminal marker closing a chunked body
pub const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Errors raised while framing or compressing body bytes
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EncodingError {
    /// The compressor failed mid-stream
    #[error("compression failed: {0}")]
    Compress(#[from] std::io::Error),
    /// Inbound chunked framing violates the wire format
    #[error("malformed chunked framing: {0}")]
    Malformed(&'static str),
}

/// Result type for encoding operations
pub type EncodingResult<T> = Result<T, EncodingError>;

/// Response body framings for the HTTP/1.x generation, ordered by
/// increasing wrapping cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Encoding {
    Identity,
    Chunked,
    Gzip,
    Deflate,
}

impl Encoding {
    /// Parse a configured encoding name
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "identity" | "plain" => Some(Encoding::Identity),
            "chunked" => Some(Encoding::Chunked),
            "gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            _ => None,
        }
    }

    /// `Content-Encoding` token for the compressed variants
    pub fn token(self) -> Option<&'static str> {
        match self {
            Encoding::Gzip => Some("gzip"),
            Encoding::Deflate => Some("deflate"),
            Encoding::Identity | Encoding::Chunked => None,
        }
    }

    /// Whether this framing requires persistent-framing support (HTTP/1.1)
    pub fn needs_chunking(self) -> bool {
        self != Encoding::Identity
    }

    /// Negotiate the requested framing against the peer.
    ///
    /// Chunked and compressed variants downgrade to identity for peers
    /// predating HTTP/1.1; a compressed variant the peer did not advertise
    /// in `Accept-Encoding` downgrades to chunked.
    pub fn resolve(requested: Encoding, peer_version: Version, peer_accepts: Option<&str>) -> Self {
        if peer_version < Version::HTTP_11 {
            return Encoding::Identity;
        }
        match requested {
            Encoding::Gzip | Encoding::Deflate => {
                let token = requested.token().unwrap_or_default();
                if peer_accepts.is_some_and(|header| accepts_encoding(header, token)) {
                    requested
                } else {
                    Encoding::Chunked
                }
            }
            other => other,
        }
    }
}

/// Whether an `Accept-Encoding` header admits `token`, honoring q-values;
/// a wildcard entry stands in for any codec not named explicitly
pub fn accepts_encoding(header: &str, token: &str) -> bool {
    let mut wildcard: Option<bool> = None;
    for part in header.split(',') {
        let part = part.trim();
        let (name, q) = match part.split_once(";q=") {
            Some((name, q_part)) => (name.trim(), q_part.trim().parse::<f32>().unwrap_or(1.0)),
            None => (part, 1.0),
        };
        if name.eq_ignore_ascii_case(token) {
            return q > 0.0;
        }
        if name == "*" {
            wildcard = Some(q > 0.0);
        }
    }
    wildcard.unwrap_or(false)
}

/// Frame one chunk of a chunked body
fn chunk_frame(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    out.put_slice(format!("{:X}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
    out.freeze()
}

enum Compressor {
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(DeflateEncoder<Vec<u8>>),
}

impl Compressor {
    fn new(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Gzip => Compressor::Gzip(GzEncoder::new(Vec::new(), Compression::default())),
            _ => Compressor::Deflate(DeflateEncoder::new(Vec::new(), Compression::default())),
        }
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Compressor::Gzip(encoder) => encoder.write_all(data),
            Compressor::Deflate(encoder) => encoder.write_all(data),
        }
    }

    fn take_output(&mut self) -> Vec<u8> {
        match self {
            Compressor::Gzip(encoder) => std::mem::take(encoder.get_mut()),
            Compressor::Deflate(encoder) => std::mem::take(encoder.get_mut()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Compressor::Gzip(encoder) => encoder.flush(),
            Compressor::Deflate(encoder) => encoder.flush(),
        }
    }

    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Compressor::Gzip(encoder) => encoder.finish(),
            Compressor::Deflate(encoder) => encoder.finish(),
        }
    }
}

/// Per-response body encoder.
///
/// Compressed variants create their compressor lazily on the first chunk;
/// when a write leaves the compressor's buffer empty, a synchronous partial
/// flush forces bytes out so the peer never sees a zero-length chunk stall
/// progress. `finish` always runs the codec's finish-flush before the
/// terminal chunk marker, even when no payload was ever written.
pub struct BodyEncoder {
    encoding: Encoding,
    compressor: Option<Compressor>,
}

impl BodyEncoder {
    /// Create an encoder for the negotiated framing
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            compressor: None,
        }
    }

    /// The framing this encoder applies
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Encode one body chunk; may return no bytes while a compressor
    /// accumulates input
    pub fn encode_chunk(&mut self, data: &[u8]) -> EncodingResult<Bytes> {
        if data.is_empty() {
            return Ok(Bytes::new());
        }
        match self.encoding {
            Encoding::Identity => Ok(Bytes::copy_from_slice(data)),
            Encoding::Chunked => Ok(chunk_frame(data)),
            Encoding::Gzip | Encoding::Deflate => {
                let compressor = self
                    .compressor
                    .get_or_insert_with(|| Compressor::new(self.encoding));
                compressor.write(data)?;
                let mut out = compressor.take_output();
                if out.is_empty() {
                    compressor.flush()?;
                    out = compressor.take_output();
                }
                if out.is_empty() {
                    Ok(Bytes::new())
                } else {
                    Ok(chunk_frame(&out))
                }
            }
        }
    }

    /// Flush the codec tail and emit the terminal framing marker
    pub fn finish(&mut self) -> EncodingResult<Bytes> {
        match self.encoding {
            Encoding::Identity => Ok(Bytes::new()),
            Encoding::Chunked => Ok(Bytes::from_static(CHUNKED_TERMINATOR)),
            Encoding::Gzip | Encoding::Deflate => {
                let compressor = self
                    .compressor
                    .take()
                    .unwrap_or_else(|| Compressor::new(self.encoding));
                let tail = compressor.finish()?;
                let mut out = BytesMut::new();
                if !tail.is_empty() {
                    out.put_slice(&chunk_frame(&tail));
                }
                out.put_slice(CHUNKED_TERMINATOR);
                Ok(out.freeze())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: usize },
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for inbound chunked bodies.
///
/// Feeds may split anywhere; decoded payload bytes are appended to `out`
/// and chunk framing (including trailers) is consumed silently.
pub struct ChunkedDecoder {
    state: ChunkState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    /// Whether the terminal chunk and trailers have been fully consumed
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consume as much of `src` as possible, appending payload to `out`.
    ///
    /// Returns whether the body completed during this call.
    pub fn decode(&mut self, src: &mut BytesMut, out: &mut BytesMut) -> EncodingResult<bool> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(line_end) = find_crlf(src) else {
                        return Ok(false);
                    };
                    let line = src.split_to(line_end + 2);
                    let size_text = &line[..line_end];
                    // Chunk extensions after ';' are ignored
                    let size_text = match size_text.iter().position(|&b| b == b';') {
                        Some(pos) => &size_text[..pos],
                        None => size_text,
                    };
                    let size_text = std::str::from_utf8(size_text)
                        .map_err(|_| EncodingError::Malformed("chunk size is not ASCII"))?
                        .trim();
                    let size = usize::from_str_radix(size_text, 16)
                        .map_err(|_| EncodingError::Malformed("chunk size is not hex"))?;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    if src.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(src.len());
                    out.put_slice(&src.split_to(take));
                    if take == remaining {
                        self.state = ChunkState::DataEnd;
                    } else {
                        self.state = ChunkState::Data {
                            remaining: remaining - take,
                        };
                    }
                }
                ChunkState::DataEnd => {
                    if src.len() < 2 {
                        return Ok(false);
                    }
                    let sep = src.split_to(2);
                    if &sep[..] != b"\r\n" {
                        return Err(EncodingError::Malformed("chunk data missing CRLF"));
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(line_end) = find_crlf(src) else {
                        return Ok(false);
                    };
                    let line = src.split_to(line_end + 2);
                    if line.len() == 2 {
                        self.state = ChunkState::Done;
                        return Ok(true);
                    }
                    // Trailer fields are consumed and dropped
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::{DeflateDecoder, GzDecoder};

    use super::*;

    /// Strip chunk framing from encoder output, returning the raw payload
    fn dechunk(stream: &[u8]) -> Vec<u8> {
        let mut decoder = ChunkedDecoder::new();
        let mut src = BytesMut::from(stream);
        let mut out = BytesMut::new();
        let done = decoder.decode(&mut src, &mut out).expect("valid framing");
        assert!(done, "stream should contain the terminator");
        out.to_vec()
    }

    fn encode_all(encoding: Encoding, chunks: &[&[u8]]) -> Vec<u8> {
        let mut encoder = BodyEncoder::new(encoding);
        let mut stream = Vec::new();
        for chunk in chunks {
            stream.extend_from_slice(&encoder.encode_chunk(chunk).unwrap());
        }
        stream.extend_from_slice(&encoder.finish().unwrap());
        stream
    }

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    fn inflate(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        DeflateDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_resolve_downgrades_everything_for_pre_http11_peers() {
        for requested in [Encoding::Chunked, Encoding::Gzip, Encoding::Deflate] {
            assert_eq!(
                Encoding::resolve(requested, Version::HTTP_10, Some("gzip, deflate")),
                Encoding::Identity
            );
        }
    }

    #[test]
    fn test_resolve_downgrades_unadvertised_codec_to_chunked() {
        assert_eq!(
            Encoding::resolve(Encoding::Gzip, Version::HTTP_11, Some("deflate")),
            Encoding::Chunked
        );
        assert_eq!(
            Encoding::resolve(Encoding::Gzip, Version::HTTP_11, None),
            Encoding::Chunked
        );
        assert_eq!(
            Encoding::resolve(Encoding::Gzip, Version::HTTP_11, Some("gzip;q=0")),
            Encoding::Chunked
        );
    }

    #[test]
    fn test_resolve_keeps_advertised_codec() {
        assert_eq!(
            Encoding::resolve(Encoding::Gzip, Version::HTTP_11, Some("gzip, deflate;q=0.5")),
            Encoding::Gzip
        );
        assert_eq!(
            Encoding::resolve(Encoding::Deflate, Version::HTTP_11, Some("*")),
            Encoding::Deflate
        );
        assert_eq!(
            Encoding::resolve(Encoding::Chunked, Version::HTTP_11, None),
            Encoding::Chunked
        );
    }

    #[test]
    fn test_accept_encoding_q_values() {
        assert!(accepts_encoding("gzip;q=0.8", "gzip"));
        assert!(!accepts_encoding("gzip;q=0", "gzip"));
        assert!(accepts_encoding("deflate, *;q=0.1", "gzip"));
        assert!(!accepts_encoding("deflate, *;q=0", "gzip"));
        assert!(!accepts_encoding("identity", "gzip"));
    }

    #[test]
    fn test_chunked_encoding_frames_and_terminates() {
        let stream = encode_all(Encoding::Chunked, &[b"hello", b" world"]);
        assert_eq!(stream, b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
        assert_eq!(dechunk(&stream), b"hello world");
    }

    #[test]
    fn test_gzip_round_trip() {
        for chunks in [
            Vec::new(),
            vec![&b"payload"[..]],
            vec![&b"first-"[..], &b"second-"[..], &b"third"[..]],
        ] {
            let expected: Vec<u8> = chunks.concat();
            let stream = encode_all(Encoding::Gzip, &chunks);
            assert_eq!(gunzip(&dechunk(&stream)), expected);
        }
    }

    #[test]
    fn test_deflate_round_trip() {
        let stream = encode_all(Encoding::Deflate, &[b"alpha", b"beta", b"gamma"]);
        assert_eq!(inflate(&dechunk(&stream)), b"alphabetagamma");
    }

    #[test]
    fn test_compressor_partial_flush_keeps_bytes_moving() {
        // A one-byte write would sit in the deflate buffer without the
        // synchronous flush, starving the peer of frames
        let mut encoder = BodyEncoder::new(Encoding::Deflate);
        let first = encoder.encode_chunk(b"a").unwrap();
        assert!(!first.is_empty());
    }

    #[test]
    fn test_finish_without_payload_emits_valid_empty_stream() {
        let stream = encode_all(Encoding::Gzip, &[]);
        let raw = dechunk(&stream);
        assert!(!raw.is_empty());
        assert_eq!(gunzip(&raw), b"");
    }

    #[test]
    fn test_identity_passthrough() {
        let stream = encode_all(Encoding::Identity, &[b"as", b"-is"]);
        assert_eq!(stream, b"as-is");
    }

    #[test]
    fn test_chunked_decoder_across_split_feeds() {
        let wire = b"4\r\nwiki\r\n5;ext=1\r\npedia\r\n0\r\nTrailer: v\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut out = BytesMut::new();

        let mut buf = BytesMut::new();
        let mut done = false;
        for byte in wire.iter() {
            buf.put_u8(*byte);
            done = decoder.decode(&mut buf, &mut out).unwrap();
        }
        assert!(done);
        assert!(decoder.is_done());
        assert_eq!(out.as_ref(), b"wikipedia");
    }

    #[test]
    fn test_chunked_decoder_rejects_bad_size_line() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"zz\r\noops\r\n"[..]);
        let mut out = BytesMut::new();
        assert!(decoder.decode(&mut buf, &mut out).is_err());
    }

    #[test]
    fn test_encoding_order_reflects_wrapping_cost() {
        assert!(Encoding::Identity < Encoding::Chunked);
        assert!(Encoding::Chunked < Encoding::Gzip);
        assert!(Encoding::Gzip < Encoding::Deflate);
    }

    #[test]
    fn test_parse_encoding_names() {
        assert_eq!(Encoding::parse("gzip"), Some(Encoding::Gzip));
        assert_eq!(Encoding::parse("DEFLATE"), Some(Encoding::Deflate));
        assert_eq!(Encoding::parse("plain"), Some(Encoding::Identity));
        assert_eq!(Encoding::parse("zstd"), None);
    }
}
