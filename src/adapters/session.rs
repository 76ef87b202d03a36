//! Per-connection front drivers.
//!
//! One task serves each accepted front connection. The first bytes decide
//! the protocol generation: the HTTP/2 connection preface selects the
//! multiplexed driver, anything else runs the HTTP/1.x exchange loop.

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use eyre::WrapErr;
use hpack::{Decoder, Encoder};
use http::{Method, StatusCode, Version};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf},
    net::TcpStream,
    sync::{Notify, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::{copy, pool::OriginPool},
    config::models::RelayConfig,
    core::{
        encoding::{BodyEncoder, ChunkedDecoder, Encoding, EncodingError},
        flow::{ConnectionFlow, FlowError},
        frame::{
            CONNECTION_PREFACE, DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW_SIZE, FRAME_HEADER_LEN,
            Frame, FrameDecoder, FrameError, FrameKind, Settings, error_code, flags, settings_id,
        },
        head::{BodyFraming, HeadError, Header, RequestHead, ResponseHead, keep_alive},
        router::{RelayTicket, RouteOutcome, Router},
    },
    metrics,
    ports::connector::{BoxedTransport, Connector, ConnectorError, ConnectorResult},
    utils::pairings::{PairingInfo, PairingMode, PairingTracker},
};

/// Errors produced while driving a front connection
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    /// Error on the front connection socket
    #[error("front connection i/o: {0}")]
    FrontIo(#[source] io::Error),

    /// Error on the backend connection socket
    #[error("backend i/o: {0}")]
    BackendIo(#[source] io::Error),

    /// Error for a peer that violated framing rules beyond recovery
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error(transparent)]
    Head(#[from] HeadError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Connect(#[from] ConnectorError),
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Per-exchange tuning distilled from the validated configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub reuse: bool,
    pub deny_status: StatusCode,
    pub sts_seconds: u64,
    pub compress: Option<Encoding>,
    pub max_pending: usize,
    pub connect_timeout: Duration,
    pub recv_timeout: Duration,
    pub trusted: Vec<IpAddr>,
}

impl SessionSettings {
    /// Extract session tuning from a validated configuration
    pub fn from_config(config: &RelayConfig) -> eyre::Result<Self> {
        let deny_status = StatusCode::from_u16(config.deny_status)
            .wrap_err("deny_status is not a usable HTTP status code")?;
        let connect_timeout = humantime::parse_duration(&config.connect_timeout)
            .wrap_err("connect_timeout is not a duration")?;
        let recv_timeout = humantime::parse_duration(&config.recv_timeout)
            .wrap_err("recv_timeout is not a duration")?;
        let compress = match &config.compress {
            Some(name) => Some(
                Encoding::parse(name)
                    .ok_or_else(|| eyre::eyre!("unknown compress encoding {name:?}"))?,
            ),
            None => None,
        };
        let trusted = config
            .trusted
            .iter()
            .map(|addr| addr.parse::<IpAddr>())
            .collect::<Result<Vec<_>, _>>()
            .wrap_err("trusted peer is not an IP address")?;
        Ok(Self {
            reuse: config.reuse,
            deny_status,
            sts_seconds: config.sts_seconds,
            compress,
            max_pending: config.max_pending,
            connect_timeout,
            recv_timeout,
            trusted,
        })
    }
}

/// Shared handles every front connection works against
pub struct SessionContext {
    pub router: Arc<Router>,
    pub connector: Arc<dyn Connector>,
    pub pool: OriginPool,
    pub pairings: Arc<PairingTracker>,
    pub settings: SessionSettings,
}

/// Serve one accepted front connection until it closes.
///
/// Registers the pairing for the connection's lifetime and dispatches to
/// the protocol driver the preface selects.
pub async fn serve_connection(
    ctx: Arc<SessionContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> RelayResult<()> {
    let local = stream.local_addr().map_err(RelayError::FrontIo)?;
    let pairing = ctx.pairings.register(peer);
    let pairing_id = pairing.id.clone();
    metrics::set_active_pairings(ctx.pairings.active_pairings());
    tracing::debug!(pairing = %pairing_id, %peer, "front connection opened");

    let result = drive(ctx.clone(), stream, peer, local, pairing).await;

    ctx.pairings.unregister(&pairing_id);
    metrics::set_active_pairings(ctx.pairings.active_pairings());
    if let Err(error) = &result {
        tracing::debug!(pairing = %pairing_id, %error, "front connection failed");
    } else {
        tracing::debug!(pairing = %pairing_id, "front connection closed");
    }
    result
}

async fn drive<S>(
    ctx: Arc<SessionContext>,
    mut stream: S,
    peer: SocketAddr,
    local: SocketAddr,
    pairing: Arc<PairingInfo>,
) -> RelayResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut inbuf = BytesMut::with_capacity(8 * 1024);

    // Read until the buffer either is the whole preface or diverges from it.
    loop {
        if inbuf.len() >= CONNECTION_PREFACE.len() || !CONNECTION_PREFACE.starts_with(&inbuf[..]) {
            break;
        }
        let n = match read_more(&mut stream, &mut inbuf, ctx.settings.recv_timeout).await {
            Ok(n) => n,
            Err(error) if error.kind() == io::ErrorKind::TimedOut && inbuf.is_empty() => {
                return Ok(());
            }
            Err(error) => return Err(RelayError::FrontIo(error)),
        };
        if n == 0 {
            if inbuf.is_empty() {
                return Ok(());
            }
            break;
        }
    }

    if inbuf.len() >= CONNECTION_PREFACE.len()
        && &inbuf[..CONNECTION_PREFACE.len()] == CONNECTION_PREFACE
    {
        inbuf.advance(CONNECTION_PREFACE.len());
        pairing.set_mode(PairingMode::Multiplexed);
        serve_h2(ctx, peer, local, pairing, stream, inbuf).await
    } else {
        let session = Http1Session {
            ctx,
            peer,
            local,
            pairing,
        };
        session.run(stream, inbuf).await
    }
}

/// Read into `buf`, bounding the wait by the receive window
async fn read_more<S>(stream: &mut S, buf: &mut BytesMut, limit: Duration) -> io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(limit, stream.read_buf(buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "no bytes within the receive window",
        )),
    }
}

fn eof(reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, reason)
}

/// Reconstruct the full URL a request addresses, for rule matching
fn request_url(target: &str, host: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{host}{target}")
    }
}

/// Reduce an absolute-form request target to origin form
fn origin_form(target: &str) -> String {
    match url::Url::parse(target) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {
            match parsed.query() {
                Some(query) => format!("{}?{}", parsed.path(), query),
                None => parsed.path().to_string(),
            }
        }
        _ => target.to_string(),
    }
}

/// Checkout a pooled backend connection or dial a fresh one
async fn acquire_backend(
    ctx: &SessionContext,
    origin_key: &str,
    authority: &str,
) -> ConnectorResult<BoxedTransport> {
    if ctx.settings.reuse {
        if let Some(transport) = ctx.pool.checkout(origin_key).await {
            metrics::increment_pool_reuse(origin_key);
            return Ok(transport);
        }
    }
    ctx.connector.connect(authority).await
}

/// One synthesized answer, renderable on either protocol generation
struct Answer {
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: Bytes,
}

impl Answer {
    fn new(status: StatusCode, text: &str) -> Self {
        let body = Bytes::from(format!(
            "<html><head><title>{status}</title></head><body><h1>{text}</h1></body></html>"
        ));
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "No proxy endpoint found")
    }

    fn internal_error() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error")
    }

    fn deny(status: StatusCode) -> Self {
        Self::new(status, status.canonical_reason().unwrap_or("Forbidden"))
    }

    fn see_other(location: &str) -> Self {
        let mut answer = Self::new(StatusCode::SEE_OTHER, "See Other");
        answer.headers.push(("Location", location.to_string()));
        answer
    }

    fn unauthorized(challenge: &str) -> Self {
        let mut answer = Self::new(StatusCode::UNAUTHORIZED, "Authorization Required");
        answer
            .headers
            .push(("WWW-Authenticate", challenge.to_string()));
        answer
    }

    /// Render as an HTTP/1.x head plus body
    fn into_head(self, version: Version) -> (ResponseHead, Bytes) {
        let mut head = ResponseHead::synthetic(self.status);
        head.version = version;
        head.set_header("Content-Type", "text/html");
        head.set_header("Content-Length", &self.body.len().to_string());
        for (name, value) in &self.headers {
            head.set_header(name, value);
        }
        (head, self.body)
    }

    /// Render as an HTTP/2 header list plus body
    fn into_pairs(self) -> (Vec<(Vec<u8>, Vec<u8>)>, Bytes) {
        let mut pairs = vec![
            (
                b":status".to_vec(),
                self.status.as_str().as_bytes().to_vec(),
            ),
            (b"content-type".to_vec(), b"text/html".to_vec()),
            (
                b"content-length".to_vec(),
                self.body.len().to_string().into_bytes(),
            ),
        ];
        for (name, value) in &self.headers {
            pairs.push((
                name.to_ascii_lowercase().into_bytes(),
                value.clone().into_bytes(),
            ));
        }
        (pairs, self.body)
    }
}

fn deny_answer(settings: &SessionSettings, error_page: Option<&str>) -> Answer {
    match error_page {
        Some(location) => Answer::see_other(location),
        None => Answer::deny(settings.deny_status),
    }
}

/// What the exchange loop does after one request completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Close,
}

/// How the response body travels to the front
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrontWrite {
    /// No body follows the head
    Empty,
    /// Backend bytes pass through byte for byte
    Verbatim,
    /// Body runs through a `BodyEncoder` with this framing
    Encode(Encoding),
    /// Raw bytes, delimited by closing the front afterwards
    Raw,
}

/// Body handling decision for one relayed response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BodyPlan {
    decode_chunked: bool,
    write: FrontWrite,
}

impl BodyPlan {
    /// Decide how a backend body reaches the front.
    ///
    /// A length-delimited body passes verbatim unless compression was
    /// configured and negotiable. Bodies without a static length are
    /// re-framed: chunked for HTTP/1.1 peers, close-delimited for older
    /// ones. Already content-encoded bodies are never re-compressed.
    fn pick(
        backend: BodyFraming,
        front_version: Version,
        compress: Option<Encoding>,
        accept: Option<&str>,
        already_coded: bool,
    ) -> Self {
        let resolved = match compress {
            Some(requested) if !already_coded => {
                Encoding::resolve(requested, front_version, accept)
            }
            _ => Encoding::Identity,
        };
        let compressor = matches!(resolved, Encoding::Gzip | Encoding::Deflate).then_some(resolved);

        match backend {
            BodyFraming::None => Self {
                decode_chunked: false,
                write: FrontWrite::Empty,
            },
            BodyFraming::Length(_) => match compressor {
                Some(encoding) => Self {
                    decode_chunked: false,
                    write: FrontWrite::Encode(encoding),
                },
                None => Self {
                    decode_chunked: false,
                    write: FrontWrite::Verbatim,
                },
            },
            BodyFraming::Chunked => {
                if front_version == Version::HTTP_10 {
                    Self {
                        decode_chunked: true,
                        write: FrontWrite::Raw,
                    }
                } else {
                    Self {
                        decode_chunked: true,
                        write: FrontWrite::Encode(compressor.unwrap_or(Encoding::Chunked)),
                    }
                }
            }
            BodyFraming::UntilClose => {
                if front_version == Version::HTTP_10 {
                    Self {
                        decode_chunked: false,
                        write: FrontWrite::Raw,
                    }
                } else {
                    Self {
                        decode_chunked: false,
                        write: FrontWrite::Encode(compressor.unwrap_or(Encoding::Chunked)),
                    }
                }
            }
        }
    }

    /// Whether only a close can delimit the front body
    fn forces_close(&self) -> bool {
        self.write == FrontWrite::Raw
    }

    /// Rewrite framing headers to match the plan
    fn apply(&self, resp: &mut ResponseHead) {
        match self.write {
            FrontWrite::Empty | FrontWrite::Verbatim => {}
            FrontWrite::Encode(encoding) => {
                resp.strip_length_hints();
                resp.set_header("Transfer-Encoding", "chunked");
                if let Some(token) = encoding.token() {
                    resp.set_header("Content-Encoding", token);
                }
            }
            FrontWrite::Raw => {
                resp.strip_length_hints();
            }
        }
    }
}

/// Outcome of one relayed response body
struct BodyOutcome {
    bytes: u64,
    delimited: bool,
}

struct Http1Session {
    ctx: Arc<SessionContext>,
    peer: SocketAddr,
    local: SocketAddr,
    pairing: Arc<PairingInfo>,
}

impl Http1Session {
    /// Exchange loop: parse a head, relay or answer, repeat while both
    /// sides agree to persist.
    async fn run<S>(self, mut stream: S, mut inbuf: BytesMut) -> RelayResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let head = loop {
                match RequestHead::parse(&mut inbuf)? {
                    Some(head) => break head,
                    None => {
                        let n = match read_more(
                            &mut stream,
                            &mut inbuf,
                            self.ctx.settings.recv_timeout,
                        )
                        .await
                        {
                            Ok(n) => n,
                            Err(error)
                                if error.kind() == io::ErrorKind::TimedOut
                                    && inbuf.is_empty() =>
                            {
                                tracing::debug!(peer = %self.peer, "closing idle front connection");
                                return Ok(());
                            }
                            Err(error) => return Err(RelayError::FrontIo(error)),
                        };
                        if n == 0 {
                            if inbuf.is_empty() {
                                return Ok(());
                            }
                            return Err(RelayError::FrontIo(eof("front closed mid-head")));
                        }
                    }
                }
            };

            self.pairing.exchange_started();
            let timer = metrics::ExchangeTimer::new(head.method.as_str());
            let step = self.exchange(&mut stream, &mut inbuf, head).await;
            drop(timer);
            self.pairing.exchange_finished();

            match step? {
                Step::Continue => continue,
                Step::Close => return Ok(()),
            }
        }
    }

    async fn exchange<S>(
        &self,
        front: &mut S,
        inbuf: &mut BytesMut,
        head: RequestHead,
    ) -> RelayResult<Step>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if head.is_connect() {
            return self.tunnel_exchange(front, inbuf, head).await;
        }

        let front_keep_alive = keep_alive(head.version, &head.headers);
        let front_version = head.version;
        let request_has_body = !matches!(head.body_framing()?, BodyFraming::None);
        // An unread request body would desynchronize the next head.
        let persist_without_relay = front_keep_alive && !request_has_body;

        let host = head.host().unwrap_or_default().to_string();
        let url = request_url(&head.target, &host);
        let authorization = head.header("authorization").map(str::to_string);

        match self.ctx.router.route(&url, &host, authorization.as_deref()) {
            RouteOutcome::Miss => {
                tracing::debug!(host = %host, url = %url, "no relay endpoint matched");
                self.answer(
                    front,
                    &head.method,
                    Answer::not_found(),
                    persist_without_relay,
                    front_version,
                )
                .await
            }
            RouteOutcome::Redirect(location) => {
                self.answer(
                    front,
                    &head.method,
                    Answer::see_other(&location),
                    persist_without_relay,
                    front_version,
                )
                .await
            }
            RouteOutcome::Challenge(challenge) => {
                self.answer(
                    front,
                    &head.method,
                    Answer::unauthorized(&challenge),
                    persist_without_relay,
                    front_version,
                )
                .await
            }
            RouteOutcome::Relay(ticket) => {
                self.relay_exchange(front, inbuf, head, ticket, front_keep_alive)
                    .await
            }
        }
    }

    /// CONNECT handling: dial the named authority and splice raw bytes
    async fn tunnel_exchange<S>(
        &self,
        front: &mut S,
        inbuf: &mut BytesMut,
        head: RequestHead,
    ) -> RelayResult<Step>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let authority = head.target.clone();
        let mut back = match self.ctx.connector.connect(&authority).await {
            Ok(transport) => transport,
            Err(error) => {
                tracing::warn!(%authority, %error, "tunnel connect failed");
                return self
                    .answer(
                        front,
                        &head.method,
                        Answer::internal_error(),
                        false,
                        head.version,
                    )
                    .await;
            }
        };

        self.pairing.set_mode(PairingMode::Tunnel);
        front
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .map_err(RelayError::FrontIo)?;
        if !inbuf.is_empty() {
            // Bytes pipelined behind the CONNECT head belong to the tunnel.
            back.write_all(&inbuf.split())
                .await
                .map_err(RelayError::BackendIo)?;
        }

        tracing::info!(peer = %self.peer, %authority, "tunnel established");
        metrics::increment_exchange_total(Method::CONNECT.as_str(), StatusCode::OK.as_u16());
        let (up, down) = copy::tunnel(front, &mut back, self.ctx.settings.max_pending)
            .await
            .map_err(RelayError::FrontIo)?;
        metrics::add_relayed_bytes("upstream", up);
        metrics::add_relayed_bytes("downstream", down);
        tracing::debug!(peer = %self.peer, %authority, up, down, "tunnel closed");
        Ok(Step::Close)
    }

    async fn relay_exchange<S>(
        &self,
        front: &mut S,
        inbuf: &mut BytesMut,
        mut head: RequestHead,
        mut ticket: RelayTicket,
        front_keep_alive: bool,
    ) -> RelayResult<Step>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let origin_key = ticket.lease.origin().as_str().to_string();
        let authority = ticket.lease.origin().authority();
        let method = head.method.clone();
        let front_version = head.version;
        let accept_encoding = head.header("accept-encoding").map(str::to_string);
        let request_framing = head.body_framing()?;

        let mut back = match acquire_backend(&self.ctx, &origin_key, &authority).await {
            Ok(transport) => transport,
            Err(error) => {
                tracing::warn!(%authority, %error, "backend connect failed");
                ticket.lease.complete();
                let persist =
                    front_keep_alive && matches!(request_framing, BodyFraming::None);
                return self
                    .answer(front, &method, Answer::internal_error(), persist, front_version)
                    .await;
            }
        };

        // Rewrite the head for the next hop.
        if let Some(path) = ticket.path_override.take() {
            head.target = path;
        } else if head.target.starts_with("http://") || head.target.starts_with("https://") {
            head.target = origin_form(&head.target);
        }
        let trusted = self.ctx.settings.trusted.contains(&self.peer.ip());
        head.stamp_forwarded(self.peer.ip(), self.local.port(), trusted);
        head.remove_headers("proxy-connection");
        head.remove_headers("keep-alive");
        head.remove_headers("upgrade");
        head.remove_headers("expect");
        head.set_header(
            "Connection",
            if self.ctx.settings.reuse {
                "keep-alive"
            } else {
                "close"
            },
        );

        back.write_all(&head.encode())
            .await
            .map_err(RelayError::BackendIo)?;
        let upstream = self
            .forward_request_body(front, inbuf, &mut back, request_framing)
            .await?;
        back.flush().await.map_err(RelayError::BackendIo)?;
        metrics::add_relayed_bytes("upstream", upstream);

        // Wait for the response head; no bytes yet means failures are
        // answerable on the front.
        let mut backbuf = BytesMut::with_capacity(8 * 1024);
        let resp = loop {
            match ResponseHead::parse(&mut backbuf) {
                Ok(Some(resp)) => break resp,
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(%authority, %error, "unparseable backend response head");
                    ticket.lease.complete();
                    return Ok(Step::Close);
                }
            }
            match read_more(&mut back, &mut backbuf, self.ctx.settings.recv_timeout).await {
                Ok(0) => {
                    tracing::warn!(%authority, "backend closed before responding");
                    ticket.lease.complete();
                    let answer =
                        deny_answer(&self.ctx.settings, ticket.error_page.as_deref());
                    return self
                        .answer(front, &method, answer, front_keep_alive, front_version)
                        .await;
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%authority, %error, "backend failed while awaited");
                    ticket.lease.complete();
                    return self
                        .answer(
                            front,
                            &method,
                            Answer::internal_error(),
                            front_keep_alive,
                            front_version,
                        )
                        .await;
                }
            }
        };

        // Response started: from here on a failure tears the front down.
        let backend_framing = resp.body_framing(&method)?;
        let backend_keep = keep_alive(resp.version, &resp.headers);
        let server_token = resp.header("server").map(str::to_string);
        let already_coded = resp.header("content-encoding").is_some();

        let plan = BodyPlan::pick(
            backend_framing,
            front_version,
            self.ctx.settings.compress,
            accept_encoding.as_deref(),
            already_coded,
        );

        let mut resp = resp;
        resp.version = if front_version == Version::HTTP_10 {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        };
        resp.remove_headers("connection");
        resp.remove_headers("keep-alive");
        plan.apply(&mut resp);
        resp.stamp_via(&self.local.to_string(), server_token.as_deref());
        resp.stamp_sts(self.ctx.settings.sts_seconds);

        let front_persists = front_keep_alive && !plan.forces_close();
        if !front_persists {
            resp.set_header("Connection", "close");
        } else if front_version == Version::HTTP_10 {
            resp.set_header("Connection", "keep-alive");
        }

        front
            .write_all(&resp.encode())
            .await
            .map_err(RelayError::FrontIo)?;
        metrics::increment_exchange_total(method.as_str(), resp.status.as_u16());

        let outcome = self
            .relay_body(front, &mut back, &mut backbuf, backend_framing, plan, &method)
            .await?;
        metrics::add_relayed_bytes("downstream", outcome.bytes);

        ticket.lease.complete();
        if self.ctx.settings.reuse && backend_keep && outcome.delimited && backbuf.is_empty() {
            self.ctx.pool.checkin(&origin_key, back);
        }

        Ok(if front_persists {
            Step::Continue
        } else {
            Step::Close
        })
    }

    /// Forward the request body to the backend, preserving its framing
    async fn forward_request_body<S>(
        &self,
        front: &mut S,
        inbuf: &mut BytesMut,
        back: &mut BoxedTransport,
        framing: BodyFraming,
    ) -> RelayResult<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let recv = self.ctx.settings.recv_timeout;
        match framing {
            BodyFraming::None | BodyFraming::UntilClose => Ok(0),
            BodyFraming::Length(total) => {
                let mut left = total;
                while left > 0 {
                    if inbuf.is_empty() {
                        let n = read_more(front, inbuf, recv)
                            .await
                            .map_err(RelayError::FrontIo)?;
                        if n == 0 {
                            return Err(RelayError::FrontIo(eof("front closed mid-body")));
                        }
                    }
                    let take = left.min(inbuf.len() as u64) as usize;
                    let piece = inbuf.split_to(take);
                    back.write_all(&piece).await.map_err(RelayError::BackendIo)?;
                    left -= take as u64;
                }
                Ok(total)
            }
            BodyFraming::Chunked => {
                // Forward the raw chunk framing, scanning it only to find
                // the terminator.
                let mut decoder = ChunkedDecoder::new();
                let mut scratch = BytesMut::new();
                let mut forwarded = 0u64;
                loop {
                    if !inbuf.is_empty() {
                        let raw = Bytes::copy_from_slice(&inbuf[..]);
                        let before = inbuf.len();
                        let done = decoder.decode(inbuf, &mut scratch)?;
                        let consumed = before - inbuf.len();
                        if consumed > 0 {
                            back.write_all(&raw[..consumed])
                                .await
                                .map_err(RelayError::BackendIo)?;
                            forwarded += consumed as u64;
                        }
                        scratch.clear();
                        if done {
                            return Ok(forwarded);
                        }
                    }
                    let n = read_more(front, inbuf, recv)
                        .await
                        .map_err(RelayError::FrontIo)?;
                    if n == 0 {
                        return Err(RelayError::FrontIo(eof("front closed mid-body")));
                    }
                }
            }
        }
    }

    /// Relay the response body per the plan, returning byte count and
    /// whether the backend delimited it cleanly
    async fn relay_body<S>(
        &self,
        front: &mut S,
        back: &mut BoxedTransport,
        backbuf: &mut BytesMut,
        framing: BodyFraming,
        plan: BodyPlan,
        method: &Method,
    ) -> RelayResult<BodyOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if plan.write == FrontWrite::Empty || *method == Method::HEAD {
            front.flush().await.map_err(RelayError::FrontIo)?;
            return Ok(BodyOutcome {
                bytes: 0,
                delimited: true,
            });
        }

        let recv = self.ctx.settings.recv_timeout;
        let mut encoder = match plan.write {
            FrontWrite::Encode(encoding) => Some(BodyEncoder::new(encoding)),
            _ => None,
        };
        let mut relayed = 0u64;
        let delimited;

        match framing {
            BodyFraming::None => {
                delimited = true;
            }
            BodyFraming::Length(total) => {
                let mut left = total;
                while left > 0 {
                    if backbuf.is_empty() {
                        let n = read_more(back, backbuf, recv)
                            .await
                            .map_err(RelayError::BackendIo)?;
                        if n == 0 {
                            return Err(RelayError::BackendIo(eof("backend body truncated")));
                        }
                    }
                    let take = left.min(backbuf.len() as u64) as usize;
                    let piece = backbuf.split_to(take).freeze();
                    left -= take as u64;
                    relayed += piece.len() as u64;
                    write_piece(front, &piece, &mut encoder).await?;
                }
                delimited = true;
            }
            BodyFraming::Chunked => {
                let mut decoder = ChunkedDecoder::new();
                let mut decoded = BytesMut::new();
                loop {
                    let done = decoder.decode(backbuf, &mut decoded)?;
                    if !decoded.is_empty() {
                        let piece = decoded.split().freeze();
                        relayed += piece.len() as u64;
                        write_piece(front, &piece, &mut encoder).await?;
                    }
                    if done {
                        break;
                    }
                    let n = read_more(back, backbuf, recv)
                        .await
                        .map_err(RelayError::BackendIo)?;
                    if n == 0 {
                        return Err(RelayError::BackendIo(eof("backend body truncated")));
                    }
                }
                delimited = true;
            }
            BodyFraming::UntilClose => {
                loop {
                    if backbuf.is_empty() {
                        let n = read_more(back, backbuf, recv)
                            .await
                            .map_err(RelayError::BackendIo)?;
                        if n == 0 {
                            break;
                        }
                    }
                    let piece = backbuf.split().freeze();
                    relayed += piece.len() as u64;
                    write_piece(front, &piece, &mut encoder).await?;
                }
                delimited = false;
            }
        }

        if let Some(encoder) = &mut encoder {
            let tail = encoder.finish()?;
            if !tail.is_empty() {
                front.write_all(&tail).await.map_err(RelayError::FrontIo)?;
            }
        }
        front.flush().await.map_err(RelayError::FrontIo)?;
        Ok(BodyOutcome {
            bytes: relayed,
            delimited,
        })
    }

    /// Write a synthesized answer on the front connection
    async fn answer<S>(
        &self,
        front: &mut S,
        method: &Method,
        answer: Answer,
        persist: bool,
        version: Version,
    ) -> RelayResult<Step>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let status = answer.status;
        let wire_version = if version == Version::HTTP_10 {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        };
        let (mut head, body) = answer.into_head(wire_version);
        if !persist {
            head.set_header("Connection", "close");
        } else if version == Version::HTTP_10 {
            head.set_header("Connection", "keep-alive");
        }
        head.stamp_sts(self.ctx.settings.sts_seconds);

        front
            .write_all(&head.encode())
            .await
            .map_err(RelayError::FrontIo)?;
        if *method != Method::HEAD && !body.is_empty() {
            front.write_all(&body).await.map_err(RelayError::FrontIo)?;
        }
        front.flush().await.map_err(RelayError::FrontIo)?;

        metrics::increment_synthesized(status.as_u16());
        metrics::increment_exchange_total(method.as_str(), status.as_u16());
        Ok(if persist { Step::Continue } else { Step::Close })
    }
}

async fn write_piece<S>(
    front: &mut S,
    piece: &[u8],
    encoder: &mut Option<BodyEncoder>,
) -> RelayResult<()>
where
    S: AsyncWrite + Unpin,
{
    match encoder {
        Some(encoder) => {
            let framed = encoder.encode_chunk(piece)?;
            if !framed.is_empty() {
                front.write_all(&framed).await.map_err(RelayError::FrontIo)?;
            }
        }
        None => front
            .write_all(piece)
            .await
            .map_err(RelayError::FrontIo)?,
    }
    Ok(())
}

/// State a multiplexed connection shares between its reader, its writer
/// and the per-stream relay tasks.
///
/// Frames that depend on flow state are pushed to the writer channel
/// inside the flow critical section, so channel order always matches the
/// order the flow state machine decided. Header blocks are pushed inside
/// the encoder critical section for the same reason.
struct H2Shared {
    flow: Mutex<ConnectionFlow>,
    encoder: Mutex<Encoder<'static>>,
    writer: mpsc::UnboundedSender<Bytes>,
    window_open: Notify,
}

impl H2Shared {
    fn new(writer: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            flow: Mutex::new(ConnectionFlow::new()),
            encoder: Mutex::new(Encoder::new()),
            writer,
            window_open: Notify::new(),
        }
    }

    fn with_flow<T>(&self, op: impl FnOnce(&mut ConnectionFlow) -> T) -> T {
        let mut guard = match self.flow.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        op(&mut guard)
    }

    /// Encode and enqueue one frame for the writer task
    fn push_frame(&self, frame: Frame) {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + frame.payload.len());
        frame.encode_into(&mut buf);
        // A send failure means the writer is gone and the connection is
        // already tearing down.
        let _ = self.writer.send(buf.freeze());
    }

    /// Send stream payload through flow control, queueing the remainder
    fn flow_send(&self, stream_id: u32, payload: Bytes, end_stream: bool) {
        self.with_flow(|flow| {
            for frame in flow.send(stream_id, payload, end_stream) {
                self.push_frame(frame);
            }
        });
    }

    /// Grant receive credit back after bytes were relayed onward
    fn reclaim(&self, stream_id: u32, len: usize) {
        if len == 0 {
            return;
        }
        self.with_flow(|flow| {
            for frame in flow.on_data_consumed(stream_id, len) {
                self.push_frame(frame);
            }
        });
    }

    /// Encode a header list and enqueue it, splitting into CONTINUATION
    /// frames when the block outgrows one frame
    fn send_headers(&self, stream_id: u32, pairs: &[(Vec<u8>, Vec<u8>)], end_stream: bool) {
        let mut encoder = match self.encoder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let block = encoder.encode(pairs.iter().map(|(name, value)| (&name[..], &value[..])));

        if block.len() <= DEFAULT_MAX_FRAME_SIZE {
            self.push_frame(Frame::headers(stream_id, Bytes::from(block), end_stream));
            return;
        }

        let block = Bytes::from(block);
        let mut offset = 0;
        let mut first = true;
        while offset < block.len() {
            let end = (offset + DEFAULT_MAX_FRAME_SIZE).min(block.len());
            let last = end == block.len();
            let mut frame_flags = 0u8;
            if last {
                frame_flags |= flags::END_HEADERS;
            }
            if first && end_stream {
                frame_flags |= flags::END_STREAM;
            }
            self.push_frame(Frame {
                kind: if first {
                    FrameKind::Headers
                } else {
                    FrameKind::Continuation
                },
                flags: frame_flags,
                stream_id,
                payload: block.slice(offset..end),
            });
            offset = end;
            first = false;
        }
    }
}

/// Request body piece routed from the connection reader to a stream task
enum StreamEvent {
    Data(Bytes, bool),
}

struct StreamHandle {
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
}

/// A header block under accumulation across CONTINUATION frames
struct HeaderBlock {
    stream_id: u32,
    fragment: BytesMut,
    end_stream: bool,
}

/// Request head carried by an HTTP/2 header block
#[derive(Debug)]
struct H2Request {
    method: Method,
    authority: String,
    path: String,
    headers: Vec<Header>,
}

impl H2Request {
    fn from_pairs(pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<Self, &'static str> {
        let mut method = None;
        let mut path = None;
        let mut authority = None;
        let mut headers = Vec::new();
        for (name, value) in pairs {
            let name = std::str::from_utf8(name).map_err(|_| "header name is not utf-8")?;
            let value = std::str::from_utf8(value).map_err(|_| "header value is not utf-8")?;
            match name {
                ":method" => {
                    method = Some(
                        value
                            .parse::<Method>()
                            .map_err(|_| "unusable :method value")?,
                    )
                }
                ":path" => path = Some(value.to_string()),
                ":authority" => authority = Some(value.to_string()),
                ":scheme" => {}
                _ if name.starts_with(':') => return Err("unknown pseudo header"),
                _ => headers.push(Header::new(name, value)),
            }
        }
        let method = method.ok_or("missing :method")?;
        let authority = authority.unwrap_or_default();
        let path = match path {
            Some(path) => path,
            None if method == Method::CONNECT => String::new(),
            None => return Err("missing :path"),
        };
        Ok(Self {
            method,
            authority,
            path,
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// Headers that describe one hop and must not cross it
fn hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "upgrade"
            | "te"
            | "trailer"
    )
}

/// Translate a multiplexed request into an HTTP/1.1 head for the backend
fn backend_head_from_h2(
    request: &H2Request,
    target: String,
    peer: IpAddr,
    local_port: u16,
    trusted: bool,
    reuse: bool,
    has_body: bool,
) -> RequestHead {
    let mut headers = Vec::with_capacity(request.headers.len() + 4);
    headers.push(Header::new("Host", request.authority.clone()));
    let mut cookies: Vec<&str> = Vec::new();
    for header in &request.headers {
        if hop_by_hop(&header.name) || header.name.eq_ignore_ascii_case("host") {
            continue;
        }
        if header.name.eq_ignore_ascii_case("cookie") {
            cookies.push(&header.value);
            continue;
        }
        headers.push(header.clone());
    }
    if !cookies.is_empty() {
        // Crumbs split for HPACK efficiency recombine into one header.
        headers.push(Header::new("Cookie", cookies.join("; ")));
    }

    let mut head = RequestHead {
        method: request.method.clone(),
        target,
        version: Version::HTTP_11,
        headers,
    };
    head.remove_headers("expect");
    head.stamp_forwarded(peer, local_port, trusted);
    head.set_header("Connection", if reuse { "keep-alive" } else { "close" });
    if has_body {
        if head.header("content-length").is_none() {
            head.set_header("Transfer-Encoding", "chunked");
        }
    } else {
        head.remove_headers("content-length");
    }
    head
}

/// Translate a backend response head into an HTTP/2 header list
fn h2_response_pairs(resp: &ResponseHead) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut pairs = Vec::with_capacity(resp.headers.len() + 1);
    pairs.push((
        b":status".to_vec(),
        resp.status.as_str().as_bytes().to_vec(),
    ));
    for header in &resp.headers {
        if hop_by_hop(&header.name) {
            continue;
        }
        pairs.push((
            header.name.to_ascii_lowercase().into_bytes(),
            header.value.clone().into_bytes(),
        ));
    }
    pairs
}

/// Strip padding and priority fields from a HEADERS payload
fn headers_fragment(frame: &Frame) -> RelayResult<Bytes> {
    let mut payload = frame.payload.clone();
    let mut pad = 0usize;
    if frame.flags & flags::PADDED != 0 {
        if payload.is_empty() {
            return Err(RelayError::Protocol("padded HEADERS without a pad length"));
        }
        pad = payload[0] as usize;
        payload.advance(1);
    }
    if frame.flags & flags::PRIORITY != 0 {
        if payload.len() < 5 {
            return Err(RelayError::Protocol("HEADERS priority fields truncated"));
        }
        payload.advance(5);
    }
    if pad > payload.len() {
        return Err(RelayError::Protocol("pad length exceeds payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

/// Strip padding from a DATA payload, returning it and the pad size
fn data_fragment(frame: &Frame) -> RelayResult<(Bytes, usize)> {
    let mut payload = frame.payload.clone();
    if frame.flags & flags::PADDED == 0 {
        return Ok((payload, 0));
    }
    if payload.is_empty() {
        return Err(RelayError::Protocol("padded DATA without a pad length"));
    }
    let pad = payload[0] as usize;
    payload.advance(1);
    if pad > payload.len() {
        return Err(RelayError::Protocol("pad length exceeds payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok((payload, pad + 1))
}

/// Serve an h2c front connection to completion
async fn serve_h2<S>(
    ctx: Arc<SessionContext>,
    peer: SocketAddr,
    local: SocketAddr,
    pairing: Arc<PairingInfo>,
    stream: S,
    mut inbuf: BytesMut,
) -> RelayResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Bytes>();
    let writer = tokio::spawn(async move {
        while let Some(chunk) = writer_rx.recv().await {
            if write_half.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut session = H2Session::new(ctx, peer, local, pairing, writer_tx);
    let result = session.drive(&mut read_half, &mut inbuf).await;
    session.shutdown().await;
    drop(session);
    let _ = writer.await;
    result
}

struct H2Session {
    ctx: Arc<SessionContext>,
    peer: SocketAddr,
    local: SocketAddr,
    pairing: Arc<PairingInfo>,
    shared: Arc<H2Shared>,
    decoder: FrameDecoder,
    hpack: Decoder<'static>,
    streams: HashMap<u32, StreamHandle>,
    tasks: JoinSet<u32>,
    pending: Option<HeaderBlock>,
    highest_stream: u32,
    draining: bool,
    cancel: CancellationToken,
}

impl H2Session {
    fn new(
        ctx: Arc<SessionContext>,
        peer: SocketAddr,
        local: SocketAddr,
        pairing: Arc<PairingInfo>,
        writer: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        Self {
            ctx,
            peer,
            local,
            pairing,
            shared: Arc::new(H2Shared::new(writer)),
            decoder: FrameDecoder::new(),
            hpack: Decoder::new(),
            streams: HashMap::new(),
            tasks: JoinSet::new(),
            pending: None,
            highest_stream: 0,
            draining: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Reader loop: decode frames, dispatch, reap finished streams
    async fn drive<S>(
        &mut self,
        read_half: &mut ReadHalf<S>,
        inbuf: &mut BytesMut,
    ) -> RelayResult<()>
    where
        S: AsyncRead + Unpin,
    {
        self.shared.push_frame(Frame::settings(&[
            (settings_id::INITIAL_WINDOW_SIZE, DEFAULT_WINDOW_SIZE as u32),
            (settings_id::MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE as u32),
        ]));

        loop {
            loop {
                match self.decoder.decode(inbuf) {
                    Ok(Some(frame)) => {
                        if let Err(error) = self.handle_frame(frame) {
                            self.fail(&error);
                            return Err(error);
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        let error = RelayError::Frame(error);
                        self.fail(&error);
                        return Err(error);
                    }
                }
            }

            if self.draining && self.tasks.is_empty() {
                self.shared
                    .push_frame(Frame::goaway(self.highest_stream, error_code::NO_ERROR, b""));
                return Ok(());
            }

            let idle = self.tasks.is_empty();
            let recv = self.ctx.settings.recv_timeout;
            tokio::select! {
                Some(done) = self.tasks.join_next() => {
                    match done {
                        Ok(stream_id) => {
                            self.streams.remove(&stream_id);
                        }
                        Err(error) => {
                            tracing::warn!(%error, "stream task aborted");
                        }
                    }
                }
                result = async {
                    if idle {
                        read_more(read_half, inbuf, recv).await
                    } else {
                        read_half.read_buf(inbuf).await
                    }
                } => {
                    match result {
                        Ok(0) => return Ok(()),
                        Ok(_) => {}
                        Err(error) if error.kind() == io::ErrorKind::TimedOut => {
                            tracing::debug!(peer = %self.peer, "closing idle multiplexed front");
                            self.shared.push_frame(Frame::goaway(
                                self.highest_stream,
                                error_code::NO_ERROR,
                                b"idle timeout",
                            ));
                            return Ok(());
                        }
                        Err(error) => return Err(RelayError::FrontIo(error)),
                    }
                }
            }
        }
    }

    /// Announce a fatal connection error before teardown
    fn fail(&self, error: &RelayError) {
        let code = match error {
            RelayError::Frame(FrameError::Oversized { .. }) => error_code::FRAME_SIZE_ERROR,
            RelayError::Flow(_) => error_code::FLOW_CONTROL_ERROR,
            _ => error_code::PROTOCOL_ERROR,
        };
        tracing::warn!(peer = %self.peer, %error, "closing multiplexed front");
        self.shared.push_frame(Frame::goaway(
            self.highest_stream,
            code,
            error.to_string().as_bytes(),
        ));
    }

    /// Cancel live streams and retire connection state
    async fn shutdown(&mut self) {
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
        self.streams.clear();
        self.shared.with_flow(|flow| flow.teardown());
    }

    fn handle_frame(&mut self, frame: Frame) -> RelayResult<()> {
        // A header block owns the connection until END_HEADERS.
        if self.pending.is_some() && frame.kind != FrameKind::Continuation {
            return Err(RelayError::Protocol("header block interrupted"));
        }

        match frame.kind {
            FrameKind::Settings => self.on_settings(frame),
            FrameKind::Ping => {
                if !frame.is_ack() {
                    self.shared.push_frame(Frame::ping_ack(frame.payload));
                }
                Ok(())
            }
            FrameKind::WindowUpdate => self.on_window_update(frame),
            FrameKind::Data => self.on_data(frame),
            FrameKind::Headers => {
                let fragment = headers_fragment(&frame)?;
                let block = HeaderBlock {
                    stream_id: frame.stream_id,
                    fragment: BytesMut::from(&fragment[..]),
                    end_stream: frame.end_stream(),
                };
                if frame.end_headers() {
                    self.finish_header_block(block)
                } else {
                    self.pending = Some(block);
                    Ok(())
                }
            }
            FrameKind::Continuation => {
                let Some(mut block) = self.pending.take() else {
                    return Err(RelayError::Protocol("CONTINUATION without a header block"));
                };
                if frame.stream_id != block.stream_id {
                    return Err(RelayError::Protocol("CONTINUATION on a different stream"));
                }
                block.fragment.extend_from_slice(&frame.payload);
                if frame.end_headers() {
                    self.finish_header_block(block)
                } else {
                    self.pending = Some(block);
                    Ok(())
                }
            }
            FrameKind::RstStream => {
                let code = frame.error_code()?;
                tracing::debug!(stream = frame.stream_id, code, "stream reset by peer");
                if let Some(handle) = self.streams.remove(&frame.stream_id) {
                    handle.cancel.cancel();
                }
                self.shared.with_flow(|flow| {
                    flow.close_stream(frame.stream_id);
                });
                self.shared.window_open.notify_waiters();
                Ok(())
            }
            FrameKind::GoAway => {
                let code = frame.error_code()?;
                tracing::debug!(peer = %self.peer, code, "peer is going away");
                self.draining = true;
                Ok(())
            }
            FrameKind::PushPromise => Err(RelayError::Protocol("PUSH_PROMISE from a client")),
            FrameKind::Priority | FrameKind::Unknown(_) => Ok(()),
        }
    }

    fn on_settings(&mut self, frame: Frame) -> RelayResult<()> {
        if frame.is_ack() {
            return Ok(());
        }
        if frame.stream_id != 0 {
            return Err(RelayError::Protocol("SETTINGS on a stream"));
        }
        let settings = Settings::parse(&frame.payload)?;
        self.shared.with_flow(|flow| {
            if let Some(size) = settings.max_frame_size() {
                flow.set_max_frame_size(size as usize);
            }
            if let Some(window) = settings.initial_window_size() {
                for out in flow.set_initial_window(window) {
                    self.shared.push_frame(out);
                }
            }
            if !flow.preface_done() {
                flow.mark_preface_done();
            }
        });
        self.shared.push_frame(Frame::settings_ack());
        self.shared.window_open.notify_waiters();
        Ok(())
    }

    fn on_window_update(&mut self, frame: Frame) -> RelayResult<()> {
        let increment = frame.window_increment()?;
        let result = self.shared.with_flow(|flow| {
            flow.on_window_update(frame.stream_id, increment).map(|frames| {
                for out in frames {
                    self.shared.push_frame(out);
                }
            })
        });
        match result {
            Ok(()) => {
                self.shared.window_open.notify_waiters();
                Ok(())
            }
            Err(error) if frame.stream_id != 0 => {
                tracing::debug!(stream = frame.stream_id, %error, "stream window violation");
                self.shared.push_frame(Frame::rst_stream(
                    frame.stream_id,
                    error_code::FLOW_CONTROL_ERROR,
                ));
                if let Some(handle) = self.streams.remove(&frame.stream_id) {
                    handle.cancel.cancel();
                }
                self.shared.with_flow(|flow| {
                    flow.close_stream(frame.stream_id);
                });
                Ok(())
            }
            Err(error) => Err(RelayError::Flow(error)),
        }
    }

    fn on_data(&mut self, frame: Frame) -> RelayResult<()> {
        let (payload, padding) = data_fragment(&frame)?;
        let total = frame.payload.len();
        let end = frame.end_stream();

        self.shared
            .with_flow(|flow| flow.on_data_received(frame.stream_id, total))?;
        if end {
            self.shared
                .with_flow(|flow| flow.on_end_stream(frame.stream_id));
        }

        let delivered = match self.streams.get(&frame.stream_id) {
            Some(handle) => handle
                .events
                .send(StreamEvent::Data(payload, end))
                .is_ok(),
            None => false,
        };

        // Credit for padding returns immediately; the stream task returns
        // the payload's share once it lands on the backend. Undeliverable
        // payloads return everything now so the window cannot leak.
        let reclaim_now = if delivered { padding } else { total };
        self.shared.reclaim(frame.stream_id, reclaim_now);
        Ok(())
    }

    fn finish_header_block(&mut self, block: HeaderBlock) -> RelayResult<()> {
        let id = block.stream_id;
        if id == 0 || id % 2 == 0 || id <= self.highest_stream {
            return Err(RelayError::Protocol("client stream ids must be odd and increasing"));
        }
        self.highest_stream = id;

        let pairs = match self.hpack.decode(&block.fragment) {
            Ok(pairs) => pairs,
            Err(error) => {
                tracing::warn!(stream = id, ?error, "header block failed to decode");
                return Err(RelayError::Protocol("undecodable header block"));
            }
        };

        if self.draining {
            self.shared
                .push_frame(Frame::rst_stream(id, error_code::REFUSED_STREAM));
            return Ok(());
        }

        let request = match H2Request::from_pairs(&pairs) {
            Ok(request) => request,
            Err(reason) => {
                tracing::debug!(stream = id, reason, "refusing malformed stream");
                self.shared
                    .push_frame(Frame::rst_stream(id, error_code::PROTOCOL_ERROR));
                return Ok(());
            }
        };

        if request.method == Method::CONNECT {
            // Tunnels belong to the HTTP/1.x front.
            tracing::debug!(stream = id, "refusing CONNECT on a multiplexed front");
            self.shared
                .push_frame(Frame::rst_stream(id, error_code::REFUSED_STREAM));
            return Ok(());
        }

        self.shared.with_flow(|flow| {
            flow.open_stream(id);
            if block.end_stream {
                flow.on_end_stream(id);
            }
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        self.streams.insert(
            id,
            StreamHandle {
                events: events_tx,
                cancel: cancel.clone(),
            },
        );

        let ctx = self.ctx.clone();
        let shared = self.shared.clone();
        let pairing = self.pairing.clone();
        let peer = self.peer;
        let local = self.local;
        let body_done = block.end_stream;
        self.tasks.spawn(async move {
            run_stream(
                ctx, shared, pairing, peer, local, id, request, body_done, events_rx, cancel,
            )
            .await;
            id
        });
        Ok(())
    }
}

/// Drive one multiplexed stream to completion
#[allow(clippy::too_many_arguments)]
async fn run_stream(
    ctx: Arc<SessionContext>,
    shared: Arc<H2Shared>,
    pairing: Arc<PairingInfo>,
    peer: SocketAddr,
    local: SocketAddr,
    id: u32,
    request: H2Request,
    body_done: bool,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
) {
    pairing.exchange_started();
    let timer = metrics::ExchangeTimer::new(request.method.as_str());

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(stream = id, "stream cancelled");
            Ok(())
        }
        result = relay_stream(&ctx, &shared, peer, local, id, request, body_done, events) => result,
    };

    drop(timer);
    pairing.exchange_finished();

    if let Err(error) = outcome {
        tracing::warn!(stream = id, %error, "stream relay failed");
        shared.push_frame(Frame::rst_stream(id, error_code::INTERNAL_ERROR));
    }
    shared.with_flow(|flow| {
        flow.close_stream(id);
    });
}

#[allow(clippy::too_many_arguments)]
async fn relay_stream(
    ctx: &SessionContext,
    shared: &H2Shared,
    peer: SocketAddr,
    local: SocketAddr,
    id: u32,
    request: H2Request,
    body_done: bool,
    events: mpsc::UnboundedReceiver<StreamEvent>,
) -> RelayResult<()> {
    let url = request_url(&request.path, &request.authority);
    match ctx
        .router
        .route(&url, &request.authority, request.header("authorization"))
    {
        RouteOutcome::Miss => {
            tracing::debug!(stream = id, host = %request.authority, url = %url, "no relay endpoint matched");
            respond_synthetic(shared, id, &request.method, Answer::not_found());
            Ok(())
        }
        RouteOutcome::Redirect(location) => {
            respond_synthetic(shared, id, &request.method, Answer::see_other(&location));
            Ok(())
        }
        RouteOutcome::Challenge(challenge) => {
            respond_synthetic(shared, id, &request.method, Answer::unauthorized(&challenge));
            Ok(())
        }
        RouteOutcome::Relay(ticket) => {
            relay_stream_backend(
                ctx, shared, peer, local, id, request, body_done, events, ticket,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn relay_stream_backend(
    ctx: &SessionContext,
    shared: &H2Shared,
    peer: SocketAddr,
    local: SocketAddr,
    id: u32,
    request: H2Request,
    body_done: bool,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    mut ticket: RelayTicket,
) -> RelayResult<()> {
    let origin_key = ticket.lease.origin().as_str().to_string();
    let authority = ticket.lease.origin().authority();
    let method = request.method.clone();
    let recv = ctx.settings.recv_timeout;

    let mut back = match acquire_backend(ctx, &origin_key, &authority).await {
        Ok(transport) => transport,
        Err(error) => {
            tracing::warn!(stream = id, %authority, %error, "backend connect failed");
            ticket.lease.complete();
            respond_synthetic(shared, id, &method, Answer::internal_error());
            return Ok(());
        }
    };

    let target = ticket
        .path_override
        .take()
        .unwrap_or_else(|| request.path.clone());
    let trusted = ctx.settings.trusted.contains(&peer.ip());
    let has_body = !body_done;
    let head = backend_head_from_h2(
        &request,
        target,
        peer.ip(),
        local.port(),
        trusted,
        ctx.settings.reuse,
        has_body,
    );

    back.write_all(&head.encode())
        .await
        .map_err(RelayError::BackendIo)?;

    let mut upstream = 0u64;
    if has_body {
        let chunked = head.header("transfer-encoding").is_some();
        let mut encoder = chunked.then(|| BodyEncoder::new(Encoding::Chunked));
        loop {
            let Some(StreamEvent::Data(payload, end)) = events.recv().await else {
                // The reader went away; the connection is tearing down.
                return Ok(());
            };
            if !payload.is_empty() {
                upstream += payload.len() as u64;
                match &mut encoder {
                    Some(encoder) => {
                        let framed = encoder.encode_chunk(&payload)?;
                        if !framed.is_empty() {
                            back.write_all(&framed).await.map_err(RelayError::BackendIo)?;
                        }
                    }
                    None => back
                        .write_all(&payload)
                        .await
                        .map_err(RelayError::BackendIo)?,
                }
                shared.reclaim(id, payload.len());
            }
            if end {
                if let Some(encoder) = &mut encoder {
                    let tail = encoder.finish()?;
                    if !tail.is_empty() {
                        back.write_all(&tail).await.map_err(RelayError::BackendIo)?;
                    }
                }
                break;
            }
        }
    }
    back.flush().await.map_err(RelayError::BackendIo)?;
    metrics::add_relayed_bytes("upstream", upstream);

    let mut backbuf = BytesMut::with_capacity(8 * 1024);
    let resp = loop {
        match ResponseHead::parse(&mut backbuf) {
            Ok(Some(resp)) => break resp,
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(stream = id, %authority, %error, "unparseable backend response head");
                ticket.lease.complete();
                shared.push_frame(Frame::rst_stream(id, error_code::PROTOCOL_ERROR));
                return Ok(());
            }
        }
        match read_more(&mut back, &mut backbuf, recv).await {
            Ok(0) => {
                tracing::warn!(stream = id, %authority, "backend closed before responding");
                ticket.lease.complete();
                let answer = deny_answer(&ctx.settings, ticket.error_page.as_deref());
                respond_synthetic(shared, id, &method, answer);
                return Ok(());
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(stream = id, %authority, %error, "backend failed while awaited");
                ticket.lease.complete();
                respond_synthetic(shared, id, &method, Answer::internal_error());
                return Ok(());
            }
        }
    };

    let framing = resp.body_framing(&method)?;
    let backend_keep = keep_alive(resp.version, &resp.headers);
    let server_token = resp.header("server").map(str::to_string);

    let mut resp = resp;
    resp.stamp_via(&local.to_string(), server_token.as_deref());
    resp.stamp_sts(ctx.settings.sts_seconds);
    let pairs = h2_response_pairs(&resp);
    metrics::increment_exchange_total(method.as_str(), resp.status.as_u16());

    let bodyless = matches!(framing, BodyFraming::None | BodyFraming::Length(0));
    shared.send_headers(id, &pairs, bodyless);

    let mut downstream = 0u64;
    let mut delimited = true;
    if !bodyless {
        match framing {
            BodyFraming::None | BodyFraming::Length(0) => {}
            BodyFraming::Length(total) => {
                let mut left = total;
                while left > 0 {
                    if backbuf.is_empty() {
                        let n = read_more(&mut back, &mut backbuf, recv)
                            .await
                            .map_err(RelayError::BackendIo)?;
                        if n == 0 {
                            return Err(RelayError::BackendIo(eof("backend body truncated")));
                        }
                    }
                    let take = left.min(backbuf.len() as u64) as usize;
                    let piece = backbuf.split_to(take).freeze();
                    left -= take as u64;
                    downstream += piece.len() as u64;
                    send_data(shared, id, piece, left == 0).await;
                }
            }
            BodyFraming::Chunked => {
                let mut decoder = ChunkedDecoder::new();
                let mut decoded = BytesMut::new();
                loop {
                    let done = decoder.decode(&mut backbuf, &mut decoded)?;
                    if !decoded.is_empty() {
                        let piece = decoded.split().freeze();
                        downstream += piece.len() as u64;
                        send_data(shared, id, piece, false).await;
                    }
                    if done {
                        send_data(shared, id, Bytes::new(), true).await;
                        break;
                    }
                    let n = read_more(&mut back, &mut backbuf, recv)
                        .await
                        .map_err(RelayError::BackendIo)?;
                    if n == 0 {
                        return Err(RelayError::BackendIo(eof("backend body truncated")));
                    }
                }
            }
            BodyFraming::UntilClose => {
                loop {
                    if backbuf.is_empty() {
                        let n = read_more(&mut back, &mut backbuf, recv)
                            .await
                            .map_err(RelayError::BackendIo)?;
                        if n == 0 {
                            send_data(shared, id, Bytes::new(), true).await;
                            break;
                        }
                    }
                    let piece = backbuf.split().freeze();
                    downstream += piece.len() as u64;
                    send_data(shared, id, piece, false).await;
                }
                delimited = false;
            }
        }
    }

    ticket.lease.complete();
    if ctx.settings.reuse && backend_keep && delimited && backbuf.is_empty() {
        ctx.pool.checkin(&origin_key, back);
    }
    metrics::add_relayed_bytes("downstream", downstream);
    Ok(())
}

/// Send one DATA payload, then wait until the stream's parked frames
/// drain so the backend read pace follows the peer's window grants
async fn send_data(shared: &H2Shared, id: u32, payload: Bytes, end_stream: bool) {
    shared.flow_send(id, payload, end_stream);
    loop {
        let notified = shared.window_open.notified();
        let parked = shared.with_flow(|flow| {
            flow.stream(id)
                .map(|stream| stream.frames_pending)
                .unwrap_or(0)
        });
        if parked == 0 {
            return;
        }
        notified.await;
    }
}

fn respond_synthetic(shared: &H2Shared, id: u32, method: &Method, answer: Answer) {
    metrics::increment_synthesized(answer.status.as_u16());
    metrics::increment_exchange_total(method.as_str(), answer.status.as_u16());
    let (pairs, body) = answer.into_pairs();
    let head_only = body.is_empty() || *method == Method::HEAD;
    shared.send_headers(id, &pairs, head_only);
    if !head_only {
        shared.flow_send(id, body, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url_reconstruction() {
        assert_eq!(
            request_url("/x?q=1", "a.test"),
            "http://a.test/x?q=1"
        );
        assert_eq!(
            request_url("http://a.test/x", "ignored.test"),
            "http://a.test/x"
        );
    }

    #[test]
    fn test_origin_form_extracts_path_and_query() {
        assert_eq!(origin_form("http://a.test/x?q=1"), "/x?q=1");
        assert_eq!(origin_form("http://a.test"), "/");
        assert_eq!(origin_form("/already/origin"), "/already/origin");
    }

    #[test]
    fn test_body_plan_known_length_passes_verbatim() {
        let plan = BodyPlan::pick(
            BodyFraming::Length(10),
            Version::HTTP_11,
            None,
            None,
            false,
        );
        assert_eq!(plan.write, FrontWrite::Verbatim);
        assert!(!plan.decode_chunked);
        assert!(!plan.forces_close());
    }

    #[test]
    fn test_body_plan_compresses_when_client_accepts() {
        let plan = BodyPlan::pick(
            BodyFraming::Length(10),
            Version::HTTP_11,
            Some(Encoding::Gzip),
            Some("gzip, deflate"),
            false,
        );
        assert_eq!(plan.write, FrontWrite::Encode(Encoding::Gzip));
    }

    #[test]
    fn test_body_plan_never_recompresses_coded_bodies() {
        let plan = BodyPlan::pick(
            BodyFraming::Length(10),
            Version::HTTP_11,
            Some(Encoding::Gzip),
            Some("gzip"),
            true,
        );
        assert_eq!(plan.write, FrontWrite::Verbatim);
    }

    #[test]
    fn test_body_plan_downgrades_unadvertised_codec_to_chunked() {
        let plan = BodyPlan::pick(
            BodyFraming::UntilClose,
            Version::HTTP_11,
            Some(Encoding::Gzip),
            None,
            false,
        );
        assert_eq!(plan.write, FrontWrite::Encode(Encoding::Chunked));
    }

    #[test]
    fn test_body_plan_rechunks_chunked_for_http11() {
        let plan = BodyPlan::pick(BodyFraming::Chunked, Version::HTTP_11, None, None, false);
        assert!(plan.decode_chunked);
        assert_eq!(plan.write, FrontWrite::Encode(Encoding::Chunked));
    }

    #[test]
    fn test_body_plan_decodes_chunked_for_http10_peer() {
        let plan = BodyPlan::pick(BodyFraming::Chunked, Version::HTTP_10, None, None, false);
        assert!(plan.decode_chunked);
        assert_eq!(plan.write, FrontWrite::Raw);
        assert!(plan.forces_close());
    }

    #[test]
    fn test_body_plan_until_close_is_rechunked_for_http11() {
        let plan = BodyPlan::pick(BodyFraming::UntilClose, Version::HTTP_11, None, None, false);
        assert!(!plan.decode_chunked);
        assert_eq!(plan.write, FrontWrite::Encode(Encoding::Chunked));
    }

    #[test]
    fn test_plan_apply_rewrites_framing_headers() {
        let mut resp = ResponseHead::synthetic(StatusCode::OK);
        resp.set_header("Content-Length", "10");
        let plan = BodyPlan {
            decode_chunked: false,
            write: FrontWrite::Encode(Encoding::Gzip),
        };
        plan.apply(&mut resp);
        assert!(resp.header("content-length").is_none());
        assert_eq!(resp.header("transfer-encoding"), Some("chunked"));
        assert_eq!(resp.header("content-encoding"), Some("gzip"));
    }

    #[test]
    fn test_answer_renders_html_head() {
        let (head, body) = Answer::not_found().into_head(Version::HTTP_11);
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert_eq!(
            head.header("content-length"),
            Some(body.len().to_string().as_str())
        );
        assert!(std::str::from_utf8(&body)
            .unwrap()
            .contains("No proxy endpoint found"));
    }

    #[test]
    fn test_answer_redirect_carries_location() {
        let (head, _) = Answer::see_other("http://b.test/err").into_head(Version::HTTP_11);
        assert_eq!(head.status, StatusCode::SEE_OTHER);
        assert_eq!(head.header("location"), Some("http://b.test/err"));
    }

    #[test]
    fn test_answer_pairs_lead_with_status() {
        let (pairs, body) = Answer::unauthorized("Basic realm=\"relay\"").into_pairs();
        assert_eq!(pairs[0].0, b":status".to_vec());
        assert_eq!(pairs[0].1, b"401".to_vec());
        assert!(pairs.iter().any(|(name, value)| {
            name == b"www-authenticate" && value == b"Basic realm=\"relay\""
        }));
        assert!(!body.is_empty());
    }

    #[test]
    fn test_h2_request_from_pairs() {
        let pairs = vec![
            (b":method".to_vec(), b"GET".to_vec()),
            (b":scheme".to_vec(), b"http".to_vec()),
            (b":authority".to_vec(), b"a.test".to_vec()),
            (b":path".to_vec(), b"/x?q=1".to_vec()),
            (b"accept".to_vec(), b"*/*".to_vec()),
        ];
        let request = H2Request::from_pairs(&pairs).expect("well-formed");
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.authority, "a.test");
        assert_eq!(request.path, "/x?q=1");
        assert_eq!(request.header("accept"), Some("*/*"));
    }

    #[test]
    fn test_h2_request_requires_method() {
        let pairs = vec![(b":path".to_vec(), b"/".to_vec())];
        assert!(H2Request::from_pairs(&pairs).is_err());
    }

    #[test]
    fn test_backend_head_translation() {
        let request = H2Request {
            method: Method::POST,
            authority: "a.test".to_string(),
            path: "/submit".to_string(),
            headers: vec![
                Header::new("te", "trailers"),
                Header::new("cookie", "a=1"),
                Header::new("cookie", "b=2"),
                Header::new("accept", "*/*"),
            ],
        };
        let head = backend_head_from_h2(
            &request,
            "/submit".to_string(),
            "10.0.0.9".parse().unwrap(),
            8080,
            false,
            true,
            true,
        );
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.host(), Some("a.test"));
        assert_eq!(head.header("te"), None);
        assert_eq!(head.header("cookie"), Some("a=1; b=2"));
        assert_eq!(head.header("transfer-encoding"), Some("chunked"));
        assert_eq!(head.header("connection"), Some("keep-alive"));
        assert_eq!(head.header("x-forwarded-for"), Some("10.0.0.9"));
    }

    #[test]
    fn test_h2_response_pairs_strip_hop_by_hop() {
        let mut resp = ResponseHead::synthetic(StatusCode::OK);
        resp.set_header("Connection", "keep-alive");
        resp.set_header("Transfer-Encoding", "chunked");
        resp.set_header("Content-Type", "text/plain");
        let pairs = h2_response_pairs(&resp);
        assert_eq!(pairs[0], (b":status".to_vec(), b"200".to_vec()));
        assert!(pairs.iter().all(|(name, _)| name != b"connection"));
        assert!(pairs.iter().all(|(name, _)| name != b"transfer-encoding"));
        assert!(pairs
            .iter()
            .any(|(name, value)| name == b"content-type" && value == b"text/plain"));
    }

    #[test]
    fn test_headers_fragment_strips_padding_and_priority() {
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&[2]); // pad length
        payload.extend_from_slice(&[0, 0, 0, 3, 16]); // priority fields
        payload.extend_from_slice(b"block");
        payload.extend_from_slice(&[0, 0]); // padding
        let frame = Frame {
            kind: FrameKind::Headers,
            flags: flags::END_HEADERS | flags::PADDED | flags::PRIORITY,
            stream_id: 1,
            payload: payload.freeze(),
        };
        let fragment = headers_fragment(&frame).expect("well-formed");
        assert_eq!(&fragment[..], b"block");
    }

    #[test]
    fn test_data_fragment_reports_padding_share() {
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&[3]);
        payload.extend_from_slice(b"data");
        payload.extend_from_slice(&[0, 0, 0]);
        let frame = Frame {
            kind: FrameKind::Data,
            flags: flags::PADDED,
            stream_id: 1,
            payload: payload.freeze(),
        };
        let (data, padding) = data_fragment(&frame).expect("well-formed");
        assert_eq!(&data[..], b"data");
        assert_eq!(padding, 4);
    }

    #[test]
    fn test_pad_length_beyond_payload_is_rejected() {
        let frame = Frame {
            kind: FrameKind::Data,
            flags: flags::PADDED,
            stream_id: 1,
            payload: Bytes::from_static(&[9, b'x']),
        };
        assert!(data_fragment(&frame).is_err());
    }

    #[test]
    fn test_hop_by_hop_set() {
        assert!(hop_by_hop("Connection"));
        assert!(hop_by_hop("transfer-encoding"));
        assert!(!hop_by_hop("content-length"));
        assert!(!hop_by_hop("via"));
    }
}
