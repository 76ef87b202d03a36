use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use super::frame::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW_SIZE, Frame, MAX_WINDOW_SIZE};

/// Local credit consumed before a WINDOW_UPDATE is granted back to the peer
const WINDOW_RECLAIM_THRESHOLD: i64 = DEFAULT_WINDOW_SIZE / 2;

/// Errors raised at the flow-state boundary
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum FlowError {
    /// The peer sent more bytes than the window we granted allows
    #[error("peer exceeded granted window on stream {stream_id}")]
    WindowExceeded { stream_id: u32 },
    /// A window increment would push the window past the protocol maximum
    #[error("window increment overflows on stream {stream_id}")]
    WindowOverflow { stream_id: u32 },
}

/// Result type for flow-state operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Lifecycle of one multiplexed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    Closed,
}

/// Per-stream window accounting.
///
/// `window` is send credit granted by the peer; `window_local` is receive
/// credit we granted. `frames_pending` counts frames parked in the
/// connection's pending queue for this stream.
#[derive(Debug)]
pub struct StreamFlow {
    pub id: u32,
    pub window: i64,
    pub window_local: i64,
    pub frames_pending: usize,
    pub state: StreamState,
    reclaim: i64,
}

impl StreamFlow {
    fn new(id: u32, window: i64) -> Self {
        Self {
            id,
            window,
            window_local: DEFAULT_WINDOW_SIZE,
            frames_pending: 0,
            state: StreamState::Open,
            reclaim: 0,
        }
    }
}

/// Which pass `flush_pending` runs after a window update.
///
/// `All` walks the whole queue and skips frames of streams that remain
/// starved. `FirstBlocking` preserves strict arrival order for shared
/// connection credit and stops at the first frame it cannot send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    All,
    FirstBlocking,
}

#[derive(Debug)]
struct PendingFrame {
    stream_id: u32,
    payload: Bytes,
    end_stream: bool,
}

/// Per-connection flow state: aggregate windows, owned streams, the FIFO
/// queue of frames waiting for credit, and the set of streams currently
/// unable to transmit.
///
/// This is a pure state machine: `send` and the update handlers return the
/// frames that became transmittable, and the caller performs the writes.
#[derive(Debug)]
pub struct ConnectionFlow {
    window: i64,
    window_local: i64,
    preface_done: bool,
    initial_window: i64,
    max_frame_size: usize,
    streams: HashMap<u32, StreamFlow>,
    pending: VecDeque<PendingFrame>,
    unavailable: HashSet<u32>,
    reclaim: i64,
}

impl Default for ConnectionFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFlow {
    /// Create flow state with protocol-default windows
    pub fn new() -> Self {
        Self {
            window: DEFAULT_WINDOW_SIZE,
            window_local: DEFAULT_WINDOW_SIZE,
            preface_done: false,
            initial_window: DEFAULT_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            streams: HashMap::new(),
            pending: VecDeque::new(),
            unavailable: HashSet::new(),
            reclaim: 0,
        }
    }

    /// Whether the peer's preface and first SETTINGS have been seen
    pub fn preface_done(&self) -> bool {
        self.preface_done
    }

    /// Record that the handshake completed
    pub fn mark_preface_done(&mut self) {
        self.preface_done = true;
    }

    /// Current connection-level send credit
    pub fn window(&self) -> i64 {
        self.window
    }

    /// Look up a stream's flow state
    pub fn stream(&self, id: u32) -> Option<&StreamFlow> {
        self.streams.get(&id)
    }

    /// Number of frames parked waiting for window credit
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a stream is currently marked unable to transmit
    pub fn is_unavailable(&self, id: u32) -> bool {
        self.unavailable.contains(&id)
    }

    /// Ids of streams that are currently open
    pub fn stream_ids(&self) -> Vec<u32> {
        self.streams.keys().copied().collect()
    }

    /// Register a peer-opened stream
    pub fn open_stream(&mut self, id: u32) -> &mut StreamFlow {
        self.streams
            .entry(id)
            .or_insert_with(|| StreamFlow::new(id, self.initial_window))
    }

    /// Adopt the peer's SETTINGS_MAX_FRAME_SIZE
    pub fn set_max_frame_size(&mut self, limit: usize) {
        self.max_frame_size = limit.max(1);
    }

    /// Adopt the peer's SETTINGS_INITIAL_WINDOW_SIZE.
    ///
    /// Existing streams are adjusted by the delta; growth may free parked
    /// frames, which are returned for transmission.
    pub fn set_initial_window(&mut self, size: u32) -> Vec<Frame> {
        let delta = i64::from(size) - self.initial_window;
        self.initial_window = i64::from(size);
        for stream in self.streams.values_mut() {
            stream.window += delta;
        }
        if delta > 0 {
            self.flush_pending(FlushMode::All)
        } else {
            Vec::new()
        }
    }

    /// Queue or transmit `payload` on a stream.
    ///
    /// Emits the largest sendable prefix under the connection and stream
    /// windows, fragmenting to the peer's frame size limit; the remainder
    /// (or, with zero credit, the whole frame) is parked in FIFO order and
    /// the stream marked unavailable. Frames for unknown or closed streams
    /// are dropped with a debug notice.
    pub fn send(&mut self, stream_id: u32, payload: Bytes, end_stream: bool) -> Vec<Frame> {
        match self.streams.get(&stream_id) {
            Some(stream) if stream.state == StreamState::Open => {}
            Some(stream) => {
                debug!(stream_id, state = ?stream.state, "dropping send on non-open stream");
                return Vec::new();
            }
            None => {
                debug!(stream_id, "dropping send on unknown stream");
                return Vec::new();
            }
        }

        // Frames already parked for this stream keep per-stream ordering:
        // anything new must queue behind them.
        if self.unavailable.contains(&stream_id) {
            self.queue_frame(stream_id, payload, end_stream);
            return Vec::new();
        }

        let mut rest = payload;
        if rest.is_empty() {
            // Zero-length frames carry END_STREAM and need no credit
            if end_stream {
                self.mark_local_end(stream_id);
            }
            return vec![Frame::data(stream_id, rest, end_stream)];
        }

        let mut out = Vec::new();
        loop {
            let sendable = self.sendable_for(stream_id);
            if sendable == 0 {
                self.queue_frame(stream_id, rest, end_stream);
                break;
            }
            let take = sendable.min(rest.len());
            let chunk = rest.split_to(take);
            self.window -= take as i64;
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.window -= take as i64;
            }
            let last = rest.is_empty();
            out.push(Frame::data(stream_id, chunk, end_stream && last));
            if last {
                if end_stream {
                    self.mark_local_end(stream_id);
                }
                break;
            }
        }
        out
    }

    /// Apply a WINDOW_UPDATE and flush whatever credit freed.
    ///
    /// Stream id zero targets the connection window; shared credit is
    /// flushed in strict arrival order, per-stream credit skips streams
    /// that remain starved.
    pub fn on_window_update(&mut self, stream_id: u32, increment: u32) -> FlowResult<Vec<Frame>> {
        let increment = i64::from(increment);
        if stream_id == 0 {
            if self.window + increment > MAX_WINDOW_SIZE {
                return Err(FlowError::WindowOverflow { stream_id });
            }
            self.window += increment;
            Ok(self.flush_pending(FlushMode::FirstBlocking))
        } else {
            match self.streams.get_mut(&stream_id) {
                Some(stream) => {
                    if stream.window + increment > MAX_WINDOW_SIZE {
                        return Err(FlowError::WindowOverflow { stream_id });
                    }
                    stream.window += increment;
                    Ok(self.flush_pending(FlushMode::All))
                }
                None => {
                    debug!(stream_id, "dropping window update for unknown stream");
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Account inbound payload bytes against the windows we granted
    pub fn on_data_received(&mut self, stream_id: u32, len: usize) -> FlowResult<()> {
        let len = len as i64;
        if self.window_local - len < 0 {
            return Err(FlowError::WindowExceeded { stream_id: 0 });
        }
        self.window_local -= len;
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.window_local - len < 0 {
                return Err(FlowError::WindowExceeded { stream_id });
            }
            stream.window_local -= len;
        }
        Ok(())
    }

    /// Record that inbound bytes were relayed onward, granting credit back
    /// to the peer once enough has accumulated
    pub fn on_data_consumed(&mut self, stream_id: u32, len: usize) -> Vec<Frame> {
        let len = len as i64;
        let mut out = Vec::new();
        self.reclaim += len;
        if self.reclaim >= WINDOW_RECLAIM_THRESHOLD {
            out.push(Frame::window_update(0, self.reclaim as u32));
            self.window_local += self.reclaim;
            self.reclaim = 0;
        }
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.reclaim += len;
            if stream.reclaim >= WINDOW_RECLAIM_THRESHOLD {
                out.push(Frame::window_update(stream_id, stream.reclaim as u32));
                stream.window_local += stream.reclaim;
                stream.reclaim = 0;
            }
        }
        out
    }

    /// Peer signalled end of its direction on a stream
    pub fn on_end_stream(&mut self, stream_id: u32) {
        let done = match self.streams.get(&stream_id) {
            Some(stream) => stream.state == StreamState::HalfClosedLocal,
            None => false,
        };
        if done {
            self.close_stream(stream_id);
        }
    }

    /// Force-close a stream, discarding its parked frames.
    ///
    /// Returns whether the stream existed.
    pub fn close_stream(&mut self, stream_id: u32) -> bool {
        let existed = match self.streams.get_mut(&stream_id) {
            Some(stream) => {
                stream.state = StreamState::Closed;
                true
            }
            None => false,
        };
        self.streams.remove(&stream_id);
        self.unavailable.remove(&stream_id);
        self.pending.retain(|frame| frame.stream_id != stream_id);
        existed
    }

    /// Connection teardown: force-close every owned stream
    pub fn teardown(&mut self) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.close_stream(id);
        }
        self.pending.clear();
        self.unavailable.clear();
    }

    /// Mark a stream unable to transmit; idempotent
    pub fn try_unavailable(&mut self, stream_id: u32) {
        self.unavailable.insert(stream_id);
    }

    /// Clear the unavailable mark once ≥ 1 byte is sendable and nothing is
    /// parked; idempotent, and a no-op for streams not currently marked
    pub fn try_available(&mut self, stream_id: u32) {
        if !self.unavailable.contains(&stream_id) {
            return;
        }
        let clear = match self.streams.get(&stream_id) {
            Some(stream) => stream.frames_pending == 0 && self.window.min(stream.window) >= 1,
            None => true,
        };
        if clear {
            self.unavailable.remove(&stream_id);
        }
    }

    fn sendable_for(&self, stream_id: u32) -> usize {
        let stream_window = self
            .streams
            .get(&stream_id)
            .map(|stream| stream.window)
            .unwrap_or(0);
        self.window
            .min(stream_window)
            .max(0)
            .min(self.max_frame_size as i64) as usize
    }

    fn queue_frame(&mut self, stream_id: u32, payload: Bytes, end_stream: bool) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.frames_pending += 1;
        }
        self.pending.push_back(PendingFrame {
            stream_id,
            payload,
            end_stream,
        });
        self.try_unavailable(stream_id);
    }

    fn mark_local_end(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.state = StreamState::HalfClosedLocal;
        }
    }

    fn flush_pending(&mut self, mode: FlushMode) -> Vec<Frame> {
        let mut out = Vec::new();
        let mut work = std::mem::take(&mut self.pending);
        let mut kept: VecDeque<PendingFrame> = VecDeque::new();
        let mut blocked: HashSet<u32> = HashSet::new();
        let mut stopped = false;

        while let Some(mut frame) = work.pop_front() {
            if stopped || blocked.contains(&frame.stream_id) {
                kept.push_back(frame);
                continue;
            }
            if !self.streams.contains_key(&frame.stream_id) {
                debug!(stream_id = frame.stream_id, "discarding parked frame for closed stream");
                continue;
            }
            if frame.payload.is_empty() {
                self.finish_pending(frame.stream_id, frame.end_stream, Bytes::new(), &mut out);
                continue;
            }
            let sendable = self.sendable_for(frame.stream_id);
            if sendable == 0 {
                match mode {
                    FlushMode::All => {
                        blocked.insert(frame.stream_id);
                    }
                    FlushMode::FirstBlocking => {
                        stopped = true;
                    }
                }
                kept.push_back(frame);
                continue;
            }
            let take = sendable.min(frame.payload.len());
            let chunk = frame.payload.split_to(take);
            self.window -= take as i64;
            if let Some(stream) = self.streams.get_mut(&frame.stream_id) {
                stream.window -= take as i64;
            }
            if frame.payload.is_empty() {
                self.finish_pending(frame.stream_id, frame.end_stream, chunk, &mut out);
            } else {
                out.push(Frame::data(frame.stream_id, chunk, false));
                // Remainder goes back to the head so the next pass over it
                // keeps per-stream byte order
                work.push_front(frame);
            }
        }

        self.pending = kept;

        let parked: Vec<u32> = self.unavailable.iter().copied().collect();
        for id in parked {
            self.try_available(id);
        }
        out
    }

    fn finish_pending(&mut self, stream_id: u32, end_stream: bool, chunk: Bytes, out: &mut Vec<Frame>) {
        out.push(Frame::data(stream_id, chunk, end_stream));
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.frames_pending = stream.frames_pending.saturating_sub(1);
        }
        if end_stream {
            self.mark_local_end(stream_id);
        }
    }
}
