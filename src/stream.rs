use crate::{
    config::Config,
    error::{Result, YamuxError},
    frame::{Flags, Frame, FrameType, INITIAL_WINDOW_SIZE},
};
use bytes::{Buf, Bytes};
use dashmap::DashMap;
use std::{
    collections::VecDeque,
    future::poll_fn,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, Weak},
    task::{Context, Poll, Waker, ready},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::watch,
};

/// Live streams of a session, keyed by stream id.
pub(crate) type StreamTable = DashMap<u32, Arc<StreamShared>>;

/// Largest payload put in a single data frame.
const MAX_DATA_FRAME: usize = INITIAL_WINDOW_SIZE as usize;

/// Lifecycle of a stream, derived from the flags each side has sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    /// SYN exchanged, ACK still outstanding.
    Opening,
    Established,
    /// We sent FIN; the peer may still write.
    LocalHalfClosed,
    /// The peer sent FIN; we may still write.
    RemoteHalfClosed,
    Closed,
    Reset,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Reset)
    }
}

#[derive(Debug)]
struct StreamInner {
    /// Union of every flag received; never cleared.
    recv_flags: Flags,
    /// Union of every flag sent; never cleared.
    sent_flags: Flags,
    send_window: u32,
    /// Difference between the protocol's initial window and the smaller one
    /// assumed at creation; restored when the peer's SYN or ACK arrives,
    /// since its delta is relative to the protocol's initial window.
    handshake_credit: u32,
    /// Credit owed to the peer since the last window update.
    recv_delta: i64,
    recv_buf: VecDeque<Bytes>,
    recv_buffered: usize,
    read_closed: bool,
    /// Remainder of a write that did not fit the send window.
    pending: Option<Bytes>,
    reset_cause: Option<YamuxError>,
    session_closed: Option<YamuxError>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamInner {
    fn state(&self) -> StreamState {
        let seen = self.sent_flags | self.recv_flags;
        if self.reset_cause.is_some() || seen.contains(Flags::RST) {
            return StreamState::Reset;
        }
        if self.session_closed.is_some() {
            return StreamState::Closed;
        }

        match (
            self.sent_flags.contains(Flags::FIN),
            self.recv_flags.contains(Flags::FIN),
        ) {
            (true, true) => StreamState::Closed,
            (true, false) => StreamState::LocalHalfClosed,
            (false, true) => StreamState::RemoteHalfClosed,
            (false, false) if seen.contains(Flags::ACK) => StreamState::Established,
            (false, false) if seen.contains(Flags::SYN) => StreamState::Opening,
            (false, false) => StreamState::Init,
        }
    }

    /// No more payload will be buffered.
    fn recv_ended(&self) -> bool {
        self.read_closed
            || self.recv_flags.contains(Flags::FIN)
            || self.reset_cause.is_some()
            || self.session_closed.is_some()
    }

    fn check_writable(&self) -> Result<()> {
        if let Some(cause) = &self.session_closed {
            return Err(cause.clone());
        }
        if self.sent_flags.contains(Flags::FIN) {
            return Err(YamuxError::StreamClosed);
        }
        if self.sent_flags.contains(Flags::RST) {
            return Err(YamuxError::StreamReset);
        }
        if let Some(cause) = &self.reset_cause {
            return Err(cause.clone());
        }
        Ok(())
    }

    /// Fails and discards the pending chunk when the stream can no longer
    /// write it.
    fn check_pending(&mut self) -> Result<()> {
        self.check_writable().inspect_err(|_| self.pending = None)
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// Stream state shared between the session's dispatch path and the
/// user-facing [`Stream`] handle.
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: u32,
    max_window: u32,
    update_threshold: i64,
    frame_tx: flume::Sender<Frame>,
    inner: Mutex<StreamInner>,
    state_tx: watch::Sender<StreamState>,
}

impl StreamShared {
    pub(crate) fn new(id: u32, config: &Config, frame_tx: flume::Sender<Frame>) -> Self {
        // A window above the initial one is granted with the first update; a
        // smaller one shrinks the peer's view of it the same way.
        let recv_delta = i64::from(config.max_window_size) - i64::from(INITIAL_WINDOW_SIZE);
        let send_window = if recv_delta < 0 {
            config.max_window_size
        } else {
            INITIAL_WINDOW_SIZE
        };
        let (state_tx, _) = watch::channel(StreamState::Init);

        Self {
            id,
            max_window: config.max_window_size,
            update_threshold: config.window_update_threshold(),
            frame_tx,
            inner: Mutex::new(StreamInner {
                recv_flags: Flags::empty(),
                sent_flags: Flags::empty(),
                send_window,
                handshake_credit: INITIAL_WINDOW_SIZE - send_window,
                recv_delta,
                recv_buf: VecDeque::new(),
                recv_buffered: 0,
                read_closed: false,
                pending: None,
                reset_cause: None,
                session_closed: None,
                read_waker: None,
                write_waker: None,
            }),
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, inner: &StreamInner) -> StreamState {
        let state = inner.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        state
    }

    fn send_frame(&self, frame: Frame) {
        if self.frame_tx.send(frame).is_err() {
            tracing::trace!(stream_id = self.id, "session writer gone, frame dropped");
        }
    }

    /// Sends a window update when there are unsent flags or enough credit to
    /// return. Returns whether a frame was queued.
    fn send_window_update(&self, inner: &mut StreamInner, flags: Flags) -> bool {
        let flags = flags.difference(inner.sent_flags);
        let delta = inner.recv_delta;
        if flags.is_empty() && delta >= 0 && delta <= self.update_threshold {
            return false;
        }
        // Nothing but the RST itself goes out once the stream is dead.
        if !flags.contains(Flags::RST)
            && (inner.reset_cause.is_some() || inner.session_closed.is_some())
        {
            return false;
        }

        let length = delta.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        inner.recv_delta -= i64::from(length);
        inner.sent_flags |= flags;
        self.send_frame(Frame::window_update(self.id, flags, length));
        true
    }

    fn flush_pending(&self, inner: &mut StreamInner) {
        while inner.send_window > 0 {
            let Some(mut chunk) = inner.pending.take() else {
                break;
            };
            let n = chunk
                .len()
                .min(inner.send_window as usize)
                .min(MAX_DATA_FRAME);
            let head = chunk.split_to(n);
            inner.send_window -= n as u32;
            self.send_frame(Frame::data(self.id, Flags::empty(), head));
            if !chunk.is_empty() {
                inner.pending = Some(chunk);
            }
        }

        if inner.pending.is_none() {
            inner.wake_writer();
        }
    }

    fn abort(&self, inner: &mut StreamInner, cause: YamuxError) {
        if inner.reset_cause.is_some() {
            return;
        }
        // The peer already knows about its own reset.
        if !matches!(cause, YamuxError::StreamResetByPeer) {
            self.send_window_update(inner, Flags::RST);
        }

        tracing::debug!(stream_id = self.id, %cause, "stream reset");
        inner.reset_cause = Some(cause);
        inner.recv_buf.clear();
        inner.recv_buffered = 0;
        inner.wake_reader();
        inner.wake_writer();
    }

    fn handle_flags(&self, inner: &mut StreamInner, flags: Flags) {
        inner.recv_flags |= flags;

        if flags.contains(Flags::RST) {
            self.abort(inner, YamuxError::StreamResetByPeer);
            return;
        }
        if flags.contains(Flags::SYN) {
            self.send_window_update(inner, Flags::ACK);
        }
        if flags.contains(Flags::FIN) {
            inner.wake_reader();
        }
    }

    /// Sends the SYN of a locally opened stream.
    pub(crate) fn open(&self) {
        let mut inner = self.lock();
        self.send_window_update(&mut inner, Flags::SYN);
        self.publish(&inner);
    }

    /// Applies an inbound data or window-update frame and returns the
    /// resulting state.
    pub(crate) fn handle_frame(&self, frame: Frame) -> StreamState {
        let mut inner = self.lock();
        let flags = frame.flags();

        let mut credit = 0;
        if flags.intersects(Flags::SYN | Flags::ACK)
            && !inner.recv_flags.intersects(Flags::SYN | Flags::ACK)
        {
            credit += i64::from(std::mem::take(&mut inner.handshake_credit));
        }
        if frame.frame_type() == FrameType::WindowUpdate {
            credit += i64::from(frame.length());
        }
        if credit != 0 && !flags.contains(Flags::RST) {
            let window = i64::from(inner.send_window) + credit;
            inner.send_window = window.clamp(0, i64::from(u32::MAX)) as u32;
            if inner.send_window > 0 && inner.pending.is_some() {
                self.flush_pending(&mut inner);
            }
        }

        match frame.frame_type() {
            FrameType::Data => {
                if !inner.recv_ended() && !frame.data.is_empty() {
                    let len = frame.data.len();
                    if inner.recv_buffered + len > self.max_window as usize {
                        tracing::warn!(
                            stream_id = self.id,
                            buffered = inner.recv_buffered,
                            len,
                            "peer overran the receive window"
                        );
                        self.abort(&mut inner, YamuxError::ReceiveWindowExceeded);
                    } else {
                        inner.recv_buffered += len;
                        inner.recv_buf.push_back(frame.data);
                        inner.wake_reader();
                    }
                }
            }
            FrameType::WindowUpdate | FrameType::Ping | FrameType::GoAway => {}
        }

        self.handle_flags(&mut inner, flags);
        self.publish(&inner)
    }

    /// Ends the stream because its session is going away.
    pub(crate) fn force_close(&self, cause: YamuxError) {
        let mut inner = self.lock();
        if inner.session_closed.is_none() {
            inner.session_closed = Some(cause);
        }
        inner.wake_reader();
        inner.wake_writer();
        self.publish(&inner);
    }

    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<Result<()>> {
        let mut inner = self.lock();
        if let Some(cause) = &inner.reset_cause {
            return Poll::Ready(Err(cause.clone()));
        }

        if inner.recv_buffered == 0 {
            if inner.recv_ended() {
                return Poll::Ready(Ok(()));
            }
            inner.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let mut read = 0;
        while buf.remaining() > 0 {
            let Some(chunk) = inner.recv_buf.front_mut() else {
                break;
            };
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            chunk.advance(n);
            if chunk.is_empty() {
                inner.recv_buf.pop_front();
            }
            read += n;
        }

        inner.recv_buffered -= read;
        inner.recv_delta += read as i64;
        self.send_window_update(&mut inner, Flags::empty());
        Poll::Ready(Ok(()))
    }

    fn poll_write_bytes(&self, cx: &mut Context<'_>, data: &mut Option<Bytes>) -> Poll<Result<()>> {
        let mut inner = self.lock();
        inner.check_pending()?;

        if inner.pending.is_some() {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        if let Some(chunk) = data.take().filter(|chunk| !chunk.is_empty()) {
            inner.pending = Some(chunk);
            self.flush_pending(&mut inner);
        }
        Poll::Ready(Ok(()))
    }

    fn poll_flush_pending(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let mut inner = self.lock();
        if inner.pending.is_none() {
            return Poll::Ready(Ok(()));
        }

        inner.check_pending()?;
        inner.write_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_end(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        ready!(self.poll_flush_pending(cx))?;

        let mut inner = self.lock();
        if inner.sent_flags.contains(Flags::FIN) {
            return Poll::Ready(Ok(()));
        }
        inner.check_writable()?;

        self.send_window_update(&mut inner, Flags::FIN);
        self.publish(&inner);
        Poll::Ready(Ok(()))
    }

    fn close_read(&self) {
        let mut inner = self.lock();
        inner.read_closed = true;
        inner.wake_reader();
    }

    pub(crate) fn reset(&self, cause: YamuxError) {
        let mut inner = self.lock();
        self.abort(&mut inner, cause);
        self.publish(&inner);
    }

    /// Called when the last user handle goes away: a clean FIN when nothing
    /// is left to send, RST when unsent data would be lost.
    fn release(&self) {
        let mut inner = self.lock();
        if inner.state().is_terminal() {
            return;
        }

        if inner.pending.is_some() {
            self.abort(&mut inner, YamuxError::StreamReset);
        } else {
            inner.read_closed = true;
            self.send_window_update(&mut inner, Flags::FIN);
        }
        self.publish(&inner);
    }

    pub(crate) fn state(&self) -> StreamState {
        self.lock().state()
    }

    fn ack_observed(&self) -> bool {
        let inner = self.lock();
        (inner.sent_flags | inner.recv_flags).contains(Flags::ACK)
    }

    fn send_window(&self) -> u32 {
        self.lock().send_window
    }

    fn buffered(&self) -> usize {
        self.lock().recv_buffered
    }

    fn is_send_closed(&self) -> bool {
        self.lock().sent_flags.contains(Flags::FIN)
    }

    fn reset_cause(&self) -> Option<YamuxError> {
        self.lock().reset_cause.clone()
    }

    fn close_cause(&self) -> Option<YamuxError> {
        self.lock().session_closed.clone()
    }

    fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }
}

/// A multiplexed stream within a yamux session.
///
/// `Stream` implements [`AsyncRead`] and [`AsyncWrite`]. Writes beyond the
/// send window are held as a single pending chunk; `poll_flush` completes
/// once that chunk has been framed. `poll_shutdown` half-closes the stream
/// (FIN) while reads keep working until the peer closes its side.
///
/// Dropping a stream closes it: gracefully when everything written has been
/// framed, with a reset otherwise.
#[derive(Debug)]
pub struct Stream {
    shared: Arc<StreamShared>,
    table: Weak<StreamTable>,
    is_local: bool,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, table: Weak<StreamTable>, is_local: bool) -> Self {
        Self {
            shared,
            table,
            is_local,
        }
    }

    /// Get the stream ID
    pub fn stream_id(&self) -> u32 {
        self.shared.id
    }

    /// Whether this side opened the stream.
    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Credit left before writes have to wait for a window update.
    pub fn send_window(&self) -> u32 {
        self.shared.send_window()
    }

    /// Capacity of the receive buffer.
    pub fn recv_window(&self) -> u32 {
        self.shared.max_window
    }

    /// Received bytes waiting to be read.
    pub fn buffered(&self) -> usize {
        self.shared.buffered()
    }

    pub fn is_send_closed(&self) -> bool {
        self.shared.is_send_closed()
    }

    /// Why the stream was reset, if it was.
    pub fn reset_cause(&self) -> Option<YamuxError> {
        self.shared.reset_cause()
    }

    /// Observe state transitions (established, half-closed, reset, ...).
    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.shared.subscribe()
    }

    /// Resolves once the open handshake completed on this side.
    pub async fn established(&self) -> Result<()> {
        let mut state_rx = self.shared.subscribe();
        let state = *state_rx
            .wait_for(|state| !matches!(state, StreamState::Init | StreamState::Opening))
            .await
            .map_err(|_| YamuxError::SessionClosed)?;

        match state {
            StreamState::Reset => Err(self.reset_cause().unwrap_or(YamuxError::StreamReset)),
            _ if self.shared.ack_observed() => Ok(()),
            _ => Err(self
                .shared
                .close_cause()
                .unwrap_or(YamuxError::StreamClosed)),
        }
    }

    /// Write `data` and wait until all of it has been framed.
    ///
    /// Data beyond the current send window waits for the peer's window
    /// update; a reset fails the call.
    pub async fn send(&mut self, data: Bytes) -> Result<()> {
        let mut data = Some(data);
        poll_fn(|cx| self.shared.poll_write_bytes(cx, &mut data)).await?;
        poll_fn(|cx| self.shared.poll_flush_pending(cx)).await
    }

    /// Half-close: flush pending data, then send FIN.
    pub async fn end(&mut self) -> Result<()> {
        poll_fn(|cx| self.shared.poll_end(cx)).await?;
        self.detach_if_terminal();
        Ok(())
    }

    /// Graceful close of both directions. Data already buffered stays
    /// readable.
    pub async fn close(&mut self) -> Result<()> {
        let result = poll_fn(|cx| self.shared.poll_end(cx)).await;
        self.shared.close_read();
        self.detach();
        result
    }

    /// Abort the stream, discarding buffered data and failing pending writes.
    pub fn reset(&mut self) {
        self.shared.reset(YamuxError::StreamReset);
        self.detach();
    }

    fn detach_if_terminal(&self) {
        if self.shared.state().is_terminal() {
            self.detach();
        }
    }

    fn detach(&self) {
        if let Some(table) = self.table.upgrade() {
            if table.remove(&self.shared.id).is_some() {
                tracing::debug!(stream_id = self.shared.id, "stream removed from session");
            }
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.shared.poll_read(cx, buf).map_err(io::Error::from)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut data = Some(Bytes::copy_from_slice(buf));
        self.shared
            .poll_write_bytes(cx, &mut data)
            .map_ok(|()| buf.len())
            .map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.poll_flush_pending(cx).map_err(io::Error::from)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = ready!(self.shared.poll_end(cx));
        self.detach_if_terminal();
        Poll::Ready(result.map_err(io::Error::from))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.release();
        self.detach();
    }
}
