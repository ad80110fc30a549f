use crate::{
    codec::Codec,
    config::Config,
    error::{Result, YamuxError},
    frame::{Flags, Frame, FrameType, GO_AWAY_NORMAL, SESSION_STREAM_ID},
    stream::{Stream, StreamShared, StreamTable},
    stream_id::StreamIdGenerator,
};
use dashmap::DashMap;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::{
    marker::PhantomData,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::oneshot,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::{codec::Framed, sync::CancellationToken};

/// Notifications published by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A stream was opened locally.
    StreamOpened(u32),
    /// The peer opened a stream; it is waiting in `accept_stream`.
    StreamAccepted(u32),
    /// A non-fatal failure: refused inbound stream, failed keep-alive ping,
    /// or the decode error that is about to close the session.
    Error(YamuxError),
    /// The session closed, with the cause if there was one.
    Closed(Option<YamuxError>),
}

/// A ping waiting for its response.
#[derive(Debug)]
struct PendingPing {
    stream_id: u32,
    tx: oneshot::Sender<Result<()>>,
}

/// A multiplexed session that manages multiple streams over a single connection
#[derive(Debug)]
pub struct Session<T> {
    inner: Arc<SessionInner>,
    _transport: PhantomData<fn() -> T>,
}

/// Internal session state shared between tasks
#[derive(Debug)]
struct SessionInner {
    config: Arc<Config>,
    ids: StreamIdGenerator,
    /// Live streams mapped by stream ID
    streams: Arc<StreamTable>,
    /// Outstanding pings keyed by nonce
    pings: DashMap<u32, PendingPing>,
    next_nonce: AtomicU32,
    /// Stream and session frames for send_loop
    frame_tx: flume::Sender<Frame>,
    /// Ping requests and responses, written ahead of everything else
    ping_tx: flume::Sender<Frame>,
    accept_tx: flume::Sender<Stream>,
    accept_rx: flume::Receiver<Stream>,
    event_tx: flume::Sender<SessionEvent>,
    event_rx: flume::Receiver<SessionEvent>,
    closed: AtomicBool,
    close_cause: OnceLock<Option<YamuxError>>,
    /// Cancelled when the session starts closing
    closing: CancellationToken,
    /// Cancelled once send_loop flushed and shut down the transport
    writer_done: CancellationToken,
}

impl<T> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _transport: PhantomData,
        }
    }
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Create a new client session
    pub async fn client(transport: T, config: Config) -> Result<Self> {
        Self::new(transport, config, true).await
    }

    /// Create a new server session
    pub async fn server(transport: T, config: Config) -> Result<Self> {
        Self::new(transport, config, false).await
    }

    async fn new(transport: T, config: Config, is_client: bool) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let framed = Framed::new(transport, Codec::new(&config));
        let (sink, stream) = framed.split();

        let (frame_tx, frame_rx) = flume::unbounded();
        let (ping_tx, ping_rx) = flume::unbounded();
        let (accept_tx, accept_rx) = flume::bounded(config.accept_backlog);
        let (event_tx, event_rx) = flume::bounded(config.event_buffer_size);

        let inner = Arc::new(SessionInner {
            config: Arc::clone(&config),
            ids: StreamIdGenerator::new(is_client),
            streams: Arc::new(StreamTable::new()),
            pings: DashMap::new(),
            next_nonce: AtomicU32::new(0),
            frame_tx,
            ping_tx,
            accept_tx,
            accept_rx,
            event_tx,
            event_rx,
            closed: AtomicBool::new(false),
            close_cause: OnceLock::new(),
            closing: CancellationToken::new(),
            writer_done: CancellationToken::new(),
        });

        tokio::spawn(recv_loop(stream, Arc::clone(&inner)));
        tokio::spawn(send_loop(sink, ping_rx, frame_rx, Arc::clone(&inner)));
        if config.keep_alive_enabled() {
            tokio::spawn(keepalive_loop(Arc::clone(&inner)));
        }

        tracing::debug!(is_client, "session started");
        Ok(Session {
            inner,
            _transport: PhantomData,
        })
    }

    /// Open a new outgoing stream.
    ///
    /// The SYN is queued immediately; the call never waits for the peer's
    /// ACK (see [`Stream::established`]).
    pub fn open_stream(&self) -> Result<Stream> {
        self.inner.open_stream()
    }

    /// Accept an incoming stream initiated by the peer
    pub async fn accept_stream(&self) -> Result<Stream> {
        tokio::select! {
            biased;
            result = self.inner.accept_rx.recv_async() => {
                result.map_err(|_| YamuxError::SessionClosed)
            }
            _ = self.inner.closing.cancelled() => Err(YamuxError::SessionClosed),
        }
    }

    /// Send a ping on `stream_id` and return the round-trip time.
    ///
    /// Fails with `PingTimeout` when no response arrives within the
    /// keep-alive timeout, and with `InvalidPingResponse` when the response
    /// comes back on a different stream id.
    pub async fn ping(&self, stream_id: u32) -> Result<Duration> {
        self.inner.ping(stream_id).await
    }

    /// Close the session and wait until the go-away has been written and the
    /// transport shut down.
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown(None);
        self.inner.writer_done.cancelled().await;
        Ok(())
    }

    /// Like [`close`](Self::close), recording `cause` as the close cause.
    pub async fn close_with(&self, cause: YamuxError) -> Result<()> {
        self.inner.shutdown(Some(cause));
        self.inner.writer_done.cancelled().await;
        Ok(())
    }

    /// Resolves when the session closes, with the close cause.
    pub async fn closed(&self) -> Option<YamuxError> {
        self.inner.closing.cancelled().await;
        self.close_cause()
    }

    pub fn close_cause(&self) -> Option<YamuxError> {
        self.inner.close_cause.get().cloned().flatten()
    }

    /// Receiver of session events.
    ///
    /// Every clone shares one queue, so each event goes to a single receiver.
    /// Events that do not fit the queue are dropped.
    pub fn events(&self) -> flume::Receiver<SessionEvent> {
        self.inner.event_rx.clone()
    }

    pub fn is_client(&self) -> bool {
        self.inner.ids.is_client()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of streams currently registered with the session
    pub fn num_streams(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl SessionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send_frame(&self, frame: Frame) {
        if self.frame_tx.send(frame).is_err() {
            tracing::trace!("send_loop gone, frame dropped");
        }
    }

    fn send_priority(&self, frame: Frame) {
        if self.ping_tx.send(frame).is_err() {
            tracing::trace!("send_loop gone, ping dropped");
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(err) = self.event_tx.try_send(event) {
            tracing::warn!(event = ?err.into_inner(), "session event queue full, event dropped");
        }
    }

    fn new_stream(&self, stream_id: u32, is_local: bool) -> (Arc<StreamShared>, Stream) {
        let shared = Arc::new(StreamShared::new(
            stream_id,
            &self.config,
            self.frame_tx.clone(),
        ));
        self.streams.insert(stream_id, Arc::clone(&shared));
        let stream = Stream::new(
            Arc::clone(&shared),
            Arc::downgrade(&self.streams),
            is_local,
        );
        (shared, stream)
    }

    fn open_stream(&self) -> Result<Stream> {
        if self.is_closed() {
            return Err(YamuxError::SessionClosed);
        }

        let stream_id = self.ids.next()?;
        let (shared, stream) = self.new_stream(stream_id, true);
        // A close that raced with registration never saw this stream
        if self.is_closed() {
            self.streams.remove(&stream_id);
            return Err(YamuxError::SessionClosed);
        }

        shared.open();
        tracing::debug!(stream_id, "stream opened");
        self.emit(SessionEvent::StreamOpened(stream_id));
        Ok(stream)
    }

    /// Registers a stream for an inbound SYN, or refuses it with RST.
    fn accept(&self, stream_id: u32) -> Option<Arc<StreamShared>> {
        if let Err(err) = self.ids.validate_peer_stream_id(stream_id) {
            tracing::warn!(stream_id, "refusing inbound stream: {}", err);
            self.emit(SessionEvent::Error(err));
            self.send_frame(Frame::window_update(stream_id, Flags::RST, 0));
            return None;
        }
        // A second SYN for a live stream kills it on both ends
        if let Some((_, live)) = self.streams.remove(&stream_id) {
            let err = YamuxError::InvalidStreamId(stream_id);
            tracing::warn!(stream_id, "duplicate SYN, resetting stream");
            live.reset(err.clone());
            self.emit(SessionEvent::Error(err));
            return None;
        }

        let (shared, stream) = self.new_stream(stream_id, false);
        if let Err(err) = self.accept_tx.try_send(stream) {
            let mut stream = err.into_inner();
            stream.reset();
            tracing::warn!(stream_id, "accept backlog full, stream refused");
            self.emit(SessionEvent::Error(YamuxError::AcceptBacklogFull(stream_id)));
            return None;
        }

        tracing::debug!(stream_id, "stream accepted");
        self.emit(SessionEvent::StreamAccepted(stream_id));
        Some(shared)
    }

    fn handle_frame(&self, frame: Frame) {
        tracing::trace!(
            frame_type = ?frame.frame_type(),
            stream_id = frame.stream_id(),
            flags = ?frame.flags(),
            length = frame.length(),
            "frame received"
        );

        match frame.frame_type() {
            FrameType::GoAway => {
                tracing::debug!(code = frame.length(), "go away received");
                self.shutdown(Some(YamuxError::GoAway));
            }
            FrameType::Ping => self.handle_ping(&frame),
            FrameType::Data | FrameType::WindowUpdate => self.handle_stream_frame(frame),
        }
    }

    fn handle_ping(&self, frame: &Frame) {
        let flags = frame.flags();
        if flags.contains(Flags::ACK) {
            let nonce = frame.length() as u32;
            match self.pings.remove(&nonce) {
                Some((_, pending)) => {
                    let result = if pending.stream_id == frame.stream_id() {
                        Ok(())
                    } else {
                        Err(YamuxError::InvalidPingResponse)
                    };
                    // The waiter may have timed out already
                    let _ = pending.tx.send(result);
                }
                None => tracing::trace!(nonce, "unsolicited ping response"),
            }
        } else if flags.contains(Flags::SYN) {
            self.send_priority(Frame::pong(frame.stream_id(), frame.length()));
        }
    }

    fn handle_stream_frame(&self, frame: Frame) {
        let stream_id = frame.stream_id();
        let shared = if frame.flags().contains(Flags::SYN) {
            match self.accept(stream_id) {
                Some(shared) => shared,
                None => return,
            }
        } else {
            match self.streams.get(&stream_id) {
                Some(entry) => Arc::clone(entry.value()),
                None => {
                    tracing::trace!(stream_id, "frame for unknown stream dropped");
                    return;
                }
            }
        };

        if shared.handle_frame(frame).is_terminal()
            && self
                .streams
                .remove_if(&stream_id, |_, live| Arc::ptr_eq(live, &shared))
                .is_some()
        {
            tracing::debug!(stream_id, "stream terminated");
        }
    }

    async fn ping(&self, stream_id: u32) -> Result<Duration> {
        if self.is_closed() {
            return Err(YamuxError::SessionClosed);
        }

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pings.insert(nonce, PendingPing { stream_id, tx });
        if self.is_closed() {
            self.pings.remove(&nonce);
            return Err(YamuxError::SessionClosed);
        }

        let started = Instant::now();
        self.send_priority(Frame::ping(stream_id, nonce));

        match tokio::time::timeout(self.config.keep_alive_timeout, rx).await {
            Ok(Ok(result)) => result.map(|()| started.elapsed()),
            Ok(Err(_)) => Err(YamuxError::SessionClosed),
            Err(_) => {
                self.pings.remove(&nonce);
                Err(YamuxError::PingTimeout)
            }
        }
    }

    /// Closes the session once; later calls are no-ops.
    fn shutdown(&self, cause: Option<YamuxError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.close_cause.set(cause.clone());
        match &cause {
            Some(cause) => tracing::info!("session closing: {}", cause),
            None => tracing::info!("session closing"),
        }

        let by_peer = matches!(cause, Some(YamuxError::GoAway));
        let stream_cause = if by_peer {
            YamuxError::StreamClosedByPeer
        } else {
            YamuxError::SessionClosed
        };
        let streams: Vec<_> = self
            .streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.streams.clear();
        for stream in streams {
            stream.force_close(stream_cause.clone());
        }

        let nonces: Vec<u32> = self.pings.iter().map(|entry| *entry.key()).collect();
        for nonce in nonces {
            if let Some((_, pending)) = self.pings.remove(&nonce) {
                let _ = pending.tx.send(Err(YamuxError::SessionClosed));
            }
        }

        if !by_peer {
            self.send_frame(Frame::go_away(GO_AWAY_NORMAL));
        }
        self.closing.cancel();
        self.emit(SessionEvent::Closed(cause));
    }
}

/// Background task that reads frames from the transport and dispatches them
async fn recv_loop<T>(mut frames: SplitStream<Framed<T, Codec>>, inner: Arc<SessionInner>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let cause = loop {
        tokio::select! {
            biased;
            _ = inner.closing.cancelled() => {
                tracing::info!("recv_loop shutting down");
                return;
            }
            next = frames.next() => match next {
                Some(Ok(frame)) => inner.handle_frame(frame),
                Some(Err(err)) => {
                    tracing::error!("Frame decode error: {}", err);
                    inner.emit(SessionEvent::Error(err.clone()));
                    break Some(err);
                }
                None => {
                    tracing::info!("Transport closed");
                    break None;
                }
            }
        }
    };

    inner.shutdown(cause);
}

/// Background task that writes frames to the transport
async fn send_loop<T>(
    mut sink: SplitSink<Framed<T, Codec>, Frame>,
    ping_rx: flume::Receiver<Frame>,
    frame_rx: flume::Receiver<Frame>,
    inner: Arc<SessionInner>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let result = write_frames(&mut sink, &ping_rx, &frame_rx, &inner.closing).await;
    if let Err(err) = &result {
        tracing::error!("Frame send error: {}", err);
    }
    if let Err(err) = sink.close().await {
        tracing::debug!("transport shutdown failed: {}", err);
    }
    inner.writer_done.cancel();

    if let Err(err) = result {
        inner.shutdown(Some(err));
    }
}

/// Writes queued frames, pings first, flushing once per batch. On shutdown
/// whatever is still queued (the go-away included) is written out.
async fn write_frames<T>(
    sink: &mut SplitSink<Framed<T, Codec>, Frame>,
    ping_rx: &flume::Receiver<Frame>,
    frame_rx: &flume::Receiver<Frame>,
    closing: &CancellationToken,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let next_queued = || ping_rx.try_recv().or_else(|_| frame_rx.try_recv()).ok();

    loop {
        let frame = tokio::select! {
            biased;
            Ok(frame) = ping_rx.recv_async() => frame,
            Ok(frame) = frame_rx.recv_async() => frame,
            _ = closing.cancelled() => break,
        };

        sink.feed(frame).await?;
        while let Some(frame) = next_queued() {
            sink.feed(frame).await?;
        }
        sink.flush().await?;
    }

    while let Some(frame) = next_queued() {
        sink.feed(frame).await?;
    }
    sink.flush().await?;
    tracing::info!("send_loop shutting down");
    Ok(())
}

/// Pings the peer on the session stream every keep-alive interval. Failures
/// are reported as events; they never close the session.
async fn keepalive_loop(inner: Arc<SessionInner>) {
    let period = inner.config.keep_alive_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.closing.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = inner.closing.cancelled() => break,
            result = inner.ping(SESSION_STREAM_ID) => result,
        };
        match result {
            Ok(rtt) => tracing::trace!(?rtt, "keep-alive ping answered"),
            Err(err) => {
                tracing::warn!("keep-alive ping failed: {}", err);
                inner.emit(SessionEvent::Error(err));
            }
        }
    }

    tracing::debug!("keep-alive stopped");
}
