//! Stream-multiplexed session over a single byte-ordered connection
//!
//! Turns one TCP+TLS connection into many independent byte streams. Either
//! side can open streams at any time; the relay uses even stream IDs and the
//! agent odd IDs so allocations never collide. A background ping/pong
//! watchdog detects dead peers, and per-stream send windows keep one slow
//! stream from monopolising the connection.

use crate::frame::{Frame, FrameType, MuxError, StreamId};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Which side of the connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Accepting side (the relay); opens even stream IDs
    Server,
    /// Initiating side (the agent); opens odd stream IDs
    Client,
}

/// Session tuning knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// How long a ping may go unanswered before the session is declared dead
    pub keepalive_timeout: Duration,
    /// Initial per-stream send window
    pub initial_window: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
            initial_window: 256 * 1024,
        }
    }
}

/// Per-stream send window; senders block at zero credit
struct SendWindow {
    credit: Mutex<u64>,
    notify: Notify,
}

impl SendWindow {
    fn new(initial: u32) -> Self {
        Self {
            credit: Mutex::new(initial as u64),
            notify: Notify::new(),
        }
    }

    fn add(&self, amount: u32) {
        let mut credit = self.credit.lock().unwrap();
        *credit += amount as u64;
        self.notify.notify_waiters();
    }

    /// Take up to `want` bytes of credit, waiting for a grant if empty
    async fn reserve(&self, want: usize, shared: &Shared) -> Result<usize, MuxError> {
        loop {
            if shared.is_closed() {
                return Err(MuxError::SessionClosed);
            }

            let notified = self.notify.notified();

            {
                let mut credit = self.credit.lock().unwrap();
                if *credit > 0 {
                    let taken = want.min(*credit as usize);
                    *credit -= taken as u64;
                    return Ok(taken);
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = shared.wait_closed() => {}
            }
        }
    }
}

struct StreamEntry {
    data_tx: mpsc::UnboundedSender<Bytes>,
    window: Arc<SendWindow>,
}

struct Shared {
    outbound: mpsc::UnboundedSender<Frame>,
    streams: Mutex<HashMap<StreamId, StreamEntry>>,
    next_stream_id: AtomicU32,
    closed: AtomicBool,
    closed_notify: Notify,
    last_activity: Mutex<Instant>,
    config: SessionConfig,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn wait_closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let notified = self.closed_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Mark the session dead and error out every live stream
    fn fail(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping the senders ends every stream receiver; window waiters
        // wake through closed_notify.
        let mut streams = self.streams.lock().unwrap();
        let count = streams.len();
        streams.clear();
        drop(streams);

        if count > 0 {
            debug!("Mux session closed with {} live streams", count);
        }
        self.closed_notify.notify_waiters();
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn register_stream(&self, stream_id: StreamId) -> Option<(mpsc::UnboundedReceiver<Bytes>, Arc<SendWindow>)> {
        let mut streams = self.streams.lock().unwrap();
        if streams.contains_key(&stream_id) {
            return None;
        }

        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let window = Arc::new(SendWindow::new(self.config.initial_window));
        streams.insert(
            stream_id,
            StreamEntry {
                data_tx,
                window: window.clone(),
            },
        );
        Some((data_rx, window))
    }

    fn remove_stream(&self, stream_id: StreamId) {
        self.streams.lock().unwrap().remove(&stream_id);
    }
}

fn handle_frame(
    shared: &Arc<Shared>,
    frame: Frame,
    incoming_tx: &mpsc::UnboundedSender<MuxStream>,
) {
    shared.touch();

    match frame.frame_type {
        FrameType::Open => {
            let stream_id = frame.stream_id;
            match shared.register_stream(stream_id) {
                Some((data_rx, window)) => {
                    let stream = MuxStream::from_parts(stream_id, shared.clone(), data_rx, window);
                    // Receiver gone means nobody is accepting; refuse the stream
                    if incoming_tx.send(stream).is_err() {
                        shared.remove_stream(stream_id);
                        let _ = shared.outbound.send(Frame::close(stream_id));
                    }
                }
                None => {
                    trace!("Ignoring Open for existing stream {}", stream_id);
                }
            }
        }
        FrameType::Data => {
            let stream_id = frame.stream_id;
            let delivered = {
                let streams = shared.streams.lock().unwrap();
                match streams.get(&stream_id) {
                    Some(entry) => entry.data_tx.send(frame.payload).is_ok(),
                    None => {
                        trace!("Dropping data for unknown stream {}", stream_id);
                        true
                    }
                }
            };
            if !delivered {
                // Local reader is gone; tell the peer to stop sending
                shared.remove_stream(stream_id);
                let _ = shared.outbound.send(Frame::close(stream_id));
            }
        }
        FrameType::WindowUpdate => {
            if let Some(credit) = frame.credit() {
                let streams = shared.streams.lock().unwrap();
                if let Some(entry) = streams.get(&frame.stream_id) {
                    entry.window.add(credit);
                }
            }
        }
        FrameType::Close => {
            shared.remove_stream(frame.stream_id);
        }
        FrameType::Ping => {
            let _ = shared.outbound.send(Frame::pong(frame.payload));
        }
        FrameType::Pong => {}
    }
}

/// A stream-multiplexed session over one connection
pub struct MuxSession {
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
}

impl MuxSession {
    /// Wrap a connection in a session with default tuning
    pub fn new<S>(io: S, mode: SessionMode) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(io, mode, SessionConfig::default())
    }

    pub fn with_config<S>(io: S, mode: SessionMode, config: SessionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let first_id = match mode {
            SessionMode::Server => 2,
            SessionMode::Client => 1,
        };

        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(first_id),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            last_activity: Mutex::new(Instant::now()),
            config,
        });

        let (read_half, write_half) = tokio::io::split(io);

        tokio::spawn(read_loop(read_half, shared.clone(), incoming_tx));
        tokio::spawn(write_loop(write_half, shared.clone(), outbound_rx));
        tokio::spawn(keepalive_loop(shared.clone()));

        Self {
            shared,
            incoming: tokio::sync::Mutex::new(incoming_rx),
        }
    }

    /// Open a new outbound stream
    pub fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if self.shared.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let stream_id = self.shared.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let (data_rx, window) = self
            .shared
            .register_stream(stream_id)
            .ok_or(MuxError::SessionClosed)?;

        self.shared
            .outbound
            .send(Frame::open(stream_id))
            .map_err(|_| MuxError::SessionClosed)?;

        Ok(MuxStream::from_parts(
            stream_id,
            self.shared.clone(),
            data_rx,
            window,
        ))
    }

    /// Receive the next stream opened by the peer; None once the session dies
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.incoming.lock().await.recv().await
    }

    /// Tear down the session; all live streams error out
    pub fn shutdown(&self) {
        self.shared.fail();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves when the session dies (peer gone, keepalive failure, shutdown)
    pub async fn closed(&self) {
        self.shared.wait_closed().await;
    }

    /// Instant of the most recent inbound frame; feeds liveness checks
    pub fn last_activity(&self) -> Instant {
        *self.shared.last_activity.lock().unwrap()
    }
}

async fn read_loop<R>(
    mut read_half: R,
    shared: Arc<Shared>,
    incoming_tx: mpsc::UnboundedSender<MuxStream>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            result = Frame::read_from(&mut read_half) => match result {
                Ok(frame) => handle_frame(&shared, frame, &incoming_tx),
                Err(e) => {
                    trace!("Mux read loop ending: {}", e);
                    break;
                }
            },
            _ = shared.wait_closed() => break,
        }
    }
    shared.fail();
}

async fn write_loop<W>(
    mut write_half: W,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            maybe_frame = outbound_rx.recv() => match maybe_frame {
                Some(frame) => {
                    if frame.write_to(&mut write_half).await.is_err() {
                        break;
                    }
                    if write_half.flush().await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = shared.wait_closed() => {
                // Best-effort flush of frames queued before shutdown, so an
                // ERROR reply still reaches the peer
                while let Ok(frame) = outbound_rx.try_recv() {
                    if frame.write_to(&mut write_half).await.is_err() {
                        break;
                    }
                }
                let _ = write_half.flush().await;
                break;
            }
        }
    }
    let _ = write_half.shutdown().await;
    shared.fail();
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let interval_len = shared.config.keepalive_interval;
    let timeout = shared.config.keepalive_timeout;

    let mut interval = tokio::time::interval(interval_len);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Skip the immediate first tick; the session just came up
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let sent_at = Instant::now();
                if shared.outbound.send(Frame::ping(Bytes::new())).is_err() {
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {}
                    _ = shared.wait_closed() => break,
                }

                // Any inbound frame since the ping proves the peer is alive
                if *shared.last_activity.lock().unwrap() < sent_at {
                    debug!("Mux keepalive timed out after {:?}", timeout);
                    break;
                }
            }
            _ = shared.wait_closed() => break,
        }
    }
    shared.fail();
}

/// One logical byte stream inside a session
pub struct MuxStream {
    sender: MuxStreamSender,
    receiver: MuxStreamReceiver,
}

impl MuxStream {
    fn from_parts(
        stream_id: StreamId,
        shared: Arc<Shared>,
        data_rx: mpsc::UnboundedReceiver<Bytes>,
        window: Arc<SendWindow>,
    ) -> Self {
        Self {
            sender: MuxStreamSender {
                stream_id,
                shared: shared.clone(),
                window,
                closed: Arc::new(AtomicBool::new(false)),
            },
            receiver: MuxStreamReceiver {
                stream_id,
                shared,
                data_rx,
            },
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.sender.stream_id
    }

    /// Split into independently-owned send and receive halves
    pub fn split(self) -> (MuxStreamSender, MuxStreamReceiver) {
        (self.sender, self.receiver)
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), MuxError> {
        self.sender.send(data).await
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn close(&self) {
        self.sender.close();
    }
}

/// Send half of a mux stream
pub struct MuxStreamSender {
    stream_id: StreamId,
    shared: Arc<Shared>,
    window: Arc<SendWindow>,
    closed: Arc<AtomicBool>,
}

impl MuxStreamSender {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Write bytes to the peer, chunked to frame size and bounded by the
    /// send window
    pub async fn send(&self, data: &[u8]) -> Result<(), MuxError> {
        let mut offset = 0;

        while offset < data.len() {
            if self.closed.load(Ordering::Acquire) {
                return Err(MuxError::StreamClosed);
            }

            let remaining = data.len() - offset;
            let want = remaining.min(crate::MAX_FRAME_PAYLOAD as usize);
            let granted = self.window.reserve(want, &self.shared).await?;

            let chunk = Bytes::copy_from_slice(&data[offset..offset + granted]);
            self.shared
                .outbound
                .send(Frame::data(self.stream_id, chunk))
                .map_err(|_| MuxError::SessionClosed)?;

            offset += granted;
        }

        Ok(())
    }

    /// Signal end of stream to the peer; idempotent
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.shared.outbound.send(Frame::close(self.stream_id));
            self.shared.remove_stream(self.stream_id);
        }
    }
}

impl Drop for MuxStreamSender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receive half of a mux stream
pub struct MuxStreamReceiver {
    stream_id: StreamId,
    shared: Arc<Shared>,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
}

impl MuxStreamReceiver {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Receive the next chunk; None when the stream or session is closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        let chunk = self.data_rx.recv().await?;

        // Grant the consumed bytes back to the peer's send window
        let _ = self
            .shared
            .outbound
            .send(Frame::window_update(self.stream_id, chunk.len() as u32));

        Some(chunk)
    }
}
