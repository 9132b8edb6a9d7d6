//! Connection manager.
//!
//! A connection is split in two:
//!
//! - [`Listener`] owns the read half of the stream and runs the read loop. It is consumed by
//!   [`Listener::listen`], which returns once the connection is closed.
//! - [`Conn`] is a cheap, cloneable handle handed to every [`Handler`] callback. It owns the write
//!   half, the write queue, the session storage and the close state.
//!
//! # Closing
//!
//! Every path that ends a connection (a protocol error in the read loop, a close frame from the
//! peer, an explicit [`Conn::write_close`], a failed write or cancellation) goes through the same
//! compare-and-swap from `Open` to `Closing`. Only the winner writes a close frame and calls
//! [`Handler::on_close`] or [`Handler::on_error`]; everyone else gets
//! [`WebSocketError::ConnectionClosed`].
//!
//! The close sequence runs on its own task and each of its writes is bounded by
//! [`Options::close_timeout`], so it completes even when the peer stopped reading or the caller
//! that started it is dropped. A write stalled at that point fails with
//! [`WebSocketError::ConnectionClosed`].
use std::{
    fmt,
    future::Future,
    io,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{oneshot, Mutex},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    close::{self, CloseCode, CloseNegotiation},
    codec::{Decoder, Encoder},
    compression::{Compressor, Decompressor},
    fragment::{Defragmenter, Message},
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD},
    mask::MaskGenerator,
    options::Options,
    queue::{QueueDrain, TaskQueue},
    session::Session,
    BoxError, Result, WebSocketError,
};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Longest reason that fits a close frame next to its status code.
const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// The role the WebSocket stream is taking.
///
/// When a server role is taken the frames will not be masked, unlike
/// the client role, in which frames are masked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// The role of the other endpoint.
    pub fn peer(self) -> Role {
        match self {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        }
    }

    /// Whether outbound frames are masked under this role.
    pub fn masks(self) -> bool {
        self == Role::Client
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Application callbacks of a connection.
///
/// `on_message` is the only required method. Callbacks must not block for long: with inline
/// dispatch they stall the read loop, with queued dispatch they hold a read queue slot.
///
/// Optional ping and pong handling is exposed through [`Handler::ping_handler`] and
/// [`Handler::pong_handler`], which are resolved once when the connection is created:
///
/// ```rust
/// use std::sync::Arc;
/// use bytes::Bytes;
/// use wsengine::{async_trait, BoxError, Conn, Handler, Message, PingHandler};
///
/// struct Quiet;
///
/// #[async_trait]
/// impl Handler for Quiet {
///     async fn on_message(&self, _conn: &Conn, _message: Message) -> Result<(), BoxError> {
///         Ok(())
///     }
///
///     fn ping_handler(self: Arc<Self>) -> Option<Arc<dyn PingHandler>> {
///         Some(self)
///     }
/// }
///
/// #[async_trait]
/// impl PingHandler for Quiet {
///     // pings are acknowledged by the application protocol instead of a pong
///     async fn on_ping(&self, _conn: &Conn, _payload: Bytes) {}
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Called once, before the first frame is read.
    async fn on_open(&self, _conn: &Conn) {}

    /// Called for every complete data message.
    ///
    /// An error is reported to [`Handler::on_error`] and does not close the connection.
    async fn on_message(&self, conn: &Conn, message: Message) -> std::result::Result<(), BoxError>;

    /// Called once when the connection closes normally: the peer sent a close frame, or the
    /// application called [`Conn::write_close`].
    ///
    /// `code` is the status the peer sent, or 0 if its close frame carried none.
    async fn on_close(&self, _conn: &Conn, _code: u16, _reason: &[u8]) {}

    /// Called when a callback fails, and once when an error closes the connection.
    async fn on_error(&self, _conn: &Conn, _err: &WebSocketError) {}

    /// Custom ping handling. Without it every ping is answered with a pong carrying the same
    /// payload.
    fn ping_handler(self: Arc<Self>) -> Option<Arc<dyn PingHandler>> {
        None
    }

    /// Pong notifications. Without it pongs are ignored.
    fn pong_handler(self: Arc<Self>) -> Option<Arc<dyn PongHandler>> {
        None
    }
}

/// Replaces the automatic pong reply.
#[async_trait]
pub trait PingHandler: Send + Sync {
    async fn on_ping(&self, conn: &Conn, payload: Bytes);
}

/// Receives pong frames.
#[async_trait]
pub trait PongHandler: Send + Sync {
    async fn on_pong(&self, conn: &Conn, payload: Bytes);
}

/// Handle to one WebSocket connection.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<Shared>,
}

struct Shared {
    role: Role,
    state: AtomicU8,
    handler: Arc<dyn Handler>,
    ping: Option<Arc<dyn PingHandler>>,
    pong: Option<Arc<dyn PongHandler>>,
    writer: Mutex<Writer>,
    read_queue: TaskQueue,
    write_queue: TaskQueue,
    session: Session,
    /// Cancelled once the connection is closed, stops the read loop.
    shutdown: CancellationToken,
    options: Options,
}

/// Everything a write needs, guarded by one lock so frames never interleave.
struct Writer {
    /// `None` once the write half was shut down or abandoned.
    sink: Option<FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, Encoder>>,
    deflate: Option<Compressor>,
    masks: Option<MaskGenerator>,
    compress_threshold: usize,
}

/// A unit of work for the write queue.
enum Outbound {
    Control(Frame),
    Message {
        opcode: OpCode,
        payload: Bytes,
    },
    Fragmented {
        opcode: OpCode,
        payload: Bytes,
        fragment_size: usize,
    },
}

impl Writer {
    /// Masks the frame if this side masks and queues it in the sink.
    async fn feed(&mut self, mut frame: Frame) -> Result<()> {
        if let Some(masks) = self.masks.as_mut() {
            frame = frame.with_mask(masks.next_key());
        }
        self.sink()?.feed(frame).await
    }

    fn sink(&mut self) -> Result<&mut FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, Encoder>> {
        self.sink.as_mut().ok_or(WebSocketError::ConnectionClosed)
    }

    /// Compresses a data payload when compression is on and the payload is large enough.
    fn deflate(&mut self, payload: Bytes) -> Result<(Bytes, bool)> {
        match self.deflate.as_mut() {
            Some(deflate) if payload.len() >= self.compress_threshold => {
                Ok((deflate.compress(&payload)?, true))
            }
            _ => Ok((payload, false)),
        }
    }

    async fn write(&mut self, job: Outbound) -> Result<()> {
        match job {
            Outbound::Control(frame) => self.feed(frame).await?,
            Outbound::Message { opcode, payload } => {
                let frame = match self.deflate(payload)? {
                    (payload, true) => Frame::compress(true, opcode, None, payload),
                    (payload, false) => Frame::new(true, opcode, None, payload),
                };
                self.feed(frame).await?;
            }
            Outbound::Fragmented {
                opcode,
                payload,
                fragment_size,
            } => {
                // the whole message is compressed first; RSV1 goes on the first frame only
                let (payload, compressed) = self.deflate(payload)?;
                let size = fragment_size.max(1);
                let count = payload.len().div_ceil(size).max(1);

                for index in 0..count {
                    let start = index * size;
                    let end = (start + size).min(payload.len());
                    let chunk = payload.slice(start..end);
                    let fin = index + 1 == count;

                    let frame = match index {
                        0 if compressed => Frame::compress(fin, opcode, None, chunk),
                        0 => Frame::new(fin, opcode, None, chunk),
                        _ => Frame::new(fin, OpCode::Continuation, None, chunk),
                    };
                    self.feed(frame).await?;
                }
            }
        }

        self.sink()?.flush().await
    }
}

impl Conn {
    /// Takes over an upgraded stream as a server.
    pub fn server<S>(stream: S, options: Options, handler: Arc<dyn Handler>) -> Listener<S>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(Role::Server, stream, options, handler)
    }

    /// Takes over an upgraded stream as a client. Outbound frames are masked.
    pub fn client<S>(stream: S, options: Options, handler: Arc<dyn Handler>) -> Listener<S>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(Role::Client, stream, options, handler)
    }

    /// Takes over an upgraded stream under `role`.
    ///
    /// Nothing is read or written until the returned [`Listener`] is driven.
    pub fn new<S>(role: Role, stream: S, options: Options, handler: Arc<dyn Handler>) -> Listener<S>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_mask_generator(role, stream, options, handler, MaskGenerator::from_entropy())
    }

    /// Same as [`Conn::new`], drawing masking keys from `masks`.
    pub fn with_mask_generator<S>(
        role: Role,
        stream: S,
        options: Options,
        handler: Arc<dyn Handler>,
        masks: MaskGenerator,
    ) -> Listener<S>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let decoder = Decoder::new(options.max_payload_read)
            .with_compression(options.compression.is_some())
            .with_strict_length_encoding(options.strict_length_encoding);
        let frames = FramedRead::new(read_half, decoder);

        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        let writer = Writer {
            sink: Some(FramedWrite::new(write_half, Encoder)),
            deflate: options.compressor(role),
            masks: role.masks().then_some(masks),
            compress_threshold: options.compress_threshold,
        };

        let read_concurrency = if options.read_async {
            options.read_concurrency
        } else {
            1
        };

        let shared = Shared {
            role,
            state: AtomicU8::new(OPEN),
            ping: Arc::clone(&handler).ping_handler(),
            pong: Arc::clone(&handler).pong_handler(),
            handler,
            writer: Mutex::new(writer),
            read_queue: TaskQueue::new(
                read_concurrency,
                options.read_queue_capacity,
                options.backpressure,
            ),
            write_queue: TaskQueue::new(1, options.write_queue_capacity, options.backpressure),
            session: Session::default(),
            shutdown: CancellationToken::new(),
            options,
        };

        let conn = Conn {
            shared: Arc::new(shared),
        };

        Listener {
            inflate: conn.shared.options.decompressor(role),
            fragments: Defragmenter::new(conn.shared.options.max_payload_read),
            frames,
            conn,
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Returns `true` until the close sequence starts.
    pub fn is_open(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == OPEN
    }

    /// Per-connection storage.
    ///
    /// Still available to the callbacks invoked while the connection is closing.
    ///
    /// # Errors
    /// Returns [`WebSocketError::ConnectionClosed`] once the connection is closed.
    pub fn session(&self) -> Result<&Session> {
        if self.shared.state.load(Ordering::Acquire) == CLOSED {
            return Err(WebSocketError::ConnectionClosed);
        }
        Ok(&self.shared.session)
    }

    /// Sends a text or binary message and waits until it was written.
    ///
    /// The payload is compressed if compression was negotiated and it is at least
    /// `compress_threshold` bytes long. Ping and pong frames are accepted too, with a payload of at
    /// most 125 bytes.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidOpCode`] for Close and Continuation, which have dedicated methods
    /// - [`WebSocketError::ControlFrameTooLarge`] for oversized ping/pong payloads
    /// - [`WebSocketError::ConnectionClosed`] if the connection is closing or closed
    /// - [`WebSocketError::QueueFull`] if the write queue is full under `Backpressure::Reject`
    /// - the write error itself, in which case the connection is closed
    pub async fn write_message(&self, opcode: OpCode, payload: impl Into<Bytes>) -> Result<()> {
        let job = outbound(opcode, payload.into())?;
        self.submit(job).await
    }

    /// Queues a message without waiting for it to be written.
    ///
    /// Write failures are reported through [`Handler::on_error`] as the connection closes.
    pub async fn write_async(&self, opcode: OpCode, payload: impl Into<Bytes>) -> Result<()> {
        let job = outbound(opcode, payload.into())?;
        if !self.is_open() {
            return Err(WebSocketError::ConnectionClosed);
        }

        let conn = self.clone();
        self.shared
            .write_queue
            .push(async move {
                let _ = conn.write_now(job).await;
            })
            .await
            .map_err(queue_error)
    }

    /// Sends a ping frame.
    pub async fn write_ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.write_message(OpCode::Ping, payload).await
    }

    /// Sends a pong frame.
    pub async fn write_pong(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.write_message(OpCode::Pong, payload).await
    }

    /// Sends a text or binary message split into frames of at most `fragment_size` bytes.
    ///
    /// When compression applies, the whole message is compressed before it is split.
    pub async fn write_fragmented(
        &self,
        opcode: OpCode,
        payload: impl Into<Bytes>,
        fragment_size: usize,
    ) -> Result<()> {
        if !opcode.is_data() {
            return Err(WebSocketError::InvalidOpCode(opcode.into()));
        }

        self.submit(Outbound::Fragmented {
            opcode,
            payload: payload.into(),
            fragment_size,
        })
        .await
    }

    /// Serializes `value` as JSON and sends it as a text message.
    ///
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    pub async fn write_json<T>(&self, value: &T) -> Result<()>
    where
        T: serde::Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value)?;
        self.write_message(OpCode::Text, payload).await
    }

    /// Closes the connection with `code` and `reason`.
    ///
    /// The reason is truncated to 123 bytes. [`Handler::on_close`] is called with the same code
    /// and reason before this returns.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidCloseCode`] for codes that must not be sent, such as 1005 or
    ///   1006; the connection stays open
    /// - [`WebSocketError::ConnectionClosed`] if the connection was already closing
    /// - the error writing the close frame; the connection is closed regardless
    pub async fn write_close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if !code.is_allowed() {
            return Err(WebSocketError::InvalidCloseCode);
        }
        if !self.begin_close() {
            return Err(WebSocketError::ConnectionClosed);
        }

        let reason = truncate_reason(reason).to_owned();

        #[cfg(feature = "logging")]
        log::debug!("{} closing connection with {code}", self.shared.role);

        let frame = Frame::close(code, &reason);
        let (sent, _) = self
            .run_close(frame, move |conn| async move {
                conn.shared
                    .handler
                    .on_close(&conn, code.into(), reason.as_bytes())
                    .await;
            })
            .await;

        sent
    }

    /// Submits a write and waits for its outcome.
    async fn submit(&self, job: Outbound) -> Result<()> {
        if !self.is_open() {
            return Err(WebSocketError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        let conn = self.clone();
        self.shared
            .write_queue
            .push(async move {
                let _ = tx.send(conn.write_now(job).await);
            })
            .await
            .map_err(queue_error)?;

        rx.await.unwrap_or(Err(WebSocketError::ConnectionClosed))
    }

    /// Runs inside the write queue.
    async fn write_now(&self, job: Outbound) -> Result<()> {
        let res = tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => return Err(WebSocketError::ConnectionClosed),
            res = self.write_locked(job) => res,
        };

        match res {
            Ok(()) => Ok(()),
            Err(err) => {
                #[cfg(feature = "logging")]
                log::warn!("{} write failed: {err}", self.shared.role);

                Err(self.emit_error(err).await)
            }
        }
    }

    async fn write_locked(&self, job: Outbound) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        if !self.is_open() {
            return Err(WebSocketError::ConnectionClosed);
        }

        let Some(limit) = self.shared.options.write_timeout else {
            return writer.write(job).await;
        };

        let res = tokio::time::timeout(limit, writer.write(job)).await;
        match res {
            Ok(res) => res,
            Err(_) => {
                // a frame may be half written, nothing can follow it
                writer.sink = None;
                Err(timed_out("write"))
            }
        }
    }

    fn begin_close(&self) -> bool {
        self.shared
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Closes the connection because of `err`, handing the error back.
    async fn emit_error(&self, err: WebSocketError) -> WebSocketError {
        if !self.begin_close() {
            return err;
        }

        let code = err.close_code();

        #[cfg(feature = "logging")]
        log::debug!("{} closing connection with {code}: {err}", self.shared.role);

        let frame = Frame::close(code, truncate_reason(&err.to_string()));
        let (_, err) = self
            .run_close(frame, move |conn| async move {
                conn.shared.handler.on_error(&conn, &err).await;
                err
            })
            .await;

        err.unwrap_or(WebSocketError::ConnectionClosed)
    }

    /// Answers a close frame from the peer.
    async fn emit_close(&self, negotiation: CloseNegotiation) {
        if !self.begin_close() {
            return;
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "{} received close {}, replying {}",
            self.shared.role,
            negotiation.real_code,
            negotiation.response
        );

        let frame = Frame::close(negotiation.response, b"");
        let _ = self
            .run_close(frame, move |conn| async move {
                conn.shared
                    .handler
                    .on_close(&conn, negotiation.real_code, &negotiation.reason)
                    .await;
            })
            .await;
    }

    /// Runs the close sequence won by the caller: close frame, `notify`, then [`Conn::finish`].
    ///
    /// The sequence runs on its own task, so dropping the caller does not leave the connection
    /// half closed. A panic in `notify` does not skip `finish`.
    async fn run_close<T, F, Fut>(&self, frame: Frame, notify: F) -> (Result<()>, Option<T>)
    where
        F: FnOnce(Conn) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.clone();
        let sequence = async move {
            let sent = conn.send_close_frame(frame).await;
            let notified = AssertUnwindSafe(notify(conn.clone()))
                .catch_unwind()
                .await
                .ok();
            conn.finish().await;
            (sent, notified)
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle
                .spawn(sequence)
                .await
                .unwrap_or((Err(WebSocketError::ConnectionClosed), None)),
            Err(_) => sequence.await,
        }
    }

    async fn send_close_frame(&self, frame: Frame) -> Result<()> {
        let write = async {
            let mut writer = self.shared.writer.lock().await;
            writer.write(Outbound::Control(frame)).await
        };

        match tokio::time::timeout(self.shared.options.close_timeout, write).await {
            Ok(res) => res,
            Err(_) => {
                #[cfg(feature = "logging")]
                log::warn!("{} close frame not written in time", self.shared.role);

                Err(timed_out("close frame write"))
            }
        }
    }

    /// Last step of the close sequence.
    async fn finish(&self) {
        self.shared.state.store(CLOSED, Ordering::Release);
        // also aborts a write stalled on the socket, which releases the writer
        self.shared.shutdown.cancel();
        self.shared.read_queue.close(self.shared.options.drain);
        self.shared.write_queue.close(QueueDrain::Drain);

        let shutdown = async {
            let mut writer = self.shared.writer.lock().await;
            if let Some(mut sink) = writer.sink.take() {
                let _ = sink.close().await;
            }
        };
        // on timeout the sink is dropped unflushed
        let _ = tokio::time::timeout(self.shared.options.close_timeout, shutdown).await;
    }

    /// Runs `on_message`, reporting a failure to `on_error`.
    async fn deliver(&self, message: Message) {
        if let Err(err) = self.shared.handler.on_message(self, message).await {
            let err = WebSocketError::Application(err);
            self.shared.handler.on_error(self, &err).await;
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("role", &self.shared.role)
            .field("state", &self.shared.state.load(Ordering::Relaxed))
            .field("read_queue", &self.shared.read_queue)
            .field("write_queue", &self.shared.write_queue)
            .finish_non_exhaustive()
    }
}

/// The read side of a connection.
pub struct Listener<S> {
    conn: Conn,
    frames: FramedRead<tokio::io::ReadHalf<S>, Decoder>,
    fragments: Defragmenter,
    inflate: Option<Decompressor>,
}

impl<S> Listener<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// The handle of this connection.
    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    /// Runs the read loop until the connection is closed.
    pub async fn listen(self) {
        self.listen_until(CancellationToken::new()).await
    }

    /// Runs the read loop until the connection is closed or `cancel` fires.
    ///
    /// Cancellation closes the connection with status 1001. Queued incoming messages are drained
    /// or discarded according to [`Options::drain`] before this returns.
    pub async fn listen_until(mut self, cancel: CancellationToken) {
        let conn = self.conn.clone();

        #[cfg(feature = "logging")]
        log::debug!("{} connection open", conn.shared.role);

        conn.shared.handler.on_open(&conn).await;

        loop {
            let next = tokio::select! {
                biased;
                _ = conn.shared.shutdown.cancelled() => break,
                _ = cancel.cancelled() => Err(WebSocketError::Cancelled),
                next = self.next_frame() => next,
            };

            // cancellation also interrupts handling, which may wait on a stalled write
            let res = match next {
                Ok(frame) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(WebSocketError::Cancelled),
                    res = self.on_frame(frame) => res,
                },
                Err(err) => Err(err),
            };

            match res {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    conn.emit_error(err).await;
                    break;
                }
            }
        }

        conn.shared
            .read_queue
            .shutdown(conn.shared.options.drain)
            .await;
        conn.shared.write_queue.shutdown(QueueDrain::Drain).await;

        #[cfg(feature = "logging")]
        log::debug!("{} connection closed", conn.shared.role);
    }

    /// Reads the next frame within the read timeout.
    async fn next_frame(&mut self) -> Result<Frame> {
        let next = match self.conn.shared.options.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.frames.next())
                .await
                .map_err(|_| timed_out("read"))?,
            None => self.frames.next().await,
        };

        next.unwrap_or_else(|| {
            Err(WebSocketError::IoError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed without a close frame",
            )))
        })
    }

    /// Handles one frame. Returns `false` once the read loop must stop.
    async fn on_frame(&mut self, frame: Frame) -> Result<bool> {
        let conn = &self.conn;

        match frame.opcode {
            OpCode::Ping => match conn.shared.ping.as_ref() {
                Some(ping) => ping.on_ping(conn, frame.payload).await,
                None => conn.write_pong(frame.payload).await?,
            },
            OpCode::Pong => {
                if let Some(pong) = conn.shared.pong.as_ref() {
                    pong.on_pong(conn, frame.payload).await;
                }
            }
            OpCode::Close => {
                let negotiation = close::negotiate(&frame.payload, conn.shared.options.check_utf8);
                conn.emit_close(negotiation).await;
                return Ok(false);
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                let Some(message) = self.fragments.push(frame)? else {
                    return Ok(true);
                };
                let message = self.inflate(message)?;

                if self.conn.shared.options.check_utf8
                    && message.opcode == OpCode::Text
                    && !crate::is_utf8(&message.payload)
                {
                    return Err(WebSocketError::InvalidUTF8);
                }

                self.dispatch(message).await?;
            }
        }

        Ok(true)
    }

    fn inflate(&mut self, mut message: Message) -> Result<Message> {
        if message.was_compressed {
            let inflate = self
                .inflate
                .as_mut()
                .ok_or(WebSocketError::CompressionNotSupported)?;
            message.payload =
                inflate.decompress(&message.payload, self.conn.shared.options.max_payload_read)?;
        }
        Ok(message)
    }

    async fn dispatch(&self, message: Message) -> Result<()> {
        if !self.conn.shared.options.read_async {
            self.conn.deliver(message).await;
            return Ok(());
        }

        let conn = self.conn.clone();
        let res = self
            .conn
            .shared
            .read_queue
            .push(async move { conn.deliver(message).await })
            .await;

        #[cfg(feature = "logging")]
        {
            if let Err(WebSocketError::QueueFull) = &res {
                log::warn!("{} read queue is full", self.conn.shared.role);
            }
        }

        res.map_err(queue_error)
    }
}

/// Validates an outbound opcode and payload.
fn outbound(opcode: OpCode, payload: Bytes) -> Result<Outbound> {
    match opcode {
        OpCode::Text | OpCode::Binary => Ok(Outbound::Message { opcode, payload }),
        OpCode::Ping | OpCode::Pong => {
            if payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
            Ok(Outbound::Control(Frame::new(true, opcode, None, payload)))
        }
        OpCode::Close | OpCode::Continuation => Err(WebSocketError::InvalidOpCode(opcode.into())),
    }
}

/// A queue closed under us means the connection is going away.
fn queue_error(err: WebSocketError) -> WebSocketError {
    match err {
        WebSocketError::QueueClosed => WebSocketError::ConnectionClosed,
        other => other,
    }
}

fn timed_out(what: &str) -> WebSocketError {
    WebSocketError::IoError(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{what} timed out"),
    ))
}

/// Cuts `reason` to the longest prefix of at most 123 bytes that ends on a char boundary.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }

    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_reason() {
        assert_eq!(truncate_reason("short"), "short");

        let ascii = "a".repeat(200);
        assert_eq!(truncate_reason(&ascii).len(), 123);

        // 'é' is two bytes; 61 of them end at byte 122, the next one would cross 123
        let accented = "é".repeat(100);
        let cut = truncate_reason(&accented);
        assert_eq!(cut.len(), 122);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_outbound_validation() {
        assert!(matches!(
            outbound(OpCode::Close, Bytes::new()),
            Err(WebSocketError::InvalidOpCode(0x8))
        ));
        assert!(matches!(
            outbound(OpCode::Continuation, Bytes::new()),
            Err(WebSocketError::InvalidOpCode(0x0))
        ));
        assert!(matches!(
            outbound(OpCode::Ping, Bytes::from(vec![0; 126])),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
        assert!(matches!(
            outbound(OpCode::Pong, Bytes::from(vec![0; 125])),
            Ok(Outbound::Control(_))
        ));
        assert!(matches!(
            outbound(OpCode::Text, Bytes::from("hi")),
            Ok(Outbound::Message { .. })
        ));
    }

    #[test]
    fn test_role() {
        assert_eq!(Role::Server.peer(), Role::Client);
        assert!(Role::Client.masks());
        assert!(!Role::Server.masks());
        assert_eq!(Role::Client.to_string(), "client");
    }
}
