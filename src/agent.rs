//! Per-client tunnel socket pool.
//!
//! A [`TunnelAgent`] owns one TCP listener on an ephemeral port. The remote
//! user dials plain TCP connections to that port; the agent admits up to
//! `max_sockets` of them and lends them out, one HTTP exchange per checkout,
//! to the forwarders in [`crate::client`]. Presence is reported as edge
//! events: `Online` when the first socket connects, `Offline` when the last
//! one goes away.
//!
//! All pool state lives in a single actor task, so socket accept, socket
//! close, and checkout never interleave mid-update. Checkout completions are
//! delivered through a oneshot channel, which resumes the waiting task on a
//! fresh scheduler tick rather than from inside accept processing.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use futures::future::select_all;
use n0_error::{Result, e};
use serde::Serialize;
use tokio::{
    io::{self, AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::error::AgentError;

/// Default cap on concurrently connected tunnel sockets per agent.
pub const DEFAULT_MAX_SOCKETS: usize = 10;

/// Presence and lifecycle notifications emitted by a [`TunnelAgent`].
///
/// `Online` and `Offline` are level transitions at the 0/1 boundary of the
/// connected-socket count; they are never emitted spuriously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// The first tunnel socket connected.
    Online,
    /// The last tunnel socket went away while the agent was still open.
    Offline,
    /// The listener failed; the agent is unusable.
    Error,
    /// The agent was destroyed.
    End,
}

/// Receiving side of an agent's event stream, handed out at construction.
pub type AgentEvents = mpsc::UnboundedReceiver<AgentEvent>;

/// Snapshot of an agent's live socket count.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AgentStats {
    /// Sockets currently admitted and not yet closed, pooled or checked out.
    pub connected_sockets: usize,
}

enum Command {
    Checkout(oneshot::Sender<Result<TunnelStream, AgentError>>),
    Release(u64),
}

/// A tunnel socket checked out of the pool for one HTTP exchange.
///
/// The broker never re-enqueues a used socket; dropping the stream closes the
/// connection and settles the agent's bookkeeping for it exactly once.
#[derive(Debug)]
pub struct TunnelStream {
    stream: TcpStream,
    _guard: SlotGuard,
}

#[derive(Debug)]
struct SlotGuard {
    id: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // After destroy the channel is gone and bookkeeping is moot.
        let _ = self.cmd_tx.send(Command::Release(self.id));
    }
}

impl TunnelStream {
    /// Address of the remote user's end of this socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

/// State the actor takes ownership of when `listen()` starts it.
#[derive(Debug)]
struct ActorSeed {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

/// Per-client pool of tunnel sockets dialed by the remote user.
#[derive(derive_more::Debug)]
pub struct TunnelAgent {
    max_sockets: usize,
    #[debug(skip)]
    cmd_tx: mpsc::UnboundedSender<Command>,
    #[debug(skip)]
    seed: Mutex<Option<ActorSeed>>,
    local_addr: Mutex<Option<SocketAddr>>,
    live: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl TunnelAgent {
    /// Creates an agent capped at `max_sockets` concurrent tunnel sockets.
    ///
    /// The returned [`AgentEvents`] receiver carries the agent's presence
    /// and lifecycle events; the [`crate::client::Client`] consumes it.
    pub fn new(max_sockets: usize) -> (Self, AgentEvents) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let agent = Self {
            max_sockets,
            cmd_tx,
            seed: Mutex::new(Some(ActorSeed {
                cmd_rx,
                events: events_tx,
            })),
            local_addr: Mutex::new(None),
            live: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        };
        (agent, events_rx)
    }

    /// Binds the tunnel listener to an ephemeral port and starts the pool.
    ///
    /// Returns the chosen port. Fails with [`AgentError::AlreadyStarted`] on
    /// a second call and [`AgentError::Closed`] after [`destroy`](Self::destroy).
    pub async fn listen(&self) -> Result<u16, AgentError> {
        let seed = self
            .seed
            .lock()
            .expect("agent seed lock poisoned")
            .take()
            .ok_or_else(|| {
                if self.shutdown.is_cancelled() {
                    e!(AgentError::Closed)
                } else {
                    e!(AgentError::AlreadyStarted)
                }
            })?;
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(|source| e!(AgentError::Bind { source }))?;
        let addr = listener
            .local_addr()
            .map_err(|source| e!(AgentError::Bind { source }))?;
        *self.local_addr.lock().expect("agent addr lock poisoned") = Some(addr);
        debug!(%addr, "tunnel listener bound");

        let actor = Actor {
            listener,
            cmd_tx: self.cmd_tx.clone(),
            cmd_rx: seed.cmd_rx,
            events: seed.events,
            available: VecDeque::new(),
            waiters: VecDeque::new(),
            connected: 0,
            live: self.live.clone(),
            next_id: 0,
            max_sockets: self.max_sockets,
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(
            actor
                .run()
                .instrument(error_span!("tunnel-agent", port = addr.port())),
        );
        Ok(addr.port())
    }

    /// Checks a tunnel socket out of the pool for one HTTP exchange.
    ///
    /// Resolves immediately when an idle socket is available, otherwise waits
    /// in FIFO order for the next accepted one. Fails with
    /// [`AgentError::Closed`] once the agent is destroyed, including for
    /// checkouts that were already waiting.
    pub async fn create_connection(&self) -> Result<TunnelStream, AgentError> {
        if self.shutdown.is_cancelled() {
            return Err(e!(AgentError::Closed));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Checkout(reply_tx))
            .map_err(|_| e!(AgentError::Closed))?;
        reply_rx.await.map_err(|_| e!(AgentError::Closed))?
    }

    /// Current live socket count.
    pub fn stats(&self) -> AgentStats {
        AgentStats {
            connected_sockets: self.live.load(Ordering::Relaxed),
        }
    }

    /// Address the tunnel listener is bound to, once `listen()` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("agent addr lock poisoned")
    }

    /// Closes the listener and tears down all pooled sockets.
    ///
    /// Pending and subsequent [`create_connection`](Self::create_connection)
    /// calls fail with [`AgentError::Closed`]. Idempotent.
    pub fn destroy(&self) {
        self.shutdown.cancel();
        // If listen() never ran there is no actor to drain the queue; drop
        // the seeded receiver so queued checkouts resolve to Closed.
        self.seed.lock().expect("agent seed lock poisoned").take();
    }
}

struct PooledSocket {
    id: u64,
    stream: TcpStream,
}

impl PooledSocket {
    /// Resolves when the peer disqualifies this idle socket: EOF, a socket
    /// error, or bytes arriving outside an exchange (the user side only
    /// writes in response to a broker-written request).
    async fn idle_disqualified(&self) {
        let mut buf = [0u8; 1];
        let _ = self.stream.peek(&mut buf).await;
    }
}

/// Resolves with the pool position of the first idle socket disqualified by
/// its peer. Pending forever while the pool is empty.
async fn closed_idle_socket(available: &VecDeque<PooledSocket>) -> usize {
    if available.is_empty() {
        return std::future::pending().await;
    }
    let watchers = available
        .iter()
        .enumerate()
        .map(|(pos, socket)| {
            Box::pin(async move {
                socket.idle_disqualified().await;
                pos
            })
        })
        .collect::<Vec<_>>();
    let (pos, _, _) = select_all(watchers).await;
    pos
}

struct Actor {
    listener: TcpListener,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<AgentEvent>,
    available: VecDeque<PooledSocket>,
    waiters: VecDeque<oneshot::Sender<Result<TunnelStream, AgentError>>>,
    connected: usize,
    live: Arc<AtomicUsize>,
    next_id: u64,
    max_sockets: usize,
    shutdown: CancellationToken,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(err) => {
                        warn!("tunnel listener failed: {err}");
                        let _ = self.events.send(AgentEvent::Error);
                        break;
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Checkout(reply)) => self.checkout(reply),
                    Some(Command::Release(id)) => self.socket_closed(id),
                    None => break,
                },
                pos = closed_idle_socket(&self.available) => {
                    if let Some(socket) = self.available.remove(pos) {
                        trace!(id = socket.id, "idle tunnel socket closed by peer");
                        self.socket_closed(socket.id);
                    }
                }
            }
        }
        self.teardown();
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.connected >= self.max_sockets {
            debug!(%peer, cap = self.max_sockets, "tunnel socket cap reached, dropping connection");
            return;
        }
        if self.connected == 0 {
            let _ = self.events.send(AgentEvent::Online);
        }
        self.connected += 1;
        self.live.store(self.connected, Ordering::Relaxed);
        let id = self.next_id;
        self.next_id += 1;
        debug!(%peer, id, connected = self.connected, "admitted tunnel socket");
        if let Some(waiter) = self.waiters.pop_front() {
            self.deliver(id, stream, waiter);
        } else {
            self.available.push_back(PooledSocket { id, stream });
        }
    }

    fn checkout(&mut self, reply: oneshot::Sender<Result<TunnelStream, AgentError>>) {
        if let Some(PooledSocket { id, stream }) = self.available.pop_front() {
            self.deliver(id, stream, reply);
        } else {
            self.waiters.push_back(reply);
        }
    }

    fn deliver(
        &self,
        id: u64,
        stream: TcpStream,
        waiter: oneshot::Sender<Result<TunnelStream, AgentError>>,
    ) {
        let tunnel = TunnelStream {
            stream,
            _guard: SlotGuard {
                id,
                cmd_tx: self.cmd_tx.clone(),
            },
        };
        if waiter.send(Ok(tunnel)).is_err() {
            // The caller abandoned its checkout. The rejected TunnelStream
            // just dropped: the socket is closed and its guard has queued the
            // Release we will process next iteration.
            trace!(id, "checkout abandoned, socket dropped");
        }
    }

    fn socket_closed(&mut self, id: u64) {
        if let Some(pos) = self.available.iter().position(|s| s.id == id) {
            self.available.remove(pos);
        }
        self.connected = self.connected.saturating_sub(1);
        self.live.store(self.connected, Ordering::Relaxed);
        trace!(id, connected = self.connected, "tunnel socket closed");
        if self.connected == 0 {
            let _ = self.events.send(AgentEvent::Offline);
        }
    }

    fn teardown(mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(e!(AgentError::Closed)));
        }
        let dropped = self.available.len();
        self.available.clear();
        self.connected = 0;
        self.live.store(0, Ordering::Relaxed);
        debug!(dropped, "tunnel agent closed");
        let _ = self.events.send(AgentEvent::End);
    }
}
