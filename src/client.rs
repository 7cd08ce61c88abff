//! Per-client forwarding and lifecycle.
//!
//! A [`Client`] binds one [`TunnelAgent`] to HTTP semantics: it checks
//! sockets out of the pool to carry external requests and upgrades, and it
//! reaps itself when the agent stays offline past the grace period.

use std::{pin::pin, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future::{self, Either};
use http::StatusCode;
use n0_error::anyerr;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest},
    net::TcpStream,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    agent::{AgentEvent, AgentEvents, AgentStats, TunnelAgent},
    error::{AgentError, ForwardError, is_transient},
    parse::{BodyFraming, RequestHead, ResponseHead},
    util::{copy_framed_body, forward_bidi, prebuffered::Prebuffered},
};

/// Default window a client may stay offline before it is reaped.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1000);

/// A registered tunnel client: one agent plus the forwarding entry points
/// the external HTTP server calls into.
#[derive(Debug)]
pub struct Client {
    id: String,
    agent: TunnelAgent,
    closed: CancellationToken,
}

impl Client {
    /// Wraps `agent` under the public identifier `id`.
    ///
    /// The grace timer starts armed: a client whose user never dials in is
    /// closed after `grace_period`. It re-arms whenever the agent goes
    /// offline and is cancelled when it comes back online.
    pub fn new(
        id: impl Into<String>,
        agent: TunnelAgent,
        events: AgentEvents,
        grace_period: Duration,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            id: id.into(),
            agent,
            closed: CancellationToken::new(),
        });
        let span = error_span!("client", id = %client.id);
        tokio::spawn(supervise(client.clone(), events, grace_period).instrument(span));
        client
    }

    /// The public identifier this client is registered under.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts the agent's tunnel listener and returns the chosen port.
    pub async fn listen(&self) -> n0_error::Result<u16, AgentError> {
        self.agent.listen().await
    }

    /// Live tunnel socket count, delegated to the agent.
    pub fn stats(&self) -> AgentStats {
        self.agent.stats()
    }

    /// Token that fires exactly once when the client closes.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// True once the client has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Destroys the agent and fires the close notification. Idempotent.
    pub fn close(&self) {
        self.agent.destroy();
        self.closed.cancel();
    }

    /// Forwards one HTTP exchange through a pooled tunnel socket.
    ///
    /// `head` is written to the tunnel verbatim; the upstream response head
    /// comes back verbatim too. `external_recv` supplies the remaining
    /// request body bytes and `external_send` receives the response. Both
    /// bodies are relayed to the end of their HTTP framing, so the exchange
    /// completes (and the tunnel socket's slot is released) even when both
    /// underlying connections stay open. If the tunnel side fails before any
    /// response bytes were relayed, the external caller gets
    /// `502 Bad Gateway`; failures after that terminate the exchange without
    /// a synthesized response.
    pub async fn forward_request<R, W>(
        &self,
        head: &RequestHead,
        external_recv: &mut R,
        external_send: &mut W,
    ) -> Result<(), ForwardError>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let span = error_span!("forward", client = %self.id, method = %head.method, target = %head.target);
        async {
            let tunnel = match self.agent.create_connection().await {
                Ok(tunnel) => tunnel,
                Err(err) => {
                    respond_bad_gateway(external_send).await;
                    return Err(ForwardError::bad_gateway(anyerr!(err)));
                }
            };
            let (tunnel_recv, mut tunnel_send) = tokio::io::split(tunnel);
            let mut tunnel_recv = Prebuffered::new(tunnel_recv, HEADER_SECTION_MAX_LENGTH);

            if let Err(err) = head.write(&mut tunnel_send).await {
                respond_bad_gateway(external_send).await;
                return Err(ForwardError::bad_gateway(err));
            }

            // Both copies are bounded by HTTP message framing, never by
            // socket EOF: the external connection may be keep-alive and the
            // tunnel socket stays open until the exchange is over. The
            // request body runs concurrently with the response relay so an
            // upstream that wants the full body before answering makes
            // progress.
            let request_framing = head.body_framing();
            let request_body = pin!(async {
                let res = copy_framed_body(request_framing, external_recv, &mut tunnel_send).await;
                // End-of-request for origins that read until close.
                tunnel_send.shutdown().await.ok();
                res
            });
            let method = head.method.clone();
            let response_relay = pin!(async {
                match ResponseHead::read(&mut tunnel_recv).await {
                    Ok(response) => {
                        debug!(status = %response.status, "relaying tunnel response");
                        response
                            .write(external_send)
                            .await
                            .map_err(ForwardError::terminated)?;
                        let framing = response.body_framing(&method);
                        let n = copy_framed_body(framing, &mut tunnel_recv, external_send)
                            .await
                            .map_err(ForwardError::terminated)?;
                        if framing == BodyFraming::UntilClose {
                            // Only a close can delimit the body downstream too.
                            external_send.shutdown().await.ok();
                        } else {
                            external_send.flush().await.ok();
                        }
                        Ok(n)
                    }
                    Err(err) => {
                        respond_bad_gateway(external_send).await;
                        Err(ForwardError::bad_gateway(err))
                    }
                }
            });

            // The exchange is over when the response side finishes; the
            // request side finishing first just means the external caller is
            // done sending.
            match future::select(response_relay, request_body).await {
                Either::Left((relayed, _)) => relayed.map(|_| ()),
                Either::Right((_, response_relay)) => response_relay.await.map(|_| ()),
            }
        }
        .instrument(span)
        .await
    }

    /// Forwards an HTTP upgrade (e.g. WebSocket) through a pooled tunnel
    /// socket.
    ///
    /// The request line and headers are re-serialized verbatim and written to
    /// the tunnel after both pipe directions are wired, so the upstream
    /// answer is drained from the first byte. `buffered` carries any bytes
    /// the caller already read past the head. Connection resets and timeouts
    /// on either side end the session silently.
    pub async fn forward_upgrade(
        &self,
        head: &RequestHead,
        mut external: TcpStream,
        buffered: Bytes,
    ) -> Result<(), ForwardError> {
        let span = error_span!("upgrade", client = %self.id, target = %head.target);
        async {
            let tunnel = match self.agent.create_connection().await {
                Ok(tunnel) => tunnel,
                Err(err) => {
                    external.shutdown().await.ok();
                    return Err(ForwardError::bad_gateway(anyerr!(err)));
                }
            };

            // The external socket may have died while the checkout was
            // pending; don't burn a tunnel socket on it.
            let alive = match external
                .ready(Interest::READABLE | Interest::WRITABLE)
                .await
            {
                Ok(ready) => !ready.is_read_closed() && !ready.is_write_closed(),
                Err(_) => false,
            };
            if !alive {
                debug!("external socket gone before upgrade, dropping tunnel socket");
                drop(tunnel);
                external.shutdown().await.ok();
                return Ok(());
            }

            let mut prologue = head.encode();
            prologue.extend_from_slice(&buffered);

            let (external_recv, mut external_send) = external.split();
            let mut external_recv = std::io::Cursor::new(prologue).chain(external_recv);
            let (mut tunnel_recv, mut tunnel_send) = tokio::io::split(tunnel);

            match forward_bidi(
                &mut external_recv,
                &mut external_send,
                &mut tunnel_recv,
                &mut tunnel_send,
            )
            .await
            {
                Ok((to_tunnel, to_external)) => {
                    debug!(to_tunnel, to_external, "upgrade session finished");
                    Ok(())
                }
                Err(err) if is_transient(&err) => {
                    debug!("upgrade session reset: {err}");
                    Ok(())
                }
                Err(err) => {
                    warn!("upgrade session failed: {err}");
                    Err(ForwardError::terminated(err))
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Grace-period and presence supervision for one client.
///
/// Holds the agent's event stream. Timer armed at construction and on every
/// offline transition; disarmed on online; firing closes the client. The
/// task is a plain tokio task and never keeps the process alive on its own.
async fn supervise(client: Arc<Client>, mut events: AgentEvents, grace_period: Duration) {
    let grace = sleep(grace_period);
    tokio::pin!(grace);
    let mut armed = true;
    loop {
        tokio::select! {
            _ = client.closed.cancelled() => break,
            _ = &mut grace, if armed => {
                debug!("grace period elapsed with no tunnel sockets");
                client.close();
                break;
            }
            event = events.recv() => match event {
                Some(AgentEvent::Online) => armed = false,
                Some(AgentEvent::Offline) => {
                    grace.as_mut().reset(Instant::now() + grace_period);
                    armed = true;
                }
                Some(AgentEvent::Error) | Some(AgentEvent::End) | None => {
                    client.close();
                    break;
                }
            }
        }
    }
}

/// Minimal downstream answer when the tunnel side failed before any response
/// bytes were relayed.
async fn respond_bad_gateway(writer: &mut (impl AsyncWrite + Send + Unpin)) {
    let response = ResponseHead::no_body(StatusCode::BAD_GATEWAY);
    if let Err(err) = response.write(writer).await {
        debug!("failed to write 502 to external caller: {err}");
    }
    writer.shutdown().await.ok();
}
