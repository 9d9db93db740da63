use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;

use crate::config::Settings;
use crate::delivery;
use crate::ratelimiter::RateLimiter;
use crate::route::RouteTable;
use crate::session::{Action, DataOutcome, SessionConfig, SmtpSession};
use crate::tls::CertStore;
use crate::util::sanitize_log_line;

/// Connections on this port handshake TLS before the banner.
const IMPLICIT_TLS_PORT: u16 = 465;
/// RFC 5321 allows 512 octets per command line; leave some slack.
const MAX_COMMAND_LINE: u64 = 1024;
const MAX_DATA_LINE: u64 = 4096;

pub struct Listener {
    inner: TcpListener,
    implicit_tls: bool,
}

impl Listener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

enum LineRead {
    Line,
    Eof,
    TooLong,
}

pub struct Server {
    settings: Settings,
    routes: Arc<RouteTable>,
    tls: Option<TlsAcceptor>,
    limiter: Option<Mutex<RateLimiter>>,
}

impl Server {
    pub fn new(settings: Settings, routes: RouteTable, certs: CertStore) -> Self {
        let certs = Arc::new(certs);
        let tls = certs
            .is_configured()
            .then(|| Arc::clone(&certs).acceptor());
        let limiter = (settings.max_connections_per_minute > 0)
            .then(|| Mutex::new(RateLimiter::new(settings.max_connections_per_minute)));
        Self {
            settings,
            routes: Arc::new(routes),
            tls,
            limiter,
        }
    }

    /// Binds every configured address. Individual failures are logged and
    /// skipped, but at least one listener has to come up. Must run before
    /// privileges are dropped.
    pub async fn bind(&self) -> Result<Vec<Listener>> {
        let mut listeners = Vec::new();
        for addr in &self.settings.bind_addresses {
            match TcpListener::bind(addr).await {
                Ok(inner) => {
                    let implicit_tls = addr.port() == IMPLICIT_TLS_PORT;
                    if implicit_tls && self.tls.is_none() {
                        tracing::warn!(
                            %addr,
                            "implicit-TLS port bound without certificates; \
                             connections on it will be refused"
                        );
                    }
                    let listener = Listener {
                        inner,
                        implicit_tls,
                    };
                    let local = listener.local_addr().unwrap_or(*addr);
                    tracing::info!(addr = %local, implicit_tls, "listening");
                    listeners.push(listener);
                }
                Err(error) => {
                    tracing::error!(%addr, %error, "could not bind address");
                }
            }
        }
        if listeners.is_empty() {
            anyhow::bail!("could not bind any of the configured addresses");
        }
        Ok(listeners)
    }

    pub async fn run(self: Arc<Self>, listeners: Vec<Listener>) -> Result<()> {
        let mut tasks = Vec::new();
        for listener in listeners {
            let server = Arc::clone(&self);
            tasks.push(tokio::spawn(server.accept_loop(listener)));
        }
        for task in tasks {
            task.await.context("listener task panicked")?;
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        loop {
            match listener.inner.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    let implicit_tls = listener.implicit_tls;
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer, implicit_tls).await;
                    });
                }
                Err(error) => {
                    tracing::error!(%error, "could not accept connection");
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, implicit_tls: bool) {
        if let Some(limiter) = &self.limiter {
            if !limiter.lock().await.allow(peer.ip()) {
                tracing::warn!(%peer, "connection rate limit exceeded");
                if !implicit_tls {
                    let mut stream = stream;
                    let _ = stream
                        .write_all(b"421 4.7.0 Too many connections, try again later\r\n")
                        .await;
                }
                return;
            }
        }
        tracing::info!(%peer, implicit_tls, "accepted connection");

        let result = if implicit_tls {
            self.serve_implicit_tls(stream, peer).await
        } else {
            self.serve_plain(stream, peer).await
        };
        match result {
            Ok(()) => tracing::debug!(%peer, "connection closed"),
            Err(error) => tracing::debug!(%peer, %error, "connection ended with error"),
        }
    }

    async fn serve_implicit_tls(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        // No certificates means nothing to handshake with: refuse instead
        // of falling back to plaintext.
        let Some(acceptor) = &self.tls else {
            tracing::warn!(%peer, "refusing implicit-TLS connection: no certificates configured");
            return Ok(());
        };
        let tls_stream = acceptor
            .accept(stream)
            .await
            .context("tls handshake failed")?;
        let sni = tls_stream.get_ref().1.server_name().map(str::to_owned);
        tracing::debug!(%peer, sni = sni.as_deref().unwrap_or("-"), "tls established");
        self.serve_session(tls_stream, peer, true, true).await?;
        Ok(())
    }

    async fn serve_plain(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let Some(tcp) = self.serve_session(stream, peer, false, true).await? else {
            return Ok(());
        };
        // The session requested STARTTLS, which it only offers while TLS
        // is configured.
        let Some(acceptor) = &self.tls else {
            return Ok(());
        };
        let tls_stream = acceptor.accept(tcp).await.context("tls handshake failed")?;
        let sni = tls_stream.get_ref().1.server_name().map(str::to_owned);
        tracing::debug!(%peer, sni = sni.as_deref().unwrap_or("-"), "tls established");
        // The dialogue restarts from a fresh greeting state; no second
        // banner after STARTTLS.
        self.serve_session(tls_stream, peer, true, false).await?;
        Ok(())
    }

    /// Drives one SMTP dialogue over any stream. Returns the raw stream
    /// when the client successfully negotiated STARTTLS so the caller can
    /// run the handshake and start over on the secured stream.
    async fn serve_session<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        tls_active: bool,
        send_banner: bool,
    ) -> Result<Option<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let starttls_available = self.tls.is_some() && !tls_active;
        let mut session = SmtpSession::new(self.session_config(), tls_active, starttls_available);
        let mut io = BufStream::new(stream);

        if send_banner {
            send(&mut io, &session.greeting()).await?;
        }

        let mut line = Vec::new();
        loop {
            let limit = if session.in_data() {
                MAX_DATA_LINE
            } else {
                MAX_COMMAND_LINE
            };
            let read = match tokio::time::timeout(
                self.settings.timeout,
                read_limited_line(&mut io, limit, &mut line),
            )
            .await
            {
                Ok(read) => read?,
                Err(_elapsed) => {
                    tracing::debug!(%peer, "session timed out");
                    send(&mut io, "421 4.4.2 Idle timeout, closing connection\r\n").await?;
                    return Ok(None);
                }
            };
            match read {
                LineRead::Eof => return Ok(None),
                LineRead::TooLong => {
                    tracing::debug!(%peer, "oversized line, aborting session");
                    // Drain what is left of the line so the reply is not
                    // lost to a reset on close.
                    drain_line(&mut io).await.ok();
                    send(&mut io, "500 5.5.2 Line too long, closing connection\r\n").await?;
                    return Ok(None);
                }
                LineRead::Line => {}
            }

            if session.in_data() {
                match session.handle_data_line(&line) {
                    DataOutcome::More => continue,
                    DataOutcome::TooLarge => {
                        tracing::debug!(%peer, "message exceeded the size limit");
                        send(&mut io, "552 5.3.4 Message too big for system\r\n").await?;
                    }
                    DataOutcome::Complete(message) => {
                        tracing::info!(
                            %peer,
                            helo = session.helo().unwrap_or("-"),
                            sender = message.sender.as_deref().unwrap_or("<>"),
                            recipients = message.recipients.len(),
                            bytes = message.body.len(),
                            "received message"
                        );
                        let reply = delivery::deliver_all(&message, &self.routes).await;
                        send(&mut io, &reply).await?;
                    }
                }
            } else {
                let text = String::from_utf8_lossy(&line);
                tracing::trace!(%peer, command = %sanitize_log_line(&text), "received command");
                match session.handle_command(&text, &self.routes) {
                    Action::Reply(reply) | Action::BeginData(reply) => {
                        send(&mut io, &reply).await?;
                    }
                    Action::Close(reply) => {
                        send(&mut io, &reply).await?;
                        return Ok(None);
                    }
                    Action::StartTls(reply) => {
                        send(&mut io, &reply).await?;
                        // Dropping the buffers here also drops any
                        // plaintext the client pipelined ahead of the
                        // handshake.
                        return Ok(Some(io.into_inner()));
                    }
                }
            }
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            hostname: self.settings.hostname.clone(),
            max_message_size: self.settings.max_message_size,
            max_errors: self.settings.max_errors,
        }
    }
}

async fn send<S>(io: &mut BufStream<S>, reply: &str) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(reply.as_bytes()).await?;
    io.flush().await
}

/// Discards the remainder of an oversized line, up to a hard cap.
async fn drain_line<S>(io: &mut BufStream<S>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut scratch = Vec::new();
    for _ in 0..16 {
        scratch.clear();
        let mut bounded = (&mut *io).take(MAX_DATA_LINE);
        let n = bounded.read_until(b'\n', &mut scratch).await?;
        if n == 0 || scratch.last() == Some(&b'\n') {
            break;
        }
    }
    Ok(())
}

/// Reads one line, bounded: a line that does not terminate within
/// `limit` bytes is reported as [`LineRead::TooLong`] instead of growing
/// the buffer at the client's pleasure.
async fn read_limited_line<S>(
    io: &mut BufStream<S>,
    limit: u64,
    line: &mut Vec<u8>,
) -> std::io::Result<LineRead>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    line.clear();
    let mut bounded = (&mut *io).take(limit);
    let n = bounded.read_until(b'\n', line).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if line.last() != Some(&b'\n') {
        // No terminator within the limit: oversized line, or the client
        // closed mid-line.
        return Ok(if n as u64 >= limit {
            LineRead::TooLong
        } else {
            LineRead::Eof
        });
    }
    Ok(LineRead::Line)
}
