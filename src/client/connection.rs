// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    time::{Instant, timeout},
};
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::{
        config::{Config, ServerAddr},
        enums::ProtocolVersion,
    },
    client::{
        buffer::{ReadBuffer, WriteBuffer},
        tls,
    },
    events::{DisconnectReason, Event, EventBus},
    models::{
        command::Command,
        error::{ClientError, DecodeError, DecodeKind, ErrorKind, ServerError},
        value::Value,
    },
    topology::dns,
};

/// Addresses this process has successfully connected to at least once,
/// so `Connected { first_time }` can distinguish reconnects.
static SEEN_ADDRS: Lazy<DashMap<String, ()>> = Lazy::new(DashMap::new);

/// The byte stream under a connection.
#[derive(Debug)]
pub(crate) enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One live session with a server: transport, buffered I/O, the
/// negotiated protocol state and the out-of-band push queue.
///
/// A connection is owned by one task at a time. Commands are written
/// and their replies read strictly in order; push frames that
/// interleave with replies are parked in [`Connection::pushes`] so
/// call/return pairing is never disturbed.
#[derive(Debug)]
pub struct Connection {
    pub(crate) transport: Transport,
    pub(crate) rbuf: ReadBuffer,
    pub(crate) wbuf: WriteBuffer,
    pub(crate) cfg: Arc<Config>,
    addr: ServerAddr,
    pub(crate) protocol: ProtocolVersion,
    authenticated: bool,
    name: Option<String>,
    database: u32,
    pub(crate) subscribed: bool,
    pub(crate) pushes: VecDeque<Vec<Value>>,
    last_activity: Instant,
    created_pid: u32,
    pub(crate) events: EventBus,
    pub(crate) cancel: CancellationToken,
    open: bool,
}

impl Connection {
    /// Connects to the first reachable configured address.
    pub async fn connect(cfg: Arc<Config>, events: EventBus) -> Result<Self, ClientError> {
        let mut last = None;
        for addr in cfg.address.clone() {
            match Self::connect_to(Arc::clone(&cfg), &addr, events.clone()).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!("connect to {addr} failed: {e}");
                    last = Some(e);
                },
            }
        }
        Err(last.unwrap_or_else(|| ClientError::Config("empty address list".into())))
    }

    /// Establishes the transport and performs the handshake against
    /// one concrete endpoint.
    pub async fn connect_to(
        cfg: Arc<Config>,
        addr: &ServerAddr,
        events: EventBus,
    ) -> Result<Self, ClientError> {
        events.emit(Event::Connecting {
            addr: addr.to_string(),
        });

        let transport = dial(&cfg, addr).await?;
        let mut conn = Self {
            transport,
            rbuf: ReadBuffer::new(),
            wbuf: WriteBuffer::new(),
            protocol: cfg.protocol_version,
            authenticated: false,
            name: cfg.client_name.clone(),
            database: cfg.database_index,
            subscribed: false,
            pushes: VecDeque::new(),
            last_activity: Instant::now(),
            created_pid: std::process::id(),
            addr: addr.clone(),
            events,
            cancel: CancellationToken::new(),
            cfg,
            open: true,
        };

        if let Err(e) = conn.handshake().await {
            conn.events.emit(Event::HandshakeFailed {
                addr: conn.addr.to_string(),
                error: e.to_string(),
            });
            conn.abort(DisconnectReason::Error);
            return Err(match e {
                e @ ClientError::Handshake(_) => e,
                other => ClientError::Handshake(other.to_string()),
            });
        }

        let first_time = SEEN_ADDRS.insert(conn.addr.to_string(), ()).is_none();
        conn.events.emit(Event::Connected {
            addr: conn.addr.to_string(),
            first_time,
        });
        Ok(conn)
    }

    /// Protocol negotiation, authentication, client-name registration,
    /// database selection and tracking enablement, in that order,
    /// skipping steps whose inputs are absent.
    async fn handshake(&mut self) -> Result<(), ClientError> {
        let deadline = self.cfg.timeout;
        let cfg = Arc::clone(&self.cfg);
        let auth = cfg.auth_pair();

        if self.cfg.protocol_version == ProtocolVersion::Resp3 {
            // Decode the HELLO reply with the v3 grammar; an error
            // reply is legal under both grammars.
            self.protocol = ProtocolVersion::Resp3;
            let hello = Command::hello(ProtocolVersion::Resp3, auth);
            match self.exchange(&hello, deadline).await {
                Ok(reply) => {
                    if let Some(proto) =
                        reply.lookup(b"proto").and_then(Value::as_int)
                        && proto != 3
                    {
                        return Err(ClientError::Handshake(format!(
                            "server negotiated protocol {proto}, expected 3"
                        )));
                    }
                    self.authenticated = auth.is_some();
                },
                Err(ClientError::Server(e)) if hello_unsupported(&e) => {
                    debug!("HELLO rejected ({e}); falling back to protocol 2");
                    self.protocol = ProtocolVersion::Resp2;
                    self.legacy_auth(deadline).await?;
                },
                Err(e) => return Err(e),
            }
        } else {
            self.protocol = ProtocolVersion::Resp2;
            self.legacy_auth(deadline).await?;
        }

        if let Some(name) = self.name.clone() {
            let reply = self.exchange(&Command::client_setname(&name), deadline).await?;
            expect_ok(&reply, "CLIENT SETNAME")?;
        }

        if self.database != 0 {
            let reply = self.exchange(&Command::select(self.database), deadline).await?;
            expect_ok(&reply, "SELECT")?;
        }

        if let Some(tracking) = &self.cfg.tracking
            && self.protocol == ProtocolVersion::Resp3
        {
            let cmd = Command::client_tracking(tracking.mode, &tracking.prefixes);
            let reply = self.exchange(&cmd, deadline).await?;
            expect_ok(&reply, "CLIENT TRACKING")?;
        }

        Ok(())
    }

    async fn legacy_auth(&mut self, deadline: Duration) -> Result<(), ClientError> {
        let Some(password) = self.cfg.password.clone() else {
            return Ok(());
        };
        let cmd = Command::auth(self.cfg.username.as_deref(), &password);
        let reply = self.exchange(&cmd, deadline).await?;
        expect_ok(&reply, "AUTH")?;
        self.authenticated = true;
        Ok(())
    }

    /// Write one command and read its reply; an error frame surfaces
    /// as `Err(Server)`. Handshake building block.
    async fn exchange(
        &mut self,
        cmd: &Command,
        deadline: Duration,
    ) -> Result<Value, ClientError> {
        self.wbuf.push_command(cmd);
        self.flush(deadline).await?;
        match self.await_reply(deadline).await? {
            Value::Error(e) => Err(ClientError::Server(e)),
            v => Ok(v),
        }
    }

    /// Writes a single command frame and returns the next non-push
    /// reply with the default deadline.
    pub async fn call(&mut self, cmd: &Command) -> Result<Value, ClientError> {
        self.call_with_timeout(cmd, self.cfg.timeout).await
    }

    /// Like [`Connection::call`] with a caller-supplied deadline; the
    /// entry point for blocking commands, which hold the connection
    /// exclusively for the whole wait.
    pub async fn call_with_timeout(
        &mut self,
        cmd: &Command,
        deadline: Duration,
    ) -> Result<Value, ClientError> {
        match self.call_raw(cmd, deadline).await? {
            Value::Error(e) => Err(ClientError::Server(e)),
            v => Ok(v),
        }
    }

    /// Single round-trip returning error frames as values, which the
    /// transaction layer needs to see unconverted.
    pub(crate) async fn call_raw(
        &mut self,
        cmd: &Command,
        deadline: Duration,
    ) -> Result<Value, ClientError> {
        self.ensure_usable().await?;
        if self.subscribed && !subscription_command(cmd.name()) {
            return Err(ClientError::SubscribedMode);
        }
        self.wbuf.push_command(cmd);
        self.flush(deadline).await?;
        self.await_reply(deadline).await
    }

    /// Reads a command reply. Once the write is out, a reply that
    /// never arrives leaves the connection ambiguous (the late reply
    /// would answer the wrong command on reuse), so a timeout here
    /// closes it.
    async fn await_reply(&mut self, deadline: Duration) -> Result<Value, ClientError> {
        match self.read_reply(deadline).await {
            Ok(v) => Ok(v),
            Err(e) => {
                if matches!(e, ClientError::Timeout(_)) {
                    self.abort(DisconnectReason::Timeout);
                }
                Err(e)
            },
        }
    }

    /// Writes every command as one transport write, then reads exactly
    /// as many non-push replies, in order. A per-command error reply
    /// occupies its slot; it never aborts the rest of the batch.
    pub async fn call_pipeline(
        &mut self,
        cmds: &[Command],
        deadline: Duration,
    ) -> Result<Vec<Result<Value, ServerError>>, ClientError> {
        self.ensure_usable().await?;
        if self.subscribed {
            return Err(ClientError::SubscribedMode);
        }
        for cmd in cmds {
            self.wbuf.push_command(cmd);
        }
        self.flush(deadline).await?;

        let mut replies = Vec::with_capacity(cmds.len());
        for _ in cmds {
            let reply = self.await_reply(deadline).await?;
            replies.push(match reply {
                Value::Error(e) => Err(e),
                v => Ok(v),
            });
        }
        Ok(replies)
    }

    /// Pops a pending push frame or reads one from the wire.
    pub async fn read_push(
        &mut self,
        deadline: Duration,
    ) -> Result<Vec<Value>, ClientError> {
        if let Some(push) = self.pushes.pop_front() {
            return Ok(push);
        }
        loop {
            let value = self.read_value(deadline).await?;
            match self.classify_inbound(value) {
                Ok(push) => return Ok(push),
                Err(other) => {
                    warn!("dropping unexpected frame while waiting for push: {other}");
                },
            }
        }
    }

    /// Pending push frames received while reading command replies.
    pub fn take_pending_pushes(&mut self) -> Vec<Vec<Value>> {
        self.pushes.drain(..).collect()
    }

    /// Routes every frame the transport already delivered into the
    /// push queue, without waiting for more. Invalidations that landed
    /// while the connection sat idle become visible here; the tracking
    /// cache runs this before trusting a hit.
    pub async fn drain_ready_pushes(&mut self) -> Result<(), ClientError> {
        if !self.open {
            return Err(ClientError::ConnectionClosed);
        }
        loop {
            match self.rbuf.try_decode(self.protocol) {
                Ok(Some(value)) => match self.classify_inbound(value) {
                    Ok(push) => self.pushes.push_back(push),
                    Err(other) => {
                        warn!("dropping unexpected idle frame: {other}");
                    },
                },
                Ok(None) => {
                    match self.rbuf.fill_ready(&mut self.transport).await {
                        Ok(0) => return Ok(()),
                        Ok(_) => {},
                        Err(e) => {
                            self.abort(DisconnectReason::Error);
                            return Err(e);
                        },
                    }
                },
                Err(e) => {
                    self.abort(DisconnectReason::Error);
                    return Err(ClientError::Decode(e));
                },
            }
        }
    }

    /// Round-trips a `PING` and reports the latency to the event bus.
    pub async fn ping(&mut self) -> Result<Duration, ClientError> {
        let start = Instant::now();
        match self.call(&Command::ping()).await {
            Ok(_) => {
                let latency = start.elapsed();
                self.events.emit(Event::HealthCheck { ok: true, latency });
                Ok(latency)
            },
            Err(e) => {
                self.events.emit(Event::HealthCheck {
                    ok: false,
                    latency: start.elapsed(),
                });
                Err(e)
            },
        }
    }

    /// Flushes what it can, sends FIN and reports the disconnect.
    pub async fn close(&mut self, reason: DisconnectReason) {
        if !self.open {
            return;
        }
        self.open = false;
        let deadline = self.cfg.timeout;
        let cancel = self.cancel.clone();
        let _ = self
            .wbuf
            .flush(&mut self.transport, deadline, &cancel)
            .await;
        let _ = self.transport.shutdown().await;
        self.cancel.cancel();
        self.events.emit(Event::Disconnected {
            addr: self.addr.to_string(),
            reason,
        });
    }

    /// Immediate teardown on a failure path; dropping the transport
    /// closes the socket without a clean FIN.
    pub(crate) fn abort(&mut self, reason: DisconnectReason) {
        if !self.open {
            return;
        }
        self.open = false;
        self.wbuf.clear();
        self.cancel.cancel();
        self.events.emit(Event::Disconnected {
            addr: self.addr.to_string(),
            reason,
        });
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Fresh connect to the same endpoint, replacing this session.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        let fresh =
            Self::connect_to(Arc::clone(&self.cfg), &self.addr, self.events.clone())
                .await?;
        *self = fresh;
        Ok(())
    }

    /// Closed connections and connections inherited across a fork are
    /// unusable; forked ones reconnect transparently on first use.
    async fn ensure_usable(&mut self) -> Result<(), ClientError> {
        if !self.open {
            return Err(ClientError::ConnectionClosed);
        }
        if std::process::id() != self.created_pid {
            self.events.emit(Event::MarkedForReconnect {
                addr: self.addr.to_string(),
            });
            self.abort(DisconnectReason::ForkDetected);
            self.reconnect().await?;
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self, deadline: Duration) -> Result<(), ClientError> {
        let cancel = self.cancel.clone();
        match self.wbuf.flush(&mut self.transport, deadline, &cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort(disconnect_reason(&e));
                Err(e)
            },
        }
    }

    /// Next non-push frame; interleaved pushes go to the side queue.
    pub(crate) async fn read_reply(
        &mut self,
        deadline: Duration,
    ) -> Result<Value, ClientError> {
        loop {
            let value = self.read_value(deadline).await?;
            match self.classify_inbound(value) {
                Ok(push) => self.pushes.push_back(push),
                Err(reply) => return Ok(reply),
            }
        }
    }

    /// Decodes one frame, filling from the transport as needed. Decode
    /// failures are fatal: the connection closes and is never reused.
    pub(crate) async fn read_value(
        &mut self,
        deadline: Duration,
    ) -> Result<Value, ClientError> {
        loop {
            match self.rbuf.try_decode(self.protocol) {
                Ok(Some(value)) => {
                    self.last_activity = Instant::now();
                    return Ok(value);
                },
                Ok(None) => {},
                Err(e) => {
                    self.abort(DisconnectReason::Error);
                    return Err(ClientError::Decode(e));
                },
            }

            let cancel = self.cancel.clone();
            match self
                .rbuf
                .fill(&mut self.transport, 1, deadline, &cancel)
                .await
            {
                Ok(()) => {},
                Err(ClientError::ClosedByPeer) if !self.rbuf.is_empty() => {
                    // Truncated mid-frame: a codec-level failure, not a
                    // clean close.
                    let at_offset = self.rbuf.peek().len();
                    self.abort(DisconnectReason::Error);
                    return Err(ClientError::Decode(DecodeError {
                        kind: DecodeKind::UnexpectedEof,
                        at_offset,
                    }));
                },
                // The buffer keeps any partial frame, so a timeout is
                // resumable here; whether it dooms the connection is
                // the caller's call (a command reply left half-read
                // is ambiguous, an idle push wait is not).
                Err(e @ ClientError::Timeout(_)) => return Err(e),
                Err(e) => {
                    self.abort(DisconnectReason::Error);
                    return Err(e);
                },
            }
        }
    }

    /// Separates out-of-band frames from replies. Version-2 servers
    /// have no push type; in subscription mode their delivery arrays
    /// are recognized by the leading kind token.
    pub(crate) fn classify_inbound(&self, value: Value) -> Result<Vec<Value>, Value> {
        match value {
            Value::Push(items) => Ok(items),
            Value::Array(items)
                if self.subscribed
                    && self.protocol == ProtocolVersion::Resp2
                    && items
                        .first()
                        .and_then(Value::as_bytes)
                        .is_some_and(push_kind_token) =>
            {
                Ok(items)
            },
            other => Err(other),
        }
    }
}

/// Establishes the raw byte stream, walking resolved addresses in the
/// strategy order and advancing on connect failure.
async fn dial(cfg: &Config, addr: &ServerAddr) -> Result<Transport, ClientError> {
    match addr {
        ServerAddr::Tcp { host, port } => {
            let sockets = dns::resolve(host, *port, cfg.dns_strategy).await?;
            let mut last: Option<String> = None;
            for socket in sockets {
                match timeout(cfg.timeout, TcpStream::connect(socket)).await {
                    Ok(Ok(stream)) => {
                        stream.set_nodelay(true)?;
                        return match &cfg.tls {
                            Some(tls_cfg) => {
                                let connector = tls::build_connector(tls_cfg)?;
                                let name = tls::server_name(host)?;
                                match timeout(cfg.timeout, connector.connect(name, stream))
                                    .await
                                {
                                    Ok(Ok(stream)) => {
                                        Ok(Transport::Tls(Box::new(stream)))
                                    },
                                    Ok(Err(e)) => Err(ClientError::Connect {
                                        addr: addr.to_string(),
                                        reason: format!("TLS handshake: {e}"),
                                    }),
                                    Err(_) => Err(ClientError::Connect {
                                        addr: addr.to_string(),
                                        reason: "TLS handshake timed out".into(),
                                    }),
                                }
                            },
                            None => Ok(Transport::Tcp(stream)),
                        };
                    },
                    Ok(Err(e)) => last = Some(e.to_string()),
                    Err(_) => last = Some("connect timed out".into()),
                }
            }
            Err(ClientError::Connect {
                addr: addr.to_string(),
                reason: last.unwrap_or_else(|| "no addresses resolved".into()),
            })
        },
        #[cfg(unix)]
        ServerAddr::Unix { path } => {
            match timeout(cfg.timeout, tokio::net::UnixStream::connect(path)).await {
                Ok(Ok(stream)) => Ok(Transport::Unix(stream)),
                Ok(Err(e)) => Err(ClientError::Connect {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(ClientError::Connect {
                    addr: addr.to_string(),
                    reason: "connect timed out".into(),
                }),
            }
        },
        #[cfg(not(unix))]
        ServerAddr::Unix { .. } => Err(ClientError::Config(
            "unix sockets are not supported on this platform".into(),
        )),
    }
}

fn disconnect_reason(e: &ClientError) -> DisconnectReason {
    match e {
        ClientError::Timeout(_) => DisconnectReason::Timeout,
        _ => DisconnectReason::Error,
    }
}

/// Servers without `HELLO` answer with an unknown-command error;
/// servers that know it but not the requested version say `NOPROTO`.
fn hello_unsupported(e: &ServerError) -> bool {
    if e.kind() == ErrorKind::NoProto {
        return true;
    }
    let msg = e.message.to_ascii_lowercase();
    msg.contains("unknown command") || msg.contains("wrong number of arguments")
}

fn expect_ok(reply: &Value, step: &str) -> Result<(), ClientError> {
    if reply.is_status("OK") {
        Ok(())
    } else {
        Err(ClientError::Handshake(format!(
            "{step} returned unexpected reply {reply}"
        )))
    }
}

/// The allowlist enforced while a connection is in subscription mode.
fn subscription_command(name: &[u8]) -> bool {
    matches!(
        name,
        b"SUBSCRIBE"
            | b"UNSUBSCRIBE"
            | b"PSUBSCRIBE"
            | b"PUNSUBSCRIBE"
            | b"SSUBSCRIBE"
            | b"SUNSUBSCRIBE"
            | b"PING"
    )
}

/// First-element tokens that mark a version-2 array as out-of-band.
fn push_kind_token(token: &[u8]) -> bool {
    matches!(
        token,
        b"message"
            | b"pmessage"
            | b"smessage"
            | b"subscribe"
            | b"unsubscribe"
            | b"psubscribe"
            | b"punsubscribe"
            | b"ssubscribe"
            | b"sunsubscribe"
            | b"invalidate"
    )
}
