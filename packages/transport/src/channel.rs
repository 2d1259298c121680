//! The socket channel: connector, dispatcher, and layered byte I/O
//!
//! A [`Channel`] turns a raw network (or subprocess-tunnel) descriptor into a
//! reliable, ordered, event-driven byte pipe with optional TLS and optional
//! stream compression layered transparently on top. It never blocks: every
//! operation either completes synchronously or registers an interest change
//! with the caller's [`Poller`] and is resumed through [`Channel::on_ready`].

use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tracing::{error, info, warn};

use crate::buffer::ReadBuffer;
use crate::config::ServerConfig;
use crate::error::{Result, TransportError};
use crate::poller::{Interest, Poller, Readiness};
use crate::queue::WriteQueue;
use crate::tls::{Flow, TlsSession};
use crate::zlib::ZlibFilter;

/// Scratch size for staging compressed input before inflating it into the
/// receive buffer.
const INFLATE_STAGING: usize = 8192;

/// Lifecycle state of a channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelState {
    /// No descriptor; the initial and post-`close` state.
    Closed,
    /// A non-blocking connect is in flight for the current candidate address.
    Connecting,
    /// A TLS handshake is in flight.
    TlsHandshake,
    /// Connected; reads and writes flow.
    Ready,
}

/// Callbacks through which the channel reports progress and failures.
///
/// The handler is supplied by the driver on every entry point that can
/// complete or fail synchronously, so the channel itself stays free of
/// self-referential callback storage. Each error surfaces through exactly
/// one of these methods, never more.
pub trait ChannelHandler {
    /// Connect attempt finished; `ok == false` means every candidate address
    /// (or the tunnel) failed and the channel is inert.
    fn on_connect(&mut self, chan: &mut Channel, poller: &mut dyn Poller, ok: bool);

    /// Fresh bytes arrived in the receive buffer.
    fn on_readable(&mut self, chan: &mut Channel, poller: &mut dyn Poller);

    /// The write queue fully drained. Returning `Break` stops the current
    /// dispatch (e.g. because the handler closed the channel).
    fn on_writes_flushed(
        &mut self,
        chan: &mut Channel,
        poller: &mut dyn Poller,
    ) -> ControlFlow<()> {
        let _ = (chan, poller);
        ControlFlow::Continue(())
    }

    /// TLS upgrade finished. On `ok == false` the connection itself is still
    /// intact; closing it is the handler's decision.
    fn on_starttls(&mut self, chan: &mut Channel, poller: &mut dyn Poller, ok: bool) {
        let _ = (chan, poller, ok);
    }

    /// The connection is broken; no further I/O will succeed.
    fn on_broken(&mut self, chan: &mut Channel, poller: &mut dyn Poller, err: &TransportError);
}

struct ResolveState {
    addrs: Vec<SocketAddr>,
    next: usize,
}

enum IoGot {
    Data(usize),
    WouldBlock,
}

/// An asynchronous, non-blocking byte channel to one configured server.
pub struct Channel {
    config: Arc<ServerConfig>,
    sock: Option<Socket>,
    name: Option<String>,
    state: ChannelState,
    resolve: Option<ResolveState>,
    buf: ReadBuffer,
    queue: WriteQueue,
    tls: Option<TlsSession>,
    zlib: Option<ZlibFilter>,
    tunnel: Option<Child>,
}

impl Channel {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Channel {
            config,
            sock: None,
            name: None,
            state: ChannelState::Closed,
            resolve: None,
            buf: ReadBuffer::new(),
            queue: WriteQueue::new(),
            tls: None,
            zlib: None,
            tunnel: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Display name of the current peer, e.g. `host (ip:port)` or
    /// `tunnel 'command'`. Present once naming is resolved.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(|s| s.as_raw_fd())
    }

    fn raw_fd(&self) -> RawFd {
        self.sock.as_ref().map_or(-1, |s| s.as_raw_fd())
    }

    fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "<unnamed>".to_string())
    }

    fn fail(&mut self, err: TransportError, poller: &mut dyn Poller, handler: &mut dyn ChannelHandler) {
        error!("{err}");
        handler.on_broken(self, poller, &err);
    }

    // ---- connector -------------------------------------------------------

    /// Starts connecting. Completion (either way) is reported through
    /// [`ChannelHandler::on_connect`], possibly synchronously.
    pub fn connect(&mut self, poller: &mut dyn Poller, handler: &mut dyn ChannelHandler) {
        if let Some(command) = self.config.tunnel.clone() {
            self.connect_tunnel(&command, poller, handler);
            return;
        }

        let host = self.config.host.clone();
        info!("Resolving {}...", host);
        let addrs: Vec<SocketAddr> =
            match (host.as_str(), self.config.port).to_socket_addrs() {
                Ok(iter) => iter.collect(),
                Err(e) => {
                    error!(
                        "{}",
                        TransportError::Resolve {
                            host,
                            detail: e.to_string(),
                        }
                    );
                    self.connect_bail(poller, handler);
                    return;
                }
            };
        self.resolve = Some(ResolveState { addrs, next: 0 });
        self.connect_next(poller, handler);
    }

    /// Spawns `/bin/sh -c <command>` with both standard streams bound to one
    /// end of a socketpair; the channel speaks to the other end and is
    /// immediately ready.
    fn connect_tunnel(
        &mut self,
        command: &str,
        poller: &mut dyn Poller,
        handler: &mut dyn ChannelHandler,
    ) {
        self.name = Some(format!("tunnel '{command}'"));
        info!("Starting {}...", self.display_name());

        let spawned = Socket::pair(Domain::UNIX, Type::STREAM, None).and_then(|(local, remote)| {
            let remote: OwnedFd = remote.into();
            let stdin = Stdio::from(remote.try_clone()?);
            let stdout = Stdio::from(remote);
            let child = Command::new("/bin/sh")
                .arg("-c")
                .arg(command)
                .stdin(stdin)
                .stdout(stdout)
                .spawn()?;
            local.set_nonblocking(true)?;
            Ok((local, child))
        });
        match spawned {
            Ok((local, child)) => {
                poller.register(local.as_raw_fd());
                self.sock = Some(local);
                self.tunnel = Some(child);
                self.connected(poller, handler);
            }
            Err(e) => {
                error!("Cannot start {}: {}", self.display_name(), e);
                self.connect_bail(poller, handler);
            }
        }
    }

    /// Tries candidate addresses in order until one connects or begins
    /// connecting; exhaustion bails out through the connect callback.
    fn connect_next(&mut self, poller: &mut dyn Poller, handler: &mut dyn ChannelHandler) {
        loop {
            let addr = {
                let resolve = match self.resolve.as_mut() {
                    Some(r) => r,
                    None => return,
                };
                match resolve.addrs.get(resolve.next) {
                    Some(a) => {
                        resolve.next += 1;
                        *a
                    }
                    None => {
                        error!(
                            "{}",
                            TransportError::AddressesExhausted(self.config.host.clone())
                        );
                        self.connect_bail(poller, handler);
                        return;
                    }
                }
            };

            self.name = Some(format!("{} ({})", self.config.host, addr));
            let domain = match addr {
                SocketAddr::V4(_) => Domain::IPV4,
                SocketAddr::V6(_) => Domain::IPV6,
            };
            let sock = match Socket::new(domain, Type::STREAM, None)
                .and_then(|s| s.set_nonblocking(true).map(|()| s))
            {
                Ok(s) => s,
                Err(e) => {
                    error!("Cannot connect to {}: {}", self.display_name(), e);
                    continue;
                }
            };

            info!("Connecting to {}...", self.display_name());
            match sock.connect(&addr.into()) {
                Ok(()) => {
                    poller.register(sock.as_raw_fd());
                    self.sock = Some(sock);
                    self.connected(poller, handler);
                    return;
                }
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                    let fd = sock.as_raw_fd();
                    poller.register(fd);
                    poller.set_interest(fd, Interest::WRITABLE, Interest::READABLE);
                    self.sock = Some(sock);
                    self.state = ChannelState::Connecting;
                    return;
                }
                Err(e) => {
                    error!("Cannot connect to {}: {}", self.display_name(), e);
                    continue;
                }
            }
        }
    }

    /// The in-flight connect for the current address failed; tear the
    /// descriptor down and move to the next candidate.
    fn connect_failed(
        &mut self,
        err: std::io::Error,
        poller: &mut dyn Poller,
        handler: &mut dyn ChannelHandler,
    ) {
        error!("Cannot connect to {}: {}", self.display_name(), err);
        if let Some(sock) = self.sock.take() {
            poller.unregister(sock.as_raw_fd());
        }
        self.name = None;
        self.state = ChannelState::Closed;
        self.connect_next(poller, handler);
    }

    fn connected(&mut self, poller: &mut dyn Poller, handler: &mut dyn ChannelHandler) {
        self.resolve = None;
        poller.set_interest(self.raw_fd(), Interest::READABLE, Interest::WRITABLE);
        self.state = ChannelState::Ready;
        info!("Connected to {}", self.display_name());
        handler.on_connect(self, poller, true);
    }

    fn connect_bail(&mut self, poller: &mut dyn Poller, handler: &mut dyn ChannelHandler) {
        self.resolve = None;
        self.name = None;
        self.state = ChannelState::Closed;
        handler.on_connect(self, poller, false);
    }

    // ---- teardown --------------------------------------------------------

    /// Closes the channel: unregisters and releases the descriptor, discards
    /// the TLS session, the compression filter, and every queued write chunk,
    /// and terminates and reaps a tunnel subprocess. No callbacks fire.
    pub fn close(&mut self, poller: &mut dyn Poller) {
        if let Some(sock) = self.sock.take() {
            poller.unregister(sock.as_raw_fd());
        }
        self.name = None;
        self.state = ChannelState::Closed;
        self.resolve = None;
        self.tls = None;
        self.zlib = None;
        self.reap_tunnel();
        self.queue.clear();
    }

    fn reap_tunnel(&mut self) {
        if let Some(mut child) = self.tunnel.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    // ---- reading ---------------------------------------------------------

    /// Copies up to `out.len()` already-received bytes; never blocks.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.buf.read(out)
    }

    /// Extracts the next received line, `\r\n`/`\n` stripped, if complete.
    pub fn read_line(&mut self) -> Option<&[u8]> {
        self.buf.read_line()
    }

    /// Bytes currently buffered and consumable.
    pub fn available(&self) -> usize {
        self.buf.available()
    }

    /// Pulls whatever the transport has into the receive buffer and reports
    /// it via `on_readable`. A full buffer is a protocol error.
    fn fill(&mut self, poller: &mut dyn Poller, handler: &mut dyn ChannelHandler) {
        if self.buf.free_len() == 0 {
            self.fail(TransportError::BufferFull, poller, handler);
            return;
        }
        let got = if self.zlib.is_some() {
            self.read_compressed(poller)
        } else {
            self.read_plain(poller)
        };
        match got {
            Ok(IoGot::WouldBlock) => {}
            Ok(IoGot::Data(n)) => {
                self.buf.commit(n);
                handler.on_readable(self, poller);
            }
            Err(e) => self.fail(e, poller, handler),
        }
    }

    fn read_plain(&mut self, poller: &mut dyn Poller) -> Result<IoGot> {
        let Some(sock) = self.sock.as_ref() else {
            return Err(TransportError::Closed);
        };
        layer_read(
            sock,
            self.tls.as_mut(),
            self.name.as_deref().unwrap_or("<unnamed>"),
            self.buf.free_tail(),
            poller,
        )
    }

    /// Stages raw (or decrypted) bytes and inflates them into the receive
    /// buffer. Input that does not fit yet is retained and redelivered via
    /// an injected readiness.
    fn read_compressed(&mut self, poller: &mut dyn Poller) -> Result<IoGot> {
        let mut scratch = [0u8; INFLATE_STAGING];
        let pending = self
            .zlib
            .as_mut()
            .map(ZlibFilter::take_pending_in)
            .unwrap_or_default();
        let input: Vec<u8> = if pending.is_empty() {
            let Some(sock) = self.sock.as_ref() else {
                return Err(TransportError::Closed);
            };
            match layer_read(
                sock,
                self.tls.as_mut(),
                self.name.as_deref().unwrap_or("<unnamed>"),
                &mut scratch,
                poller,
            )? {
                IoGot::WouldBlock => return Ok(IoGot::WouldBlock),
                IoGot::Data(n) => scratch[..n].to_vec(),
            }
        } else {
            pending
        };

        let name = self.name.as_deref().unwrap_or("<unnamed>");
        let zlib = match self.zlib.as_mut() {
            Some(z) => z,
            None => return Ok(IoGot::WouldBlock),
        };
        let (consumed, produced) = zlib
            .decompress(&input, self.buf.free_tail())
            .map_err(|detail| TransportError::Compression {
                dir: "Inbound",
                name: name.to_string(),
                detail,
            })?;
        if consumed < input.len() {
            zlib.set_pending_in(input[consumed..].to_vec());
            poller.inject(self.raw_fd(), Readiness::READABLE);
        }
        if produced == 0 {
            return Ok(IoGot::WouldBlock);
        }
        Ok(IoGot::Data(produced))
    }

    // ---- writing ---------------------------------------------------------

    /// Queues or sends `data`, copying it. Bytes are delivered strictly in
    /// call order; a partial send is resumed transparently on the next
    /// write-readiness.
    pub fn write(&mut self, data: &[u8], poller: &mut dyn Poller, handler: &mut dyn ChannelHandler) {
        if !self.queue.is_empty() {
            self.queue.push_copied(data);
            return;
        }
        match self.transport_write(data, poller) {
            Err(e) => self.fail(e, poller, handler),
            Ok(n) if n != data.len() => {
                self.queue.push_copied(data);
                self.queue.set_head_sent(n);
            }
            Ok(_) => {}
        }
    }

    /// Like [`write`](Channel::write) but takes ownership of the buffer,
    /// avoiding the copy.
    pub fn write_owned(
        &mut self,
        data: Vec<u8>,
        poller: &mut dyn Poller,
        handler: &mut dyn ChannelHandler,
    ) {
        if !self.queue.is_empty() {
            self.queue.push_owned(data);
            return;
        }
        match self.transport_write(&data, poller) {
            Err(e) => self.fail(e, poller, handler),
            Ok(n) if n != data.len() => {
                let sent = n;
                self.queue.push_owned(data);
                self.queue.set_head_sent(sent);
            }
            Ok(_) => {}
        }
    }

    /// Chunks queued but not yet fully sent.
    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    /// Flushes queued chunks head-to-tail; stops at the first partial write.
    /// Once the queue empties, re-checks for TLS-buffered plaintext and
    /// fires `on_writes_flushed`.
    fn flush_queue(
        &mut self,
        poller: &mut dyn Poller,
        handler: &mut dyn ChannelHandler,
    ) -> ControlFlow<()> {
        if self.queue.is_empty() {
            return ControlFlow::Continue(());
        }
        while let Some((chunk, sent)) = self.queue.head() {
            let remaining = &chunk[sent..];
            let n = match self.transport_write(remaining, poller) {
                Ok(n) => n,
                Err(e) => {
                    self.fail(e, poller, handler);
                    return ControlFlow::Break(());
                }
            };
            if n != remaining.len() {
                self.queue.advance_head(n);
                return ControlFlow::Continue(());
            }
            self.queue.advance_head(remaining.len());
        }
        if self.tls.as_ref().is_some_and(TlsSession::has_buffered_plaintext) {
            poller.inject(self.raw_fd(), Readiness::READABLE);
        }
        handler.on_writes_flushed(self, poller)
    }

    /// One write through the active layers. Returns the number of caller
    /// bytes accepted; fewer than requested means "retry after readiness".
    fn transport_write(&mut self, buf: &[u8], poller: &mut dyn Poller) -> Result<usize> {
        if self.zlib.is_some() {
            return self.write_compressed(buf, poller);
        }
        self.layer_write(buf, poller)
    }

    /// Compresses and forwards `buf`. Any retained compressed output from an
    /// earlier partial write drains first; only once it is gone is new input
    /// compressed. The caller's bytes always count as fully accepted once
    /// compressed, since compressed output cannot be un-produced.
    fn write_compressed(&mut self, buf: &[u8], poller: &mut dyn Poller) -> Result<usize> {
        let pending = self
            .zlib
            .as_mut()
            .map(ZlibFilter::take_pending_out)
            .unwrap_or_default();
        if !pending.is_empty() {
            match self.layer_write(&pending, poller) {
                Ok(n) if n < pending.len() => {
                    if let Some(z) = self.zlib.as_mut() {
                        z.set_pending_out(pending[n..].to_vec());
                    }
                    return Ok(0);
                }
                Ok(_) => {}
                Err(e) => {
                    if let Some(z) = self.zlib.as_mut() {
                        z.set_pending_out(pending);
                    }
                    return Err(e);
                }
            }
        }

        let name = self.name.as_deref().unwrap_or("<unnamed>");
        let compressed = match self.zlib.as_mut() {
            Some(z) => z.compress(buf).map_err(|detail| TransportError::Compression {
                dir: "Outbound",
                name: name.to_string(),
                detail,
            })?,
            None => return Ok(0),
        };
        let n = self.layer_write(&compressed, poller)?;
        if n < compressed.len() {
            if let Some(z) = self.zlib.as_mut() {
                z.set_pending_out(compressed[n..].to_vec());
            }
        }
        Ok(buf.len())
    }

    /// Drains ciphertext the session buffered across an earlier would-block.
    /// Returns `false` when the connection broke while flushing.
    fn flush_tls_ciphertext(
        &mut self,
        poller: &mut dyn Poller,
        handler: &mut dyn ChannelHandler,
    ) -> bool {
        let step = {
            let (Some(sock), Some(tls)) = (self.sock.as_ref(), self.tls.as_mut()) else {
                return true;
            };
            tls.flush(sock)
        };
        match step {
            Ok(false) => true,
            Ok(true) => {
                poller.set_interest(
                    self.raw_fd(),
                    Interest::READABLE | Interest::WRITABLE,
                    Interest::NONE,
                );
                true
            }
            Err(failure) => {
                let err = TransportError::Tls {
                    op: "write to",
                    name: self.display_name(),
                    detail: failure.to_string(),
                };
                self.fail(err, poller, handler);
                false
            }
        }
    }

    /// Raw or TLS write of `buf`. Would-block and partial writes register
    /// write-interest and report the short count.
    fn layer_write(&mut self, buf: &[u8], poller: &mut dyn Poller) -> Result<usize> {
        let Some(sock) = self.sock.as_ref() else {
            return Err(TransportError::Closed);
        };
        let fd = sock.as_raw_fd();
        if let Some(tls) = self.tls.as_mut() {
            let (n, want_write) =
                tls.write(sock, buf)
                    .map_err(|failure| TransportError::Tls {
                        op: "write to",
                        name: self.name.clone().unwrap_or_default(),
                        detail: failure.to_string(),
                    })?;
            if want_write {
                poller.set_interest(fd, Interest::READABLE | Interest::WRITABLE, Interest::NONE);
            }
            return Ok(n);
        }
        match (&mut &*sock).write(buf) {
            Ok(n) => {
                if n != buf.len() {
                    poller.set_interest(
                        fd,
                        Interest::READABLE | Interest::WRITABLE,
                        Interest::NONE,
                    );
                }
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                poller.set_interest(fd, Interest::READABLE | Interest::WRITABLE, Interest::NONE);
                Ok(0)
            }
            Err(e) => Err(TransportError::Write {
                name: self.name.clone().unwrap_or_default(),
                source: e,
            }),
        }
    }

    // ---- TLS upgrade -----------------------------------------------------

    /// Begins the TLS upgrade. Completion is reported through
    /// [`ChannelHandler::on_starttls`]; a failed upgrade leaves the
    /// connection intact for the handler to dispose of.
    pub fn start_tls(&mut self, poller: &mut dyn Poller, handler: &mut dyn ChannelHandler) {
        crate::tls::init();

        if self.tls.is_some() || self.state != ChannelState::Ready {
            warn!("Ignoring TLS upgrade on {}: already upgraded or not ready", self.display_name());
            handler.on_starttls(self, poller, false);
            return;
        }
        let Some(ctx) = self.config.tls_context() else {
            // Context build failure was already logged, once, at build time.
            handler.on_starttls(self, poller, false);
            return;
        };
        match TlsSession::new(ctx, &self.config.host) {
            Ok(session) => {
                self.tls = Some(session);
                self.state = ChannelState::TlsHandshake;
                self.continue_handshake(poller, handler);
            }
            Err(detail) => {
                error!(
                    "{}",
                    TransportError::Tls {
                        op: "connect to",
                        name: self.display_name(),
                        detail,
                    }
                );
                handler.on_starttls(self, poller, false);
            }
        }
    }

    /// Drives the handshake one step; on completion makes the trust
    /// decision and reports the upgrade result.
    fn continue_handshake(&mut self, poller: &mut dyn Poller, handler: &mut dyn ChannelHandler) {
        let fd = self.raw_fd();
        let step = {
            let (Some(sock), Some(tls)) = (self.sock.as_ref(), self.tls.as_mut()) else {
                return;
            };
            tls.handshake(sock)
        };
        match step {
            Ok(Flow::WantRead) => {}
            Ok(Flow::WantWrite) => {
                poller.set_interest(fd, Interest::READABLE | Interest::WRITABLE, Interest::NONE);
            }
            Ok(Flow::Done) => {
                let verdict = {
                    let name = self.display_name();
                    match self.tls.as_ref() {
                        Some(tls) => tls.verify_peer(&self.config.host, &name),
                        None => return,
                    }
                };
                match verdict {
                    Ok(()) => {
                        info!("Connection is now encrypted");
                        self.state = ChannelState::Ready;
                        handler.on_starttls(self, poller, true);
                    }
                    Err(detail) => {
                        error!("{}", TransportError::CertificateVerification(detail));
                        self.state = ChannelState::Ready;
                        handler.on_starttls(self, poller, false);
                    }
                }
            }
            Err(failure) => {
                error!(
                    "{}",
                    TransportError::Tls {
                        op: "connect to",
                        name: self.display_name(),
                        detail: failure.to_string(),
                    }
                );
                self.state = ChannelState::Ready;
                handler.on_starttls(self, poller, false);
            }
        }
    }

    // ---- compression -----------------------------------------------------

    /// Enables raw-deflate compression in both directions. Idempotent; all
    /// subsequent reads and writes pass through the filter.
    pub fn enable_compression(&mut self) {
        if self.zlib.is_some() {
            return;
        }
        self.zlib = Some(ZlibFilter::new());
    }

    pub fn compression_enabled(&self) -> bool {
        self.zlib.is_some()
    }

    // ---- dispatcher ------------------------------------------------------

    /// Entry point for the external event loop: demultiplexes a readiness
    /// event by connection state and active protocol layer.
    pub fn on_ready(
        &mut self,
        ready: Readiness,
        poller: &mut dyn Poller,
        handler: &mut dyn ChannelHandler,
    ) {
        if ready.is_error() || self.state == ChannelState::Connecting {
            let soerr = match self.sock.as_ref() {
                Some(sock) => sock.take_error().unwrap_or_else(Some),
                None => return,
            };
            if self.state == ChannelState::Connecting {
                match soerr {
                    Some(e) => self.connect_failed(e, poller, handler),
                    None => self.connected(poller, handler),
                }
                return;
            }
            let source =
                soerr.unwrap_or_else(|| std::io::Error::other("unknown socket error"));
            let err = TransportError::Broken {
                name: self.display_name(),
                source,
            };
            self.fail(err, poller, handler);
            return;
        }

        if ready.is_writable() {
            // Write-interest is one-shot: it is re-added only by a
            // subsequent incomplete write or TLS want-write.
            poller.set_interest(self.raw_fd(), Interest::READABLE, Interest::WRITABLE);
        }

        if self.state == ChannelState::TlsHandshake {
            self.continue_handshake(poller, handler);
            return;
        }

        if self.tls.is_some() {
            // Ciphertext held back by an earlier would-block must go out
            // even when the plaintext queue is empty.
            if !self.flush_tls_ciphertext(poller, handler) {
                return;
            }
            if self.flush_queue(poller, handler).is_break() {
                return;
            }
            self.fill(poller, handler);
            return;
        }

        if ready.is_writable() && self.flush_queue(poller, handler).is_break() {
            return;
        }
        if ready.is_readable() {
            self.fill(poller, handler);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reap_tunnel();
    }
}

/// Shared raw-or-TLS read into `out`. When the secure layer fills `out`
/// completely while still holding decrypted bytes, an injected readiness
/// guarantees the remainder is delivered without new socket data.
fn layer_read(
    sock: &Socket,
    tls: Option<&mut TlsSession>,
    name: &str,
    out: &mut [u8],
    poller: &mut dyn Poller,
) -> Result<IoGot> {
    let fd = sock.as_raw_fd();
    if let Some(tls) = tls {
        let got = tls.read(sock, out).map_err(|failure| TransportError::Tls {
            op: "read from",
            name: name.to_string(),
            detail: failure.to_string(),
        })?;
        if got.want_write {
            poller.set_interest(fd, Interest::READABLE | Interest::WRITABLE, Interest::NONE);
        }
        if got.n == out.len() && tls.has_buffered_plaintext() {
            poller.inject(fd, Readiness::READABLE);
        }
        if got.n == 0 {
            return Ok(IoGot::WouldBlock);
        }
        return Ok(IoGot::Data(got.n));
    }
    match (&mut &*sock).read(out) {
        Ok(0) => Err(TransportError::UnexpectedEof(name.to_string())),
        Ok(n) => Ok(IoGot::Data(n)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(IoGot::WouldBlock),
        Err(e) => Err(TransportError::Read {
            name: name.to_string(),
            source: e,
        }),
    }
}
