//! Socket layer: handshake, command intake and status push.
//!
//! Three TCP listeners bound to the client IP: CONN accepts the server's
//! handshake, DATA receives newline-delimited command envelopes (from the
//! server and from the client's own loop connection), STATUS lets the server
//! attach as a reader for pushed status envelopes. All payloads are JSON
//! lines, hex-encoded AEAD ciphertext when data encryption is on.
//!
//! Threads poll the shared shutdown flag; `stop` unblocks them by shutting
//! the sockets down, so nothing is joined.

use anyhow::{Context, Result};
use log::{debug, error, info};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::crypto::TransportCipher;
use crate::handler::Handler;
use crate::protocol::{Envelope, CMD_CONN_NEW, CMD_RESTART, DATA_KEY_CONN, DATA_KEY_SELF};
use crate::worker::SharedState;

const CONN_BUFFER_SIZE: usize = 1024;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CONN_RETRY: Duration = Duration::from_secs(2);
const SEND_BACKOFF: Duration = Duration::from_secs(1);
const DISPATCH_POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct SocketConfig {
    pub bind_ip: String,
    pub conn_port: u16,
    pub data_port: u16,
    pub status_port: u16,
    pub pull_wait: bool,
    pub pull_linger: bool,
    pub push_wait: bool,
    pub push_linger: bool,
}

/// In-memory queue between the data readers and the dispatch thread.
/// `conflate` keeps only the newest undispatched message, mirroring a
/// no-wait receive socket; without it messages queue in arrival order.
pub(crate) struct Mailbox {
    queue: Mutex<VecDeque<String>>,
    ready: Condvar,
    conflate: bool,
}

impl Mailbox {
    pub(crate) fn new(conflate: bool) -> Self {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            conflate,
        }
    }

    pub(crate) fn push(&self, line: String) {
        if let Ok(mut queue) = self.queue.lock() {
            if self.conflate {
                queue.clear();
            }
            queue.push_back(line);
            self.ready.notify_one();
        }
    }

    /// Put a popped message back at the front, keeping its place in line.
    pub(crate) fn requeue(&self, line: String) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_front(line);
            self.ready.notify_one();
        }
    }

    pub(crate) fn pop_timeout(&self, timeout: Duration) -> Option<String> {
        let mut queue = self.queue.lock().ok()?;
        if let Some(line) = queue.pop_front() {
            return Some(line);
        }
        let (mut queue, _) = self.ready.wait_timeout(queue, timeout).ok()?;
        queue.pop_front()
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}

/// Outbound status side: one attached reader peer plus pending lines.
/// Without a peer, `wait` queues everything for the next attach; otherwise
/// only the newest line is kept.
struct StatusChannel {
    wait: bool,
    peer: Option<TcpStream>,
    pending: VecDeque<String>,
}

impl StatusChannel {
    fn new(wait: bool) -> Self {
        StatusChannel {
            wait,
            peer: None,
            pending: VecDeque::new(),
        }
    }

    fn attach(&mut self, stream: TcpStream) {
        if let Some(old) = self.peer.take() {
            let _ = old.shutdown(Shutdown::Both);
        }
        self.peer = Some(stream);
        while let Some(line) = self.pending.pop_front() {
            if self.write_to_peer(&line) {
                break;
            }
        }
    }

    /// Returns true when a send failed and the caller should back off.
    fn send(&mut self, line: &str) -> bool {
        if self.peer.is_some() {
            self.write_to_peer(line)
        } else {
            if !self.wait {
                self.pending.clear();
            }
            self.pending.push_back(line.to_string());
            false
        }
    }

    fn write_to_peer(&mut self, line: &str) -> bool {
        let Some(peer) = self.peer.as_mut() else {
            return false;
        };
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        match peer.write_all(&bytes) {
            Ok(()) => false,
            Err(e) => {
                error!("Data send error: {}", e);
                self.drop_peer();
                true
            }
        }
    }

    fn drop_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            let _ = peer.shutdown(Shutdown::Both);
        }
    }

    fn close(&mut self, flush: bool) {
        if flush && self.peer.is_some() {
            while let Some(line) = self.pending.pop_front() {
                if self.write_to_peer(&line) {
                    break;
                }
            }
        }
        self.pending.clear();
        self.drop_peer();
    }
}

#[derive(Default)]
struct BoundAddrs {
    conn: Option<SocketAddr>,
    data: Option<SocketAddr>,
    status: Option<SocketAddr>,
}

pub struct Sockets {
    cfg: SocketConfig,
    hostname: String,
    cipher: Option<TransportCipher>,
    state: Arc<SharedState>,
    inbox: Arc<Mailbox>,
    data_peers: Mutex<Vec<TcpStream>>,
    status: Mutex<StatusChannel>,
    loop_tx: Mutex<Option<TcpStream>>,
    bound: Mutex<BoundAddrs>,
}

impl Sockets {
    pub fn new(
        cfg: SocketConfig,
        hostname: String,
        cipher: Option<TransportCipher>,
        state: Arc<SharedState>,
    ) -> Arc<Self> {
        let inbox = Arc::new(Mailbox::new(!cfg.pull_wait));
        let status = Mutex::new(StatusChannel::new(cfg.push_wait));
        Arc::new(Sockets {
            cfg,
            hostname,
            cipher,
            state,
            inbox,
            data_peers: Mutex::new(Vec::new()),
            status,
            loop_tx: Mutex::new(None),
            bound: Mutex::new(BoundAddrs::default()),
        })
    }

    /// Bind all three listeners and spawn the socket threads. Bind failures
    /// here are startup errors; later listener errors are recovered inside
    /// the threads.
    pub fn start(self: &Arc<Self>, handler: Arc<Handler>) -> Result<()> {
        let conn = self.bind(self.cfg.conn_port)?;
        let data = self.bind(self.cfg.data_port)?;
        let status = self.bind(self.cfg.status_port)?;
        if let Ok(mut bound) = self.bound.lock() {
            bound.conn = conn.local_addr().ok();
            bound.data = data.local_addr().ok();
            bound.status = status.local_addr().ok();
        }

        let sockets = self.clone();
        let conn_handler = handler.clone();
        thread::spawn(move || sockets.run_conn(conn, conn_handler));

        let sockets = self.clone();
        thread::spawn(move || sockets.run_data_accept(data));

        let sockets = self.clone();
        thread::spawn(move || sockets.run_status_accept(status));

        let sockets = self.clone();
        thread::spawn(move || sockets.run_dispatch(handler));

        // attach the loop connection so self messages flow from the start
        self.ensure_loop_socket();
        Ok(())
    }

    fn bind(&self, port: u16) -> Result<TcpListener> {
        let addr = format!("{}:{}", bind_ip(&self.cfg.bind_ip), port);
        let listener =
            TcpListener::bind(&addr).with_context(|| format!("failed to bind {}", addr))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Handshake listener. One peer at a time: read a single buffer, and if
    /// it is the NEW announcement record the server IP, reply ACCEPT on the
    /// same connection and schedule a socket restart via the loop socket.
    fn run_conn(self: Arc<Self>, listener: TcpListener, handler: Arc<Handler>) {
        info!(
            "Connection socket thread started on port {}. Listening for connection...",
            self.cfg.conn_port
        );
        let mut listener = listener;
        loop {
            if self.state.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.handle_conn_peer(stream, peer.ip().to_string(), &handler) {
                        debug!("Connection attempt dropped: {}", e);
                    }
                    thread::sleep(CONN_RETRY);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    error!("Connection socket error: {}", e);
                    drop(listener);
                    listener = loop {
                        thread::sleep(CONN_RETRY);
                        if self.state.shutdown.load(Ordering::SeqCst) {
                            return;
                        }
                        match self.bind(self.cfg.conn_port) {
                            Ok(l) => {
                                if let Ok(mut bound) = self.bound.lock() {
                                    bound.conn = l.local_addr().ok();
                                }
                                break l;
                            }
                            Err(e) => error!("Connection socket rebind failed: {}", e),
                        }
                    };
                }
            }
        }
    }

    fn handle_conn_peer(
        &self,
        mut stream: TcpStream,
        peer_ip: String,
        handler: &Arc<Handler>,
    ) -> Result<()> {
        stream.set_read_timeout(Some(Duration::from_secs(2)))?;
        let mut buffer = [0u8; CONN_BUFFER_SIZE];
        let n = stream.read(&mut buffer).context("handshake read failed")?;
        let raw = String::from_utf8_lossy(&buffer[..n]);
        let env = self.decode_line(raw.trim())?;
        if env.k != DATA_KEY_CONN || env.v != CMD_CONN_NEW {
            anyhow::bail!("unexpected handshake message: {}", env.k);
        }

        info!("Server connection from {}", peer_ip);
        self.state.set_server_ip(Some(peer_ip));

        let reply = self.encode_line(&Envelope::accept(&self.hostname))?;
        let mut bytes = reply.into_bytes();
        bytes.push(b'\n');
        stream
            .write_all(&bytes)
            .context("handshake reply failed")?;

        handler.handle_conn();
        // no timestamp on the loop restart marker
        self.send_self(&Envelope::new(DATA_KEY_SELF, CMD_RESTART));
        Ok(())
    }

    /// Accepts data peers (the server plus the loop connection) and spawns a
    /// line reader for each.
    fn run_data_accept(self: Arc<Self>, listener: TcpListener) {
        info!(
            "Data (PULL) socket thread started on port {}. Listening for data...",
            self.cfg.data_port
        );
        loop {
            if self.state.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Data peer attached: {}", peer);
                    if let Ok(clone) = stream.try_clone() {
                        if let Ok(mut peers) = self.data_peers.lock() {
                            peers.push(clone);
                        }
                    }
                    let sockets = self.clone();
                    thread::spawn(move || sockets.run_data_reader(stream));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    error!("Data socket error: {}", e);
                    thread::sleep(SEND_BACKOFF);
                }
            }
        }
    }

    fn run_data_reader(self: Arc<Self>, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let reader = std::io::BufReader::new(stream);
        for line in std::io::BufRead::lines(reader) {
            match line {
                Ok(line) if !line.trim().is_empty() => {
                    debug!("Received raw data via PULL socket: {}", line);
                    self.inbox.push(line);
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        if let (Some(peer), Ok(mut peers)) = (peer, self.data_peers.lock()) {
            peers.retain(|p| p.peer_addr().map(|a| a != peer).unwrap_or(false));
        }
    }

    /// Status reader side: the server attaches and we push envelopes at it.
    fn run_status_accept(self: Arc<Self>, listener: TcpListener) {
        info!(
            "Sender (PUSH) socket started on port {}",
            self.cfg.status_port
        );
        loop {
            if self.state.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Status peer attached: {}", peer);
                    if let Ok(mut channel) = self.status.lock() {
                        channel.attach(stream);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    error!("Status socket error: {}", e);
                    thread::sleep(SEND_BACKOFF);
                }
            }
        }
    }

    /// Pops received lines and hands decoded envelopes to the dispatcher.
    /// Nothing is dispatched until the handshake has recorded a server IP.
    fn run_dispatch(self: Arc<Self>, handler: Arc<Handler>) {
        loop {
            if self.state.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let Some(line) = self.inbox.pop_timeout(DISPATCH_POLL) else {
                continue;
            };
            if self.state.server_ip().is_none() {
                self.inbox.requeue(line);
                thread::sleep(DISPATCH_POLL);
                continue;
            }
            match self.decode_line(&line) {
                Ok(env) => handler.handle(env),
                Err(e) => debug!("Dropping malformed message: {}", e),
            }
        }
        // without pull_linger, commands already queued at stop still run
        if !self.cfg.pull_linger && self.state.server_ip().is_some() {
            while let Some(line) = self.inbox.pop_timeout(Duration::ZERO) {
                match self.decode_line(&line) {
                    Ok(env) => handler.handle(env),
                    Err(e) => debug!("Dropping malformed message: {}", e),
                }
            }
        }
    }

    /// Push one envelope at the attached status reader.
    pub fn send(&self, env: &Envelope) {
        let line = match self.encode_line(env) {
            Ok(line) => line,
            Err(e) => {
                error!("Data encode error: {}", e);
                return;
            }
        };
        debug!("Sending data via PUSH socket: {}", line);
        let backoff = match self.status.lock() {
            Ok(mut channel) => channel.send(&line),
            Err(_) => return,
        };
        if backoff {
            thread::sleep(SEND_BACKOFF);
        }
    }

    /// Inject an envelope into our own data path via the loop connection.
    pub fn send_self(&self, env: &Envelope) {
        let line = match self.encode_line(env) {
            Ok(line) => line,
            Err(e) => {
                error!("Loop encode error: {}", e);
                return;
            }
        };
        debug!("Sending loop data via self PUSH socket: {}", line);
        let failed = {
            let Ok(mut slot) = self.loop_tx.lock() else {
                return;
            };
            if slot.is_none() {
                *slot = self.connect_loop();
            }
            match slot.as_mut() {
                Some(stream) => {
                    let mut bytes = line.into_bytes();
                    bytes.push(b'\n');
                    match stream.write_all(&bytes) {
                        Ok(()) => false,
                        Err(e) => {
                            error!("Loop send error: {}", e);
                            *slot = None;
                            true
                        }
                    }
                }
                None => false,
            }
        };
        if failed {
            thread::sleep(SEND_BACKOFF);
        }
    }

    fn ensure_loop_socket(&self) {
        if let Ok(mut slot) = self.loop_tx.lock() {
            if slot.is_none() {
                *slot = self.connect_loop();
            }
        }
    }

    /// Actual handshake listener address, once bound. Differs from the
    /// configured port when that port is 0.
    pub fn conn_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().ok().and_then(|b| b.conn)
    }

    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().ok().and_then(|b| b.data)
    }

    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().ok().and_then(|b| b.status)
    }

    fn connect_loop(&self) -> Option<TcpStream> {
        let port = self
            .data_addr()
            .map(|a| a.port())
            .unwrap_or(self.cfg.data_port);
        let addr = format!("127.0.0.1:{}", port);
        match TcpStream::connect(&addr) {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!("Loop socket connect failed: {}", e);
                None
            }
        }
    }

    /// Drop every attached peer and all pending state. Listeners keep their
    /// ports; the server re-attaches on its own.
    pub fn restart(&self) {
        if let Ok(mut peers) = self.data_peers.lock() {
            for peer in peers.drain(..) {
                let _ = peer.shutdown(Shutdown::Both);
            }
        }
        self.inbox.clear();
        if let Ok(mut channel) = self.status.lock() {
            channel.close(false);
        }
        if let Ok(mut slot) = self.loop_tx.lock() {
            if let Some(stream) = slot.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        thread::sleep(SEND_BACKOFF);
    }

    /// Signal exit and close everything. With `push_linger` off, pending
    /// status lines are flushed to an attached peer first; with
    /// `pull_linger` on, undispatched input is discarded instead of being
    /// drained by the dispatcher.
    pub fn stop(&self) {
        info!("Stopping all sockets...");
        self.state.shutdown.store(true, Ordering::SeqCst);
        if let Ok(mut channel) = self.status.lock() {
            channel.close(!self.cfg.push_linger);
        }
        if let Ok(mut peers) = self.data_peers.lock() {
            for peer in peers.drain(..) {
                let _ = peer.shutdown(Shutdown::Both);
            }
        }
        if self.cfg.pull_linger {
            self.inbox.clear();
        }
        if let Ok(mut slot) = self.loop_tx.lock() {
            if let Some(stream) = slot.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    fn encode_line(&self, env: &Envelope) -> Result<String> {
        let json = env.to_json()?;
        match &self.cipher {
            Some(cipher) => Ok(hex::encode(cipher.encrypt(json.as_bytes())?)),
            None => Ok(json),
        }
    }

    fn decode_line(&self, line: &str) -> Result<Envelope> {
        match &self.cipher {
            Some(cipher) => {
                let blob = hex::decode(line.trim()).context("payload is not valid hex")?;
                let clear = cipher.decrypt(&blob)?;
                let text =
                    std::str::from_utf8(&clear).context("decrypted payload is not valid UTF-8")?;
                Envelope::from_json(text)
            }
            None => Envelope::from_json(line),
        }
    }
}

pub(crate) fn bind_ip(configured: &str) -> &str {
    match configured {
        "" | "*" => "0.0.0.0",
        other => other,
    }
}
