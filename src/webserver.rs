//! HTTP interface for web mode.
//!
//! Serves the MJPEG stream on `/`, accepts device commands on `/cmd` and
//! reports status on `/status`. When an access token is configured every
//! route requires a matching `token` query parameter. Connections get one
//! thread each; the MJPEG writer keeps its connection until the client
//! leaves or the client shuts down.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::protocol::{Envelope, RESPONSE_OK};
use crate::sockets::bind_ip;
use crate::video::{encode_jpeg, resize_to_width, FrameStore};
use crate::worker::SharedState;

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const FRAME_PAUSE: Duration = Duration::from_millis(33);
const FRAME_WAIT: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct WebConfig {
    pub bind_ip: String,
    pub port: u16,
    pub token: Option<String>,
    pub jpeg_quality: u8,
    pub resize_width: Option<u32>,
}

#[derive(Debug)]
pub struct WebHandle {
    pub addr: SocketAddr,
}

impl WebHandle {
    pub fn stop(&self) {
        info!("Stopping webserver...");
    }
}

struct WebContext {
    cfg: WebConfig,
    frames: Arc<FrameStore>,
    state: Arc<SharedState>,
    device_tx: Sender<String>,
}

pub struct Webserver;

impl Webserver {
    /// Bind the web port and spawn the accept loop. The accept loop and all
    /// connection threads poll the shared shutdown flag.
    pub fn spawn(
        cfg: WebConfig,
        frames: Arc<FrameStore>,
        state: Arc<SharedState>,
        device_tx: Sender<String>,
    ) -> Result<WebHandle> {
        let addr = format!("{}:{}", bind_ip(&cfg.bind_ip), cfg.port);
        let listener =
            TcpListener::bind(&addr).with_context(|| format!("failed to bind {}", addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        info!("Webserver started on {}", addr);

        let ctx = Arc::new(WebContext {
            cfg,
            frames,
            state,
            device_tx,
        });
        thread::spawn(move || run_accept(listener, ctx));
        Ok(WebHandle { addr })
    }
}

fn run_accept(listener: TcpListener, ctx: Arc<WebContext>) {
    loop {
        if ctx.state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let ctx = ctx.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &ctx) {
                        debug!("Web request ended: {}", e);
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                error!("Webserver accept error: {}", e);
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, ctx: &WebContext) -> Result<()> {
    let request = read_request(&mut stream)?;
    let query = parse_pairs(request.query());

    if let Some(expected) = &ctx.cfg.token {
        if query.get("token").map(String::as_str) != Some(expected.as_str()) {
            return write_response(&mut stream, 403, "text/plain", b"Forbidden");
        }
    }

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => stream_mjpeg(stream, ctx),
        ("GET", "/cmd") | ("POST", "/cmd") => {
            let form = parse_pairs(&String::from_utf8_lossy(&request.body));
            let cmd = form
                .get("cmd")
                .or_else(|| query.get("cmd"))
                .cloned()
                .unwrap_or_default();
            if !cmd.is_empty() {
                debug!("Web command: {}", cmd);
                if let Err(e) = ctx.device_tx.send(cmd) {
                    error!("Device command channel error: {}", e);
                }
            }
            let status = ctx.state.status();
            if status.is_empty() {
                write_response(&mut stream, 200, "text/plain", RESPONSE_OK.as_bytes())
            } else {
                let body = Envelope::command(&status).to_json()?;
                write_response(&mut stream, 200, "application/json", body.as_bytes())
            }
        }
        ("GET", "/status") => {
            let status = ctx.state.status();
            write_response(&mut stream, 200, "text/plain", status.as_bytes())
        }
        _ => write_response(&mut stream, 404, "text/plain", b"Not Found"),
    }
}

/// MJPEG part stream, one JPEG per boundary until the peer or the client
/// goes away.
fn stream_mjpeg(mut stream: TcpStream, ctx: &WebContext) -> Result<()> {
    let head = "HTTP/1.1 200 OK\r\n\
         Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Cache-Control: no-store\r\n\r\n";
    stream.write_all(head.as_bytes())?;

    loop {
        if ctx.state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let Some(frame) = ctx.frames.latest() else {
            thread::sleep(FRAME_WAIT);
            continue;
        };
        let frame = match ctx.cfg.resize_width {
            Some(width) if width > 0 => resize_to_width(&frame, width),
            _ => frame,
        };
        let jpg = encode_jpeg(&frame, ctx.cfg.jpeg_quality)?;
        stream.write_all(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n")?;
        stream.write_all(&jpg)?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
        thread::sleep(FRAME_PAUSE);
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let head_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .ok_or_else(|| anyhow!("truncated request"))?;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&data[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
        .min(MAX_REQUEST_BYTES);
    let mut body: Vec<u8> = data[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nAccess-Control-Allow-Origin: *\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query(&self) -> &str {
        self.raw_path.split('?').nth(1).unwrap_or("")
    }
}

/// Parse `a=1&b=2` pairs with percent-decoding, for queries and form
/// bodies alike.
fn parse_pairs(raw: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    for pair in raw.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            pairs.insert(url_decode(k), url_decode(v));
        }
    }
    pairs
}

fn url_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match decoded {
                    Some(value) => {
                        out.push(value);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
