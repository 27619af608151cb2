//! End-to-end tests of the socket stack against a fake server, on real TCP
//! sockets bound to ephemeral ports.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use servocam_client::handler::Handler;
use servocam_client::protocol::{
    Envelope, CMD_DISCONNECT, CMD_PING, RESPONSE_ACCEPT, RESPONSE_OK, RESPONSE_PONG, RESPONSE_RECV,
};
use servocam_client::sockets::{SocketConfig, Sockets};
use servocam_client::worker::SharedState;

fn spawn_client() -> (Arc<Sockets>, Arc<SharedState>, mpsc::Receiver<String>) {
    let state = Arc::new(SharedState::default());
    let cfg = SocketConfig {
        bind_ip: "127.0.0.1".to_string(),
        conn_port: 0,
        data_port: 0,
        status_port: 0,
        // queue everything so no message is conflated away mid-test
        pull_wait: true,
        pull_linger: false,
        push_wait: true,
        push_linger: true,
    };
    let sockets = Sockets::new(cfg, "testhost".to_string(), None, state.clone());
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Handler::new(sockets.clone(), state.clone(), tx));
    sockets.start(handler).expect("start sockets");
    (sockets, state, rx)
}

fn read_envelope(reader: &mut BufReader<TcpStream>) -> Envelope {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read envelope line");
    Envelope::from_json(line.trim()).expect("parse envelope")
}

/// Waits for a flag to reach the wanted value; the dispatch thread updates
/// shared state after its replies are already on the wire.
fn wait_for_flag(flag: &AtomicBool, wanted: bool) -> bool {
    for _ in 0..200 {
        if flag.load(Ordering::SeqCst) == wanted {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    flag.load(Ordering::SeqCst) == wanted
}

#[test]
fn handshake_records_server_ip_and_replies_accept() {
    let (sockets, state, _rx) = spawn_client();
    let addr = sockets.conn_addr().expect("conn listener bound");

    let mut stream = TcpStream::connect(addr).expect("connect to CONN");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"{\"k\":\"CONN\",\"v\":\"NEW\"}")
        .expect("send handshake");

    let mut reader = BufReader::new(stream);
    let reply = read_envelope(&mut reader);
    assert_eq!(reply.v, RESPONSE_ACCEPT);
    assert_eq!(reply.hostname.as_deref(), Some("testhost"));
    assert!(reply.t.is_some());
    assert_eq!(state.server_ip().as_deref(), Some("127.0.0.1"));

    sockets.stop();
}

#[test]
fn handshake_restart_flows_through_the_loop_socket() {
    let (sockets, state, _rx) = spawn_client();
    let addr = sockets.conn_addr().expect("conn listener bound");

    let mut stream = TcpStream::connect(addr).expect("connect to CONN");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"{\"k\":\"CONN\",\"v\":\"NEW\"}")
        .expect("send handshake");
    let mut reader = BufReader::new(stream);
    let reply = read_envelope(&mut reader);
    assert_eq!(reply.v, RESPONSE_ACCEPT);

    // the handshake injects SELF RESTART into the client's own data port;
    // the dispatcher flags the video publisher when it arrives
    assert!(wait_for_flag(&state.video_restart, true));

    sockets.stop();
}

#[test]
fn commands_are_dispatched_and_answered_on_the_status_channel() {
    let (sockets, state, device_rx) = spawn_client();
    // the dispatcher only runs once a server is known
    state.set_server_ip(Some("127.0.0.1".to_string()));

    let status = TcpStream::connect(sockets.status_addr().expect("status bound"))
        .expect("attach status reader");
    status
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut status = BufReader::new(status);

    let mut data =
        TcpStream::connect(sockets.data_addr().expect("data bound")).expect("connect to DATA");

    // free-form device command: RECV reply plus device forward
    let line = Envelope::command("90,45,1,0,0,0,0,0,0").to_json().unwrap();
    data.write_all(format!("{}\n", line).as_bytes()).unwrap();
    let reply = read_envelope(&mut status);
    assert_eq!(reply.v, RESPONSE_RECV);
    assert!(reply.t.is_some());
    assert_eq!(
        device_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "90,45,1,0,0,0,0,0,0"
    );

    // ping answers with a pong and stays away from the device
    let line = Envelope::command(CMD_PING).to_json().unwrap();
    data.write_all(format!("{}\n", line).as_bytes()).unwrap();
    let reply = read_envelope(&mut status);
    assert_eq!(reply.v, RESPONSE_PONG);
    assert!(device_rx.recv_timeout(Duration::from_millis(200)).is_err());

    // disconnect acknowledges and clears the connected flag; the reply is
    // written before the flag drops, so wait rather than assert instantly
    state.connected.store(true, Ordering::SeqCst);
    let line = Envelope::command(CMD_DISCONNECT).to_json().unwrap();
    data.write_all(format!("{}\n", line).as_bytes()).unwrap();
    let reply = read_envelope(&mut status);
    assert_eq!(reply.v, RESPONSE_OK);
    assert!(wait_for_flag(&state.connected, false));

    sockets.stop();
}

#[test]
fn malformed_lines_are_dropped_without_killing_the_dispatcher() {
    let (sockets, state, device_rx) = spawn_client();
    state.set_server_ip(Some("127.0.0.1".to_string()));

    let mut data =
        TcpStream::connect(sockets.data_addr().expect("data bound")).expect("connect to DATA");
    data.write_all(b"this is not json\n").unwrap();

    let line = Envelope::command("FORWARD").to_json().unwrap();
    data.write_all(format!("{}\n", line).as_bytes()).unwrap();

    // the garbage line is skipped, the valid one still arrives
    assert_eq!(
        device_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "FORWARD"
    );

    sockets.stop();
}

#[test]
fn status_push_reaches_a_late_reader_when_waiting() {
    let (sockets, state, _rx) = spawn_client();
    state.set_server_ip(Some("127.0.0.1".to_string()));

    // no reader attached yet: with push_wait the line is held
    sockets.send(&Envelope::command("STATUS: 10:00:00"));

    let status = TcpStream::connect(sockets.status_addr().expect("status bound"))
        .expect("attach status reader");
    status
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut status = BufReader::new(status);
    let reply = read_envelope(&mut status);
    assert_eq!(reply.v, "STATUS: 10:00:00");

    sockets.stop();
}
