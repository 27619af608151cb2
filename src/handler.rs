//! Dispatch for decoded envelopes, running on the socket dispatch thread.

use log::{debug, error, info};
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::protocol::{
    Envelope, CMD_DESTROY, CMD_DISCONNECT, CMD_PING, CMD_RESTART, DATA_KEY_CMD, DATA_KEY_SELF,
    RESPONSE_OK, RESPONSE_PONG, RESPONSE_RECV,
};
use crate::sockets::Sockets;
use crate::worker::SharedState;

pub struct Handler {
    sockets: Arc<Sockets>,
    state: Arc<SharedState>,
    device_tx: Sender<String>,
}

impl Handler {
    pub fn new(sockets: Arc<Sockets>, state: Arc<SharedState>, device_tx: Sender<String>) -> Self {
        Handler {
            sockets,
            state,
            device_tx,
        }
    }

    pub fn handle(&self, env: Envelope) {
        match env.k.as_str() {
            DATA_KEY_CMD => self.handle_cmd(&env.v),
            DATA_KEY_SELF => self.handle_self(&env.v),
            other => debug!("Unhandled message key: {}", other),
        }
    }

    fn handle_cmd(&self, cmd: &str) {
        match cmd {
            CMD_DISCONNECT => {
                info!("Disconnecting...");
                self.reply(RESPONSE_OK);
                self.state.connected.store(false, Ordering::SeqCst);
            }
            CMD_RESTART => {
                info!("Restarting...");
                self.reply(RESPONSE_OK);
                self.state.video_restart.store(true, Ordering::SeqCst);
            }
            CMD_DESTROY => {
                self.reply(RESPONSE_OK);
                info!("Destroying...");
                self.sockets.stop();
            }
            CMD_PING => {
                self.reply(RESPONSE_PONG);
            }
            "" => {}
            other => {
                self.reply(RESPONSE_RECV);
                self.send_to_device(other);
            }
        }
    }

    fn handle_self(&self, cmd: &str) {
        // restarts are serialized here, on the dispatch thread, which is
        // why they arrive through the loop socket at all
        if cmd == CMD_RESTART {
            info!("Restarting sockets...");
            self.state.video_restart.store(true, Ordering::SeqCst);
            self.sockets.restart();
        } else {
            self.sockets.send(&Envelope::command(cmd));
        }
    }

    /// Hook invoked when the server completes the handshake.
    pub fn handle_conn(&self) {}

    fn reply(&self, response: &str) {
        self.sockets.send(&Envelope::command(response));
    }

    fn send_to_device(&self, cmd: &str) {
        match self.device_tx.send(cmd.to_string()) {
            Ok(()) => info!("DEVICE CMD SENT OK: {}", cmd),
            Err(e) => error!("Device command channel error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sockets::SocketConfig;
    use std::sync::mpsc;

    fn test_handler() -> (Handler, mpsc::Receiver<String>, Arc<SharedState>) {
        let state = Arc::new(SharedState::default());
        let cfg = SocketConfig {
            bind_ip: String::new(),
            conn_port: 0,
            data_port: 0,
            status_port: 0,
            pull_wait: false,
            pull_linger: false,
            push_wait: false,
            push_linger: true,
        };
        let sockets = Sockets::new(cfg, "testhost".to_string(), None, state.clone());
        let (tx, rx) = mpsc::channel();
        (Handler::new(sockets, state.clone(), tx), rx, state)
    }

    #[test]
    fn device_commands_are_forwarded() {
        let (handler, rx, _state) = test_handler();
        handler.handle(Envelope::command("90,45,1"));
        assert_eq!(rx.try_recv().unwrap(), "90,45,1");
    }

    #[test]
    fn empty_commands_are_ignored() {
        let (handler, rx, _state) = test_handler();
        handler.handle(Envelope::command(""));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disconnect_clears_the_connected_flag() {
        let (handler, _rx, state) = test_handler();
        state.connected.store(true, Ordering::SeqCst);
        handler.handle(Envelope::command(CMD_DISCONNECT));
        assert!(!state.connected.load(Ordering::SeqCst));
    }

    #[test]
    fn restart_flags_the_video_publisher() {
        let (handler, rx, state) = test_handler();
        handler.handle(Envelope::command(CMD_RESTART));
        assert!(state.video_restart.load(Ordering::SeqCst));
        // control command, not forwarded to the device
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn destroy_initiates_shutdown() {
        let (handler, _rx, state) = test_handler();
        handler.handle(Envelope::command(CMD_DESTROY));
        assert!(state.shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn ping_is_not_forwarded_to_the_device() {
        let (handler, rx, _state) = test_handler();
        handler.handle(Envelope::command(CMD_PING));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn self_status_is_rewrapped_for_the_server() {
        let (handler, rx, _state) = test_handler();
        handler.handle(Envelope::self_loop("STATUS: 12:00:00"));
        // status goes to the server, not the device
        assert!(rx.try_recv().is_err());
    }
}
