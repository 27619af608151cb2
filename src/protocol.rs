//! Wire protocol between client and server.
//!
//! Every socket message is one JSON envelope. `k` selects the channel
//! ("CMD", "SELF" or "CONN"), `v` carries the command, response code or
//! status text, `t` is an optional millisecond timestamp and `hostname`
//! rides along only in the handshake ACCEPT reply.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// envelope keys
pub const DATA_KEY_CMD: &str = "CMD";
pub const DATA_KEY_SELF: &str = "SELF";
pub const DATA_KEY_CONN: &str = "CONN";

// commands (server -> client)
pub const CMD_PING: &str = "1";
pub const CMD_STATUS: &str = "0";
pub const CMD_CONN_NEW: &str = "NEW";
pub const CMD_CONNECT: &str = "CONNECT";
pub const CMD_RESTART: &str = "RESTART";
pub const CMD_DESTROY: &str = "DESTROY";
pub const CMD_DISCONNECT: &str = "DISCONNECT";

// response codes (client -> server)
pub const RESPONSE_OK: &str = "OK";
pub const RESPONSE_ACCEPT: &str = "ACCEPT";
pub const RESPONSE_RECV: &str = "RECV";
pub const RESPONSE_PONG: &str = "1";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Envelope {
    pub k: String,
    pub v: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl Envelope {
    pub fn new(key: &str, value: &str) -> Self {
        Envelope {
            k: key.to_string(),
            v: value.to_string(),
            t: None,
            hostname: None,
        }
    }

    pub fn stamped(key: &str, value: &str) -> Self {
        let mut env = Envelope::new(key, value);
        env.t = Some(now_ms());
        env
    }

    /// Command/response envelope bound for the server.
    pub fn command(value: &str) -> Self {
        Envelope::stamped(DATA_KEY_CMD, value)
    }

    /// Envelope injected through the loop socket into the client's own
    /// data port.
    pub fn self_loop(value: &str) -> Self {
        Envelope::stamped(DATA_KEY_SELF, value)
    }

    /// Handshake reply: ACCEPT plus the client hostname.
    pub fn accept(hostname: &str) -> Self {
        let mut env = Envelope::stamped(DATA_KEY_CMD, RESPONSE_ACCEPT);
        env.hostname = Some(hostname.to_string());
        env
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_envelope_is_timestamped() {
        let env = Envelope::command(RESPONSE_RECV);
        assert_eq!(env.k, DATA_KEY_CMD);
        assert_eq!(env.v, "RECV");
        assert!(env.t.is_some());
        assert!(env.hostname.is_none());
    }

    #[test]
    fn accept_reply_carries_hostname() {
        let env = Envelope::accept("camera-1");
        assert_eq!(env.v, RESPONSE_ACCEPT);
        assert_eq!(env.hostname.as_deref(), Some("camera-1"));
        let json = env.to_json().unwrap();
        assert!(json.contains("\"hostname\":\"camera-1\""));
    }

    #[test]
    fn optional_fields_stay_off_the_wire() {
        let json = Envelope::new(DATA_KEY_SELF, CMD_RESTART).to_json().unwrap();
        assert_eq!(json, "{\"k\":\"SELF\",\"v\":\"RESTART\"}");
    }

    #[test]
    fn parse_tolerates_missing_timestamp() {
        let env = Envelope::from_json("{\"k\":\"CONN\",\"v\":\"NEW\"}").unwrap();
        assert_eq!(env.k, DATA_KEY_CONN);
        assert_eq!(env.v, CMD_CONN_NEW);
        assert_eq!(env.t, None);
    }

    #[test]
    fn parse_ignores_unknown_fields() {
        let env = Envelope::from_json("{\"k\":\"CMD\",\"v\":\"1\",\"extra\":42}").unwrap();
        assert_eq!(env.v, CMD_PING);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(Envelope::from_json("not json").is_err());
        assert!(Envelope::from_json("{\"k\":\"CMD\"}").is_err());
    }

    #[test]
    fn round_trip() {
        let env = Envelope::command("0,90,1,0,0,0,0,0,0");
        let back = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(back, env);
    }
}
