//! UDP discovery responder: answers server-search datagrams and runs the
//! one-shot pairing key exchange.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::crypto;
use crate::device::{DeviceManager, Role};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pairing-mode state machine, replacing the source's `pairing_code`/
/// `paired_uin` globals hung off the UDP server object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    Awaiting { code: String },
    Paired { uin: u32 },
    Failed,
}

pub struct DiscoveryResponder {
    socket: UdpSocket,
    registry: std::sync::Arc<DeviceManager>,
    pairing: Mutex<PairingState>,
}

fn parse_role(value: &Value) -> Option<Role> {
    match value.as_str()? {
        "client" => Some(Role::Client),
        "server" => Some(Role::Server),
        "proxy" => Some(Role::Proxy),
        _ => None,
    }
}

impl DiscoveryResponder {
    pub fn bind(port: u16, registry: std::sync::Arc<DeviceManager>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self {
            socket,
            registry,
            pairing: Mutex::new(PairingState::Idle),
        })
    }

    pub fn bind_for_pairing(
        port: u16,
        registry: std::sync::Arc<DeviceManager>,
        pairing_code: String,
    ) -> std::io::Result<Self> {
        let responder = Self::bind(port, registry)?;
        *responder.pairing.lock().unwrap() = PairingState::Awaiting { code: pairing_code };
        Ok(responder)
    }

    pub fn pairing_state(&self) -> PairingState {
        self.pairing.lock().unwrap().clone()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the accept loop until `stop` is set. In pairing mode the loop
    /// should be stopped by the caller as soon as `pairing_state()` becomes
    /// `Paired` or `Failed`.
    pub fn run(&self, stop: &AtomicBool) {
        let mut buf = [0u8; 4096];
        while !stop.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, src)) => self.handle_datagram(&buf[..n], src),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    log::warn!("udp recv error: {}", e);
                }
            }
        }
    }

    fn handle_datagram(&self, raw: &[u8], src: SocketAddr) {
        let request: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("JSON decoding error in UDP request: {}", e);
                return;
            }
        };
        let plugin = request.get("plugin").and_then(Value::as_str);
        let action = request.get("action").and_then(Value::as_str);
        if plugin != Some("search") || action != Some("request") {
            return;
        }
        let Some(uin) = request.get("uin").and_then(Value::as_u64).map(|v| v as u32) else {
            log::warn!("Key not found in JSON (UDP request): uin");
            return;
        };
        let name = request.get("name").and_then(Value::as_str);
        let role = request.get("role").and_then(parse_role);
        let pair_data = request.get("pair").and_then(Value::as_str);

        self.registry.update(uin, src.ip(), name, role);

        let server = self.registry.server().clone();
        let mut response = serde_json::json!({
            "plugin": "search",
            "action": "response",
            "role": "server",
            "uin": server.uin,
            "name": server.name,
        });

        let pairing_code = match &*self.pairing.lock().unwrap() {
            PairingState::Awaiting { code } => Some(code.clone()),
            _ => None,
        };

        if let Some(code) = &pairing_code {
            if let Some(pair_b64) = pair_data {
                self.try_complete_pairing(code, uin, pair_b64);
            }
            let reply_key = crypto::derive_key(&format!("{}{}", code, uin));
            let sealed = crypto::seal(server.password.as_bytes(), &reply_key);
            response["pair"] = Value::String(BASE64.encode(sealed));
        }

        let payload = serde_json::to_vec(&response).expect("response must serialize");
        if let Err(e) = self.socket.send_to(&payload, src) {
            log::warn!("udp send error: {}", e);
        }
    }

    fn try_complete_pairing(&self, pairing_code: &str, uin: u32, pair_b64: &str) {
        let Ok(sealed) = BASE64.decode(pair_b64) else {
            log::warn!("pair field is not valid base64");
            return;
        };
        let server_uin = self.registry.server().uin;
        let key = crypto::derive_key(&format!("{}{}", pairing_code, server_uin));
        let plaintext = match crypto::open(&sealed, &key) {
            Ok(p) => p,
            Err(_) => {
                log::warn!("pairing decrypt failed for uin {}", uin);
                return;
            }
        };
        let Ok(password) = String::from_utf8(plaintext) else {
            log::warn!("pairing payload is not valid UTF-8");
            return;
        };
        if self.registry.update_password(uin, &password) {
            *self.pairing.lock().unwrap() = PairingState::Paired { uin };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ServerIdentity;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn registry() -> Arc<DeviceManager> {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerIdentity {
            uin: 7,
            name: "Host".to_string(),
            password: "serverpw".to_string(),
        };
        Arc::new(DeviceManager::load(dir.path(), server).unwrap())
    }

    #[test]
    fn search_request_updates_registry_and_replies() {
        let reg = registry();
        let responder = DiscoveryResponder::bind(0, reg.clone()).unwrap();
        let raw = br#"{"plugin":"search","action":"request","uin":42,"name":"P","role":"client"}"#;
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)), 12345);
        responder.handle_datagram(raw, src);
        let device = reg.lookup(42).unwrap();
        assert_eq!(device.name, "P");
        assert_eq!(device.ip, Some(src.ip()));
    }

    #[test]
    fn malformed_datagram_is_ignored() {
        let reg = registry();
        let responder = DiscoveryResponder::bind(0, reg.clone()).unwrap();
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)), 12345);
        responder.handle_datagram(b"not json", src);
        assert!(reg.lookup(42).is_none());
    }

    #[test]
    fn pairing_completes_and_transitions_state() {
        let reg = registry();
        let responder =
            DiscoveryResponder::bind_for_pairing(0, reg.clone(), "123456".to_string()).unwrap();
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)), 12345);

        reg.update(42, src.ip(), Some("Phone"), Some(Role::Client));

        let key = crypto::derive_key(&format!("123456{}", 7));
        let sealed = crypto::seal(b"clientpw", &key);
        let pair_b64 = BASE64.encode(sealed);
        let raw = format!(
            r#"{{"plugin":"search","action":"request","uin":42,"name":"P","role":"client","pair":"{}"}}"#,
            pair_b64
        );
        responder.handle_datagram(raw.as_bytes(), src);

        assert_eq!(responder.pairing_state(), PairingState::Paired { uin: 42 });
        let device = reg.lookup(42).unwrap();
        assert_eq!(device.password, "clientpw");
    }

    #[test]
    fn malformed_pair_payload_still_updates_device_ip() {
        let reg = registry();
        let responder =
            DiscoveryResponder::bind_for_pairing(0, reg.clone(), "123456".to_string()).unwrap();
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)), 12345);
        let raw = br#"{"plugin":"search","action":"request","uin":42,"name":"P","role":"client","pair":"not-valid-base64!!"}"#;
        responder.handle_datagram(raw, src);
        let device = reg.lookup(42).unwrap();
        assert_eq!(device.ip, Some(src.ip()));
        assert_ne!(responder.pairing_state(), PairingState::Paired { uin: 42 });
    }
}
