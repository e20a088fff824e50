//! UDP autodiscovery: beacon sockets on the producer side, the client
//! directory on the viewer side.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use log::debug;

use crate::protocol::{
    name_text, BroadcastMessage, BINCODE_CONFIG, BROADCAST_MESSAGE_SIZE, BROADCAST_NUM,
    BROADCAST_PORT_BASE, CLIENT_TIMEOUT_MS,
};
use crate::resolv::ResolvService;
use crate::{epoch_millis, Result};

/// Broadcast sender used by the instrumented process.
pub struct UdpBroadcast {
    sock: UdpSocket,
}

impl UdpBroadcast {
    pub fn open() -> Result<Self> {
        let sock = UdpSocket::bind(("0.0.0.0", 0))?;
        sock.set_broadcast(true)?;
        Ok(UdpBroadcast { sock })
    }

    pub fn send(&self, port: u16, payload: &[u8]) -> Result<()> {
        self.sock.send_to(payload, (Ipv4Addr::BROADCAST, port))?;
        Ok(())
    }
}

/// Non-blocking beacon receiver.
pub struct UdpListen {
    sock: UdpSocket,
}

impl UdpListen {
    pub fn bind(port: u16) -> Result<Self> {
        let sock = UdpSocket::bind(("0.0.0.0", port))?;
        sock.set_nonblocking(true)?;
        Ok(UdpListen { sock })
    }

    /// One pending datagram, if any.
    pub fn read(&self) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; 512];
        match self.sock.recv_from(&mut buf) {
            Ok((len, from)) => Some((buf[..len].to_vec(), from)),
            Err(_) => None,
        }
    }
}

/// One instrumented process seen on the network.
#[derive(Clone, Debug)]
pub struct ClientData {
    pub last_seen_ms: i64,
    pub protocol_version: u32,
    pub active_time: i32,
    pub port: u16,
    pub pid: u64,
    pub program_name: String,
    pub address: String,
    pub kind: u8,
}

pub fn client_key(ip: u32, port: u16) -> u64 {
    ((ip as u64) << 32) | port as u64
}

/// Directory of advertising processes, fed by periodic [`poll`] calls.
///
/// [`poll`]: ClientDirectory::poll
pub struct ClientDirectory {
    listen: Option<UdpListen>,
    clients: HashMap<u64, ClientData>,
    resolv: ResolvService,
}

impl ClientDirectory {
    pub fn new(resolv: ResolvService) -> Self {
        ClientDirectory { listen: None, clients: HashMap::new(), resolv }
    }

    /// Drains pending beacons and prunes stale entries. Call about once a
    /// second. The first call binds the listen socket.
    pub fn poll(&mut self) {
        let now = epoch_millis();
        if self.listen.is_none() {
            for i in 0..BROADCAST_NUM {
                if let Ok(listen) = UdpListen::bind(BROADCAST_PORT_BASE + i) {
                    debug!("beacon listener on udp port {}", BROADCAST_PORT_BASE + i);
                    self.listen = Some(listen);
                    break;
                }
            }
            if self.listen.is_none() {
                return;
            }
        }
        while let Some((bytes, from)) = self.listen.as_ref().and_then(|l| l.read()) {
            self.ingest(&bytes, from, now);
        }
        self.clients.retain(|_, c| now - c.last_seen_ms <= CLIENT_TIMEOUT_MS);
    }

    fn ingest(&mut self, bytes: &[u8], from: SocketAddr, now_ms: i64) {
        if bytes.len() > BROADCAST_MESSAGE_SIZE {
            return;
        }
        let Ok((message, _)) =
            bincode::decode_from_slice::<BroadcastMessage, _>(bytes, BINCODE_CONFIG)
        else {
            return;
        };
        let IpAddr::V4(ip) = from.ip() else {
            return;
        };
        let key = client_key(u32::from(ip), message.listen_port);
        if message.active_time >= 0 {
            let address = ip.to_string();
            let entry = self.clients.entry(key).or_insert_with(|| {
                self.resolv.query(&address, IpAddr::V4(ip));
                ClientData {
                    last_seen_ms: now_ms,
                    protocol_version: message.protocol_version,
                    active_time: message.active_time,
                    port: message.listen_port,
                    pid: message.pid,
                    program_name: name_text(&message.program_name),
                    address,
                    kind: message.kind,
                }
            });
            entry.last_seen_ms = now_ms;
            entry.protocol_version = message.protocol_version;
            entry.active_time = message.active_time;
            entry.port = message.listen_port;
            entry.pid = message.pid;
            entry.kind = message.kind;
            let name = name_text(&message.program_name);
            if entry.program_name != name {
                entry.program_name = name;
            }
        } else {
            self.clients.remove(&key);
        }
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientData> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Host name for an address, once reverse resolution has landed.
    pub fn resolved_name(&self, address: &str) -> Option<String> {
        self.resolv.get(address)
    }
}
