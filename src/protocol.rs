//! Wire-level constants and fixed-layout messages shared by both ends.
//!
//! Everything on the wire is packed little-endian with fixed-width integers;
//! one-byte tag enums get hand-written codecs because the derived form would
//! widen them to u32.

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use bincode::config::{Configuration, Fixint, LittleEndian};
use bincode::de::read::Reader;
use bincode::de::Decoder;
use bincode::enc::write::Writer;
use bincode::enc::Encoder;
use bincode::error::AllowedEnumVariants::Range;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

pub const BINCODE_CONFIG: Configuration<LittleEndian, Fixint> =
    bincode::config::standard().with_little_endian().with_fixed_int_encoding();

/// Fixed identifier a viewer presents before anything else.
pub const HANDSHAKE_SHIBBOLETH: &[u8; 8] = b"RInspect";
/// Bumped on any wire or file format change; no other schema evolution.
pub const PROTOCOL_VERSION: u32 = 1;
pub const BROADCAST_VERSION: u8 = 1;

pub const PROGRAM_NAME_SIZE: usize = 64;

/// Staging high-water mark; one compressed frame never carries more
/// uncompressed payload than this.
pub const TARGET_FRAME_SIZE: usize = 256 * 1024;

/// First TCP port tried by the instrumented process; scan continues for
/// [`DATA_PORT_SCAN`] consecutive ports.
pub const DATA_PORT_BASE: u16 = 8086;
pub const DATA_PORT_SCAN: u16 = 20;

/// UDP beacon ports: `BROADCAST_PORT_BASE .. BROADCAST_PORT_BASE + BROADCAST_NUM`.
pub const BROADCAST_PORT_BASE: u16 = 8086;
pub const BROADCAST_NUM: u16 = 10;

pub const SERVER_QUERY_PACKET_SIZE: usize = 13;
/// Upper bound on outstanding server queries regardless of socket buffering.
pub const SERVER_QUERY_SPACE_CAP: usize = 8 * 1024;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(3);
/// Beacon clients not re-announced within this window are dropped.
pub const CLIENT_TIMEOUT_MS: i64 = 4000;
/// Idle 10-µs waits before the producer forces a keep-alive commit.
pub const KEEP_ALIVE_IDLE_ITERS: u32 = 500;

const DEFAULT_SEND_BUFFER: usize = 64 * 1024;

/// One-byte reply to the shibboleth + version handshake.
#[derive(FromPrimitive, ToPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeStatus {
    Welcome = 0,
    ProtocolMismatch = 1,
    NotAvailable = 2,
    Dropped = 3,
}

impl Encode for HandshakeStatus {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.to_u8().unwrap().encode(encoder)
    }
}

bincode::impl_borrow_decode!(HandshakeStatus);

impl<Ctx> Decode<Ctx> for HandshakeStatus {
    fn decode<D: Decoder<Context = Ctx>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let value = u8::decode(decoder)?;
        match HandshakeStatus::from_u8(value) {
            Some(v) => Ok(v),
            None => Err(DecodeError::UnexpectedVariant {
                type_name: "HandshakeStatus",
                allowed: &Range { min: 0, max: HandshakeStatus::Dropped as u32 },
                found: value.into(),
            }),
        }
    }
}

/// Back-channel request from the viewer to the instrumented process.
///
/// Types below [`ServerQuery::Disconnect`] are prioritized: the viewer
/// flushes them from a separate queue before anything else.
#[derive(FromPrimitive, ToPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerQuery {
    String = 0,
    ValueName = 1,
    Disconnect = 2,
    Terminate = 3,
}

impl ServerQuery {
    pub fn is_prio(self) -> bool {
        (self as u8) < ServerQuery::Disconnect as u8
    }
}

impl Encode for ServerQuery {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.to_u8().unwrap().encode(encoder)
    }
}

bincode::impl_borrow_decode!(ServerQuery);

impl<Ctx> Decode<Ctx> for ServerQuery {
    fn decode<D: Decoder<Context = Ctx>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let value = u8::decode(decoder)?;
        match ServerQuery::from_u8(value) {
            Some(v) => Ok(v),
            None => Err(DecodeError::UnexpectedVariant {
                type_name: "ServerQuery",
                allowed: &Range { min: 0, max: ServerQuery::Terminate as u32 },
                found: value.into(),
            }),
        }
    }
}

/// 13 packed bytes: type, 64-bit handle, extra word.
#[derive(Encode, Decode, Copy, Clone, Debug, PartialEq, Eq)]
pub struct ServerQueryPacket {
    pub query_type: ServerQuery,
    pub ptr: u64,
    pub extra: u32,
}

impl ServerQueryPacket {
    pub fn new(query_type: ServerQuery, ptr: u64, extra: u32) -> Self {
        ServerQueryPacket { query_type, ptr, extra }
    }
}

/// First message after a `Welcome` status byte.
///
/// `init_begin` anchors every decoded timestamp (the session base time);
/// `ref_time` seeds the delta chain so it survives viewer reconnects.
#[derive(Encode, Decode, Copy, Clone, Debug)]
pub struct WelcomeMessage {
    pub init_begin: i64,
    pub init_end: i64,
    pub ref_time: i64,
    pub program_name: [u8; PROGRAM_NAME_SIZE],
}

/// Beacon payload type.
#[derive(FromPrimitive, ToPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BeaconKind {
    FrameCapture = 0,
    LayerTree = 1,
}

/// UDP autodiscovery beacon, 84 packed bytes.
///
/// `active_time` is seconds since the instrumented process started; a
/// negative value tells listeners to remove the entry immediately.
#[derive(Encode, Decode, Copy, Clone, Debug)]
pub struct BroadcastMessage {
    pub broadcast_version: u8,
    pub listen_port: u16,
    pub protocol_version: u32,
    pub active_time: i32,
    pub program_name: [u8; PROGRAM_NAME_SIZE],
    pub pid: u64,
    pub kind: u8,
}

pub const BROADCAST_MESSAGE_SIZE: usize = 84;

/// Adapter so bincode can encode straight into any `std::io::Write`.
pub struct WriterBox<'l, W: Write>(pub &'l mut W);

impl<W: Write> Writer for WriterBox<'_, W> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        self.0.write_all(bytes).map_err(|e| EncodeError::Io { inner: e, index: 0 })
    }
}

/// String transfer body: u16 length then raw bytes, no terminator.
pub struct U16SizeString<'l>(pub &'l [u8]);

impl Encode for U16SizeString<'_> {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        (self.0.len() as u16).encode(encoder)?;
        encoder.writer().write(self.0)?;
        Ok(())
    }
}

/// Reads a u16-prefixed byte string, claiming the container size first.
pub fn decode_u16_bytes<Ctx, D: Decoder<Context = Ctx>>(
    decoder: &mut D,
) -> Result<Vec<u8>, DecodeError> {
    let len = u16::decode(decoder)?;
    decoder.claim_container_read::<u8>(len as usize)?;
    let mut vec = vec![0u8; len as usize];
    decoder.reader().read(&mut vec)?;
    Ok(vec)
}

pub fn fixed_name(name: &str) -> [u8; PROGRAM_NAME_SIZE] {
    let mut out = [0u8; PROGRAM_NAME_SIZE];
    let mut len = name.len().min(PROGRAM_NAME_SIZE - 1);
    // never split a UTF-8 sequence
    while len > 0 && !name.is_char_boundary(len) {
        len -= 1;
    }
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

pub fn name_text(name: &[u8; PROGRAM_NAME_SIZE]) -> String {
    let end = name.iter().position(|&b| b == 0).unwrap_or(PROGRAM_NAME_SIZE);
    String::from_utf8_lossy(&name[..end]).into_owned()
}

/// Kernel send-buffer size of `stream`, used to size the server-query
/// rate-limit window.
#[cfg(unix)]
pub fn send_buffer_size(stream: &TcpStream) -> usize {
    use std::os::unix::io::AsRawFd;
    let mut val: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: the fd stays open for the borrow of `stream`, and `val`/`len`
    // match what SO_SNDBUF writes back.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &mut val as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 && val > 0 {
        val as usize
    } else {
        DEFAULT_SEND_BUFFER
    }
}

#[cfg(not(unix))]
pub fn send_buffer_size(_stream: &TcpStream) -> usize {
    DEFAULT_SEND_BUFFER
}

/// Caps the kernel send buffer of `stream`. Best effort: constrained links
/// and backpressure tests; the kernel may round the value.
#[cfg(unix)]
pub fn set_send_buffer_size(stream: &TcpStream, size: usize) {
    use std::os::unix::io::AsRawFd;
    let val = size as libc::c_int;
    // SAFETY: the fd stays open for the borrow of `stream`, and `val` has
    // exactly the type SO_SNDBUF expects.
    let _ = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
}

#[cfg(not(unix))]
pub fn set_send_buffer_size(_stream: &TcpStream, _size: usize) {}

/// Initial server-query credit: enough packets to fill the send buffer,
/// capped, minus headroom for a terminate request.
pub fn server_query_space(stream: &TcpStream) -> usize {
    (send_buffer_size(stream) / SERVER_QUERY_PACKET_SIZE)
        .min(SERVER_QUERY_SPACE_CAP)
        .saturating_sub(4)
}
