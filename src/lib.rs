//! Frame telemetry for 2D rendering pipelines.
//!
//! An instrumented process installs the [`client`] side once at startup; every
//! render thread can then emit operation spans, frame marks and attribute
//! values through lock-free entry points. A single worker thread advertises
//! the process over UDP, accepts one viewer at a time over TCP and streams
//! the event queue as LZ4-framed batches. The [`worker`] side is the viewer
//! core: it connects (or opens a capture file), decodes the stream and builds
//! the [`context::DataContext`] a frontend renders from.

pub mod client;
pub mod context;
pub mod discovery;
pub mod event;
pub mod lz4stream;
pub mod protocol;
pub mod queue;
pub mod resolv;
pub mod stream;
pub mod tags;
pub mod worker;

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub use client::{install_inspector, uninstall_inspector, InspectorConfig, ScopedOp};
pub use context::DataContext;
pub use protocol::HandshakeStatus;
pub use worker::Worker;

/// Errors surfaced by the viewer core and the capture file codec.
///
/// The instrumentation hot path never returns these; producer-side failures
/// are coerced to counted drops.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("an inspector instance is already installed")]
    AlreadyInstalled,
    #[error("protocol version mismatch with the instrumented process")]
    ProtocolMismatch,
    #[error("handshake rejected with status {0:?}")]
    HandshakeRejected(HandshakeStatus),
    #[error("handshake dropped: no reply from instrumented process")]
    HandshakeDropped,
    #[error("unknown queue tag {0}, byte stream alignment lost")]
    UnknownTag(u8),
    #[error("capture file: {0}")]
    FileFormat(String),
    #[error("encode: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decode: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;

struct Clock {
    anchor: Instant,
    epoch_ns: i64,
}

static CLOCK: OnceLock<Clock> = OnceLock::new();

fn clock() -> &'static Clock {
    CLOCK.get_or_init(|| Clock {
        anchor: Instant::now(),
        epoch_ns: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0),
    })
}

/// Monotonic nanoseconds, anchored to the wall clock at first use.
///
/// Successive calls never go backwards, which the delta timestamp scheme on
/// the wire relies on.
pub fn time_ns() -> i64 {
    let c = clock();
    c.epoch_ns + c.anchor.elapsed().as_nanos() as i64
}

/// Wall-clock seconds since the unix epoch, used by discovery beacons.
pub(crate) fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Wall-clock milliseconds, used for beacon client staleness tracking.
pub(crate) fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
