//! Producer side: process-wide instrumentation entry points and the single
//! client worker thread.
//!
//! Entry points enqueue fixed-size events into the lock-free queue and never
//! block, allocate per call or panic; when no instance is installed they are
//! no-ops. The worker owns everything else: the listen socket, UDP beacons,
//! handshake, the staging buffer and the LZ4-framed TCP stream.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::discovery::UdpBroadcast;
use crate::lz4stream::{compress_bound, StreamEncoder};
use crate::protocol::{
    fixed_name, set_send_buffer_size, BeaconKind, BroadcastMessage, HandshakeStatus, ServerQuery,
    ServerQueryPacket, WelcomeMessage, WriterBox, BINCODE_CONFIG, BROADCAST_INTERVAL, BROADCAST_NUM,
    BROADCAST_PORT_BASE, BROADCAST_VERSION, DATA_PORT_BASE, DATA_PORT_SCAN, HANDSHAKE_SHIBBOLETH,
    HANDSHAKE_TIMEOUT, KEEP_ALIVE_IDLE_ITERS, PROTOCOL_VERSION, SERVER_QUERY_PACKET_SIZE,
    TARGET_FRAME_SIZE,
};
use crate::queue::{name_handle, resolve_name_handle, EventQueue, QueueEvent};
use crate::{epoch_seconds, time_ns, Error, Result};

/// Producer-side configuration, fixed at install time.
#[derive(Clone, Debug)]
pub struct InspectorConfig {
    /// Name advertised in beacons and the welcome message; defaults to the
    /// current executable's file name.
    pub program_name: Option<String>,
    /// First TCP port tried for the data listener.
    pub data_port: u16,
    /// Whether to advertise over UDP broadcast.
    pub broadcast: bool,
    /// Cap on the data socket's kernel send buffer, for constrained links.
    pub send_buffer: Option<usize>,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        InspectorConfig {
            program_name: None,
            data_port: DATA_PORT_BASE,
            broadcast: true,
            send_buffer: None,
        }
    }
}

/// Process-wide instrumentation instance. Owns the worker thread.
pub struct Inspector {
    queue: EventQueue,
    shutdown: AtomicBool,
    connected: AtomicBool,
    time_begin: AtomicI64,
    bound_port: AtomicU16,
    init_time: i64,
    epoch: i64,
    program_name: String,
    data_port: u16,
    broadcast: bool,
    send_buffer: Option<usize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

static INSTANCE: RwLock<Option<Arc<Inspector>>> = RwLock::new(None);

fn with_instance<R>(f: impl FnOnce(&Inspector) -> R) -> Option<R> {
    // try_read keeps the hot path non-blocking even while install/uninstall
    // hold the write lock; events raced against teardown are simply dropped
    let guard = INSTANCE.try_read().ok()?;
    guard.as_ref().map(|inspector| f(inspector))
}

/// Installs the process-wide inspector and spawns its worker thread.
pub fn install_inspector(config: InspectorConfig) -> Result<()> {
    let mut slot = INSTANCE.write().unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        return Err(Error::AlreadyInstalled);
    }
    let program_name = config.program_name.unwrap_or_else(|| {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".into())
    });
    let inspector = Arc::new(Inspector {
        queue: EventQueue::new(),
        shutdown: AtomicBool::new(false),
        connected: AtomicBool::new(false),
        time_begin: AtomicI64::new(0),
        bound_port: AtomicU16::new(0),
        init_time: time_ns(),
        epoch: epoch_seconds(),
        program_name,
        data_port: config.data_port,
        broadcast: config.broadcast,
        send_buffer: config.send_buffer,
        worker: Mutex::new(None),
    });
    let handle = {
        let inspector = Arc::clone(&inspector);
        thread::Builder::new()
            .name("rinspect-client".into())
            .spawn(move || ClientWorker::new(inspector).run())?
    };
    inspector.time_begin.store(time_ns(), Ordering::Release);
    *inspector.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    *slot = Some(inspector);
    Ok(())
}

/// Tears the inspector down: sets the shutdown flag first so every blocking
/// point unwinds, then joins the worker thread.
pub fn uninstall_inspector() {
    let inspector = {
        let mut slot = INSTANCE.write().unwrap_or_else(|e| e.into_inner());
        slot.take()
    };
    if let Some(inspector) = inspector {
        inspector.shutdown.store(true, Ordering::Release);
        let handle = inspector.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// TCP port the worker is listening on, once bound.
pub fn listen_port() -> Option<u16> {
    with_instance(|i| i.bound_port.load(Ordering::Acquire)).filter(|&p| p != 0)
}

/// Whether a viewer session is currently streaming.
pub fn is_connected() -> bool {
    with_instance(|i| i.connected.load(Ordering::Acquire)).unwrap_or(false)
}

/// Events dropped while no viewer was attached.
pub fn dropped_events() -> u64 {
    with_instance(|i| i.queue.dropped()).unwrap_or(0)
}

pub fn frame_count() -> u64 {
    with_instance(|i| i.queue.frame_count()).unwrap_or(0)
}

/// Marks a frame boundary at the current time.
pub fn send_frame_mark() {
    with_instance(|i| {
        i.queue.bump_frame();
        i.queue.enqueue(QueueEvent::FrameMark { ns_time: time_ns() });
    });
}

pub fn send_attribute_u32(name: &'static str, value: u32) {
    with_instance(|i| i.queue.enqueue(QueueEvent::ValueUint32 { name: name_handle(name), value }));
}

/// Packed RGBA color; same payload as u32, coded by its own tag.
pub fn send_attribute_color(name: &'static str, rgba: u32) {
    with_instance(|i| {
        i.queue.enqueue(QueueEvent::ValueColor { name: name_handle(name), value: rgba })
    });
}

pub fn send_attribute_int(name: &'static str, value: i32) {
    with_instance(|i| i.queue.enqueue(QueueEvent::ValueInt { name: name_handle(name), value }));
}

pub fn send_attribute_float(name: &'static str, value: f32) {
    with_instance(|i| i.queue.enqueue(QueueEvent::ValueFloat { name: name_handle(name), value }));
}

pub fn send_attribute_float4(name: &'static str, value: [f32; 4]) {
    with_instance(|i| i.queue.enqueue(QueueEvent::ValueFloat4 { name: name_handle(name), value }));
}

/// Affine 2x3 matrix, six floats.
pub fn send_attribute_mat(name: &'static str, value: [f32; 6]) {
    with_instance(|i| i.queue.enqueue(QueueEvent::ValueMat { name: name_handle(name), value }));
}

pub fn send_attribute_bool(name: &'static str, value: bool) {
    with_instance(|i| i.queue.enqueue(QueueEvent::ValueBool { name: name_handle(name), value }));
}

/// Enum attribute: high byte is the enum-type id, low byte the ordinal.
pub fn send_attribute_enum(name: &'static str, type_id: u8, ordinal: u8) {
    with_instance(|i| {
        i.queue.enqueue(QueueEvent::ValueEnum {
            name: name_handle(name),
            value: (type_id as u16) << 8 | ordinal as u16,
        })
    });
}

/// Emits `OperateBegin` on construction and the matching `OperateEnd` on
/// drop, both stamped at the transition. An inactive guard emits nothing.
pub struct ScopedOp {
    kind: u8,
    active: bool,
}

impl ScopedOp {
    pub fn new(kind: u8) -> Self {
        ScopedOp::with_active(kind, true)
    }

    pub fn with_active(kind: u8, active: bool) -> Self {
        if active {
            with_instance(|i| {
                i.queue.enqueue(QueueEvent::OperateBegin { ns_time: time_ns(), kind })
            });
        }
        ScopedOp { kind, active }
    }
}

impl Drop for ScopedOp {
    fn drop(&mut self) {
        if self.active {
            with_instance(|i| {
                i.queue.enqueue(QueueEvent::OperateEnd { ns_time: time_ns(), kind: self.kind })
            });
        }
    }
}

enum DequeueStatus {
    DataDequeued,
    ConnectionLost,
    QueueEmpty,
}

const FRAME_HEADER_SIZE: usize = 4;

struct ClientWorker {
    inspector: Arc<Inspector>,
    staging: Vec<u8>,
    start: usize,
    offset: usize,
    lz4_buf: Vec<u8>,
    encoder: StreamEncoder,
    ref_time_thread: i64,
    last_beacon: Option<Instant>,
}

impl ClientWorker {
    fn new(inspector: Arc<Inspector>) -> Self {
        ClientWorker {
            inspector,
            staging: vec![0u8; TARGET_FRAME_SIZE * 3],
            start: 0,
            offset: 0,
            lz4_buf: vec![0u8; FRAME_HEADER_SIZE + compress_bound(TARGET_FRAME_SIZE)],
            encoder: StreamEncoder::new(),
            ref_time_thread: 0,
            last_beacon: None,
        }
    }

    fn should_exit(&self) -> bool {
        self.inspector.shutdown.load(Ordering::Acquire)
    }

    fn run(&mut self) {
        while self.inspector.time_begin.load(Ordering::Acquire) == 0 {
            if self.should_exit() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let Some((listener, data_port)) = self.bind_listener() else {
            warn!("no free data port in {}..{}", self.inspector.data_port,
                self.inspector.data_port + DATA_PORT_SCAN);
            while !self.should_exit() {
                thread::sleep(Duration::from_millis(10));
            }
            return;
        };
        self.inspector.bound_port.store(data_port, Ordering::Release);
        info!("telemetry listening on port {data_port}");

        let mut beacons: Vec<Option<UdpBroadcast>> = if self.inspector.broadcast {
            (0..BROADCAST_NUM).map(|_| UdpBroadcast::open().ok()).collect()
        } else {
            Vec::new()
        };

        let mut welcome = WelcomeMessage {
            init_begin: self.inspector.init_time,
            init_end: self.inspector.time_begin.load(Ordering::Acquire),
            ref_time: 0,
            program_name: fixed_name(&self.inspector.program_name),
        };

        loop {
            welcome.ref_time = self.ref_time_thread;
            let Some(mut sock) = self.await_client(&listener, &mut beacons, data_port) else {
                self.send_beacons(&mut beacons, -1, data_port);
                return;
            };
            // withdraw the advertisement while the single slot is taken
            self.send_beacons(&mut beacons, -1, data_port);
            self.last_beacon = None;

            if !self.confirm_protocol(&mut sock) {
                continue;
            }
            self.handle_connect(&mut sock, welcome);
            self.inspector.connected.store(false, Ordering::Release);
            debug!("viewer session ended");
            if self.should_exit() {
                self.send_beacons(&mut beacons, -1, data_port);
                return;
            }
        }
    }

    fn bind_listener(&self) -> Option<(TcpListener, u16)> {
        for i in 0..DATA_PORT_SCAN {
            let port = self.inspector.data_port + i;
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)) {
                if listener.set_nonblocking(true).is_ok() {
                    return Some((listener, port));
                }
            }
        }
        None
    }

    /// Polls for a viewer, re-advertising every three seconds and dropping
    /// (but counting) queued events so memory stays bounded while detached.
    fn await_client(
        &mut self,
        listener: &TcpListener,
        beacons: &mut [Option<UdpBroadcast>],
        data_port: u16,
    ) -> Option<TcpStream> {
        loop {
            if self.should_exit() {
                return None;
            }
            let mut discarded = 0u64;
            while self.inspector.queue.dequeue().is_some() {
                discarded += 1;
            }
            if discarded > 0 {
                self.inspector.queue.count_dropped(discarded);
            }
            match listener.accept() {
                Ok((sock, peer)) => {
                    debug!("viewer connected from {peer}");
                    let _ = sock.set_nodelay(true);
                    if let Some(size) = self.inspector.send_buffer {
                        set_send_buffer_size(&sock, size);
                    }
                    return Some(sock);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
            let due = self
                .last_beacon
                .map(|t| t.elapsed() >= BROADCAST_INTERVAL)
                .unwrap_or(true);
            if due {
                self.last_beacon = Some(Instant::now());
                let active = (epoch_seconds() - self.inspector.epoch) as i32;
                self.send_beacons(beacons, active, data_port);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn send_beacons(&self, beacons: &mut [Option<UdpBroadcast>], active_time: i32, port: u16) {
        if beacons.is_empty() {
            return;
        }
        let message = BroadcastMessage {
            broadcast_version: BROADCAST_VERSION,
            listen_port: port,
            protocol_version: PROTOCOL_VERSION,
            active_time,
            program_name: fixed_name(&self.inspector.program_name),
            pid: std::process::id() as u64,
            kind: BeaconKind::FrameCapture as u8,
        };
        let Ok(bytes) = bincode::encode_to_vec(message, BINCODE_CONFIG) else {
            return;
        };
        for (i, beacon) in beacons.iter_mut().enumerate() {
            if let Some(b) = beacon {
                if b.send(BROADCAST_PORT_BASE + i as u16, &bytes).is_err() {
                    *beacon = None;
                }
            }
        }
    }

    /// Reads the shibboleth and protocol version within the handshake
    /// timeout. A version mismatch gets an explicit status byte back.
    fn confirm_protocol(&self, sock: &mut TcpStream) -> bool {
        let mut shibboleth = [0u8; HANDSHAKE_SHIBBOLETH.len()];
        if !self.read_exact_deadline(sock, &mut shibboleth, HANDSHAKE_TIMEOUT)
            || &shibboleth != HANDSHAKE_SHIBBOLETH
        {
            return false;
        }
        let mut version = [0u8; 4];
        if !self.read_exact_deadline(sock, &mut version, HANDSHAKE_TIMEOUT) {
            return false;
        }
        let version = u32::from_le_bytes(version);
        if version != PROTOCOL_VERSION {
            info!("rejecting viewer with protocol version {version}");
            let _ = sock.write_all(&[HandshakeStatus::ProtocolMismatch as u8]);
            return false;
        }
        true
    }

    fn read_exact_deadline(&self, sock: &mut TcpStream, buf: &mut [u8], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if sock.set_read_timeout(Some(Duration::from_millis(10))).is_err() {
            return false;
        }
        let mut read = 0;
        while read < buf.len() {
            if self.should_exit() || Instant::now() > deadline {
                return false;
            }
            match sock.read(&mut buf[read..]) {
                Ok(0) => return false,
                Ok(n) => read += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(_) => return false,
            }
        }
        true
    }

    fn handle_connect(&mut self, sock: &mut TcpStream, welcome: WelcomeMessage) {
        self.inspector.connected.store(true, Ordering::Release);
        if sock.write_all(&[HandshakeStatus::Welcome as u8]).is_err() {
            return;
        }
        // fresh dictionary and staging for the new session
        self.encoder = StreamEncoder::new();
        self.start = 0;
        self.offset = 0;
        if bincode::encode_into_writer(welcome, WriterBox(sock), BINCODE_CONFIG).is_err() {
            return;
        }

        let mut keep_alive = 0u32;
        loop {
            match self.dequeue_serial(sock) {
                DequeueStatus::ConnectionLost => break,
                DequeueStatus::DataDequeued => {}
                DequeueStatus::QueueEmpty => {
                    if self.should_exit() {
                        break;
                    }
                    if self.offset != self.start {
                        if !self.commit(sock) {
                            break;
                        }
                        keep_alive = 0;
                    } else if !has_data(sock) {
                        keep_alive += 1;
                        if keep_alive >= KEEP_ALIVE_IDLE_ITERS {
                            let ka = QueueEvent::KeepAlive;
                            if !self.append_event(&ka, sock) || !self.commit(sock) {
                                break;
                            }
                            keep_alive = 0;
                        } else {
                            thread::sleep(Duration::from_micros(10));
                        }
                    }
                    let mut conn_active = true;
                    while has_data(sock) {
                        conn_active = self.handle_server_query(sock);
                        if !conn_active {
                            break;
                        }
                    }
                    if !conn_active {
                        break;
                    }
                }
            }
        }
    }

    /// Drains the queue into the staging buffer, rewriting operate times to
    /// deltas against the worker's running reference.
    fn dequeue_serial(&mut self, sock: &mut TcpStream) -> DequeueStatus {
        if self.inspector.queue.len_hint() == 0 {
            return DequeueStatus::QueueEmpty;
        }
        let mut reference = self.ref_time_thread;
        while let Some(mut item) = self.inspector.queue.dequeue() {
            item.rewrite_ref_time(&mut reference);
            if !self.append_event(&item, sock) {
                self.ref_time_thread = reference;
                return DequeueStatus::ConnectionLost;
            }
        }
        self.ref_time_thread = reference;
        DequeueStatus::DataDequeued
    }

    fn append_event(&mut self, ev: &QueueEvent, sock: &mut TcpStream) -> bool {
        let size = ev.encoded_size();
        if !self.need_data_size(size, sock) {
            return false;
        }
        match bincode::encode_into_slice(
            ev,
            &mut self.staging[self.offset..self.offset + size],
            BINCODE_CONFIG,
        ) {
            Ok(n) => {
                self.offset += n;
                true
            }
            Err(e) => {
                debug!("staging encode failed: {e}");
                false
            }
        }
    }

    fn need_data_size(&mut self, len: usize, sock: &mut TcpStream) -> bool {
        if self.offset - self.start + len > TARGET_FRAME_SIZE {
            return self.commit(sock);
        }
        true
    }

    /// Compresses the pending staging region into one framed block and sends
    /// it. The cursor wraps past two thirds of the buffer; the dictionary
    /// keeps referencing the bytes left behind.
    fn commit(&mut self, sock: &mut TcpStream) -> bool {
        if self.offset == self.start {
            return true;
        }
        let chunk_start = self.start;
        let chunk_end = self.offset;
        let n = {
            let (chunk, out) = (&self.staging[chunk_start..chunk_end], &mut self.lz4_buf);
            let n = self.encoder.compress(chunk, &mut out[FRAME_HEADER_SIZE..]);
            out[..FRAME_HEADER_SIZE].copy_from_slice(&(n as u32).to_le_bytes());
            n
        };
        if n == 0 {
            return false;
        }
        let ok = sock.write_all(&self.lz4_buf[..FRAME_HEADER_SIZE + n]).is_ok();
        if self.offset > TARGET_FRAME_SIZE * 2 {
            self.offset = 0;
        }
        self.start = self.offset;
        ok
    }

    /// Answers one back-channel query. String requests are served from the
    /// handle itself, which packs the pointer and length of the static name.
    fn handle_server_query(&mut self, sock: &mut TcpStream) -> bool {
        let mut buf = [0u8; SERVER_QUERY_PACKET_SIZE];
        if !self.read_exact_deadline(sock, &mut buf, Duration::from_millis(10)) {
            return false;
        }
        let Ok((packet, _)) =
            bincode::decode_from_slice::<ServerQueryPacket, _>(&buf, BINCODE_CONFIG)
        else {
            return false;
        };
        match packet.query_type {
            ServerQuery::String => self.send_string(packet.ptr, false, sock),
            ServerQuery::ValueName => self.send_string(packet.ptr, true, sock),
            ServerQuery::Disconnect | ServerQuery::Terminate => false,
        }
    }

    fn send_string(&mut self, ptr: u64, value_name: bool, sock: &mut TcpStream) -> bool {
        // SAFETY: the viewer only echoes handles this process emitted, and
        // every emitted handle was packed from a live &'static str.
        let text = unsafe { resolve_name_handle(ptr) }.unwrap_or("");
        let bytes = text.as_bytes().to_vec();
        let ev = if value_name {
            QueueEvent::ValueName { ptr, bytes }
        } else {
            QueueEvent::StringData { ptr, bytes }
        };
        self.append_event(&ev, sock)
    }
}

fn has_data(sock: &TcpStream) -> bool {
    if sock.set_nonblocking(true).is_err() {
        return false;
    }
    let mut byte = [0u8; 1];
    let ready = sock.peek(&mut byte);
    let _ = sock.set_nonblocking(false);
    // EOF counts as readable so the query handler can observe the close
    ready.is_ok()
}
