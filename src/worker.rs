//! Consumer side: the viewer core.
//!
//! A live capture runs two threads. The network thread reads length-prefixed
//! LZ4 blocks, decompresses them into a persistent ring (the streaming
//! dictionary window) and hands decoded buffers to the work thread through a
//! credit-gated deque. The work thread performs the handshake, walks each
//! buffer as a sequence of queue events, updates the [`DataContext`] under
//! its single lock and flushes pending server queries. A capture file loads
//! through the same context with no threads at all.

use std::collections::{HashSet, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use num_traits::FromPrimitive;

use crate::context::DataContext;
use crate::event::{DataType, FrameEvent, PropertyValue};
use crate::lz4stream::{compress_bound, StreamDecoder};
use crate::protocol::{
    server_query_space, HandshakeStatus, ServerQuery, ServerQueryPacket, WelcomeMessage,
    BINCODE_CONFIG, HANDSHAKE_SHIBBOLETH, HANDSHAKE_TIMEOUT, PROTOCOL_VERSION, TARGET_FRAME_SIZE,
};
use crate::queue::{advance_ref_time, QueueEvent};
use crate::tags::{load_context, save_context};
use crate::{Error, Result};

const HANDSHAKE_PENDING: u8 = 0xFF;
/// Buffers the network thread may read ahead of the work thread.
const NET_READ_AHEAD: i32 = 2;

enum NetEvent {
    Data(Vec<u8>),
    Closed,
}

struct NetGate {
    credits: i32,
    sock: Option<TcpStream>,
}

struct Shared {
    context: Mutex<DataContext>,
    shutdown: AtomicBool,
    connected: AtomicBool,
    handshake: AtomicU8,
    bytes: AtomicU64,
    dec_bytes: AtomicU64,
    net_read: Mutex<VecDeque<NetEvent>>,
    net_read_cv: Condvar,
    net_write: Mutex<NetGate>,
    net_write_cv: Condvar,
}

impl Shared {
    fn new() -> Self {
        Shared {
            context: Mutex::new(DataContext::new()),
            shutdown: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            handshake: AtomicU8::new(HANDSHAKE_PENDING),
            bytes: AtomicU64::new(0),
            dec_bytes: AtomicU64::new(0),
            net_read: Mutex::new(VecDeque::new()),
            net_read_cv: Condvar::new(),
            net_write: Mutex::new(NetGate { credits: 0, sock: None }),
            net_write_cv: Condvar::new(),
        }
    }

    fn should_exit(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn push_net(&self, event: NetEvent) {
        let mut queue = self.net_read.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(event);
        self.net_read_cv.notify_one();
    }

    fn close_session(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.net_read_cv.notify_all();
        self.net_write_cv.notify_all();
    }
}

/// Per-session decode state owned by the work thread.
struct SessionState {
    ref_time: i64,
    pending_names: HashSet<u64>,
    query_prio: Vec<ServerQueryPacket>,
    query_queue: Vec<ServerQueryPacket>,
    space_left: usize,
}

impl SessionState {
    fn new(ref_time: i64, space_left: usize) -> Self {
        SessionState {
            ref_time,
            pending_names: HashSet::new(),
            query_prio: Vec::new(),
            query_queue: Vec::new(),
            space_left,
        }
    }

    fn query(&mut self, query_type: ServerQuery, ptr: u64, extra: u32) {
        let packet = ServerQueryPacket::new(query_type, ptr, extra);
        if query_type.is_prio() {
            self.query_prio.push(packet);
        } else {
            self.query_queue.push(packet);
        }
    }

    /// Asks for a name handle at most once per session.
    fn query_value_name(&mut self, handle: u64) {
        if self.pending_names.insert(handle) {
            self.query(ServerQuery::ValueName, handle, 0);
        }
    }

    /// Sends as many queued queries as the rate-limit window allows,
    /// prioritized queue first, one `send` per queue.
    fn flush_queries(&mut self, sock: &mut TcpStream) -> bool {
        for queue in [&mut self.query_prio, &mut self.query_queue] {
            if self.space_left == 0 || queue.is_empty() {
                continue;
            }
            let to_send = self.space_left.min(queue.len());
            let mut bytes = Vec::with_capacity(to_send * 13);
            for packet in queue.iter().take(to_send) {
                match bincode::encode_to_vec(*packet, BINCODE_CONFIG) {
                    Ok(mut b) => bytes.append(&mut b),
                    Err(_) => return false,
                }
            }
            if sock.write_all(&bytes).is_err() {
                return false;
            }
            self.space_left -= to_send;
            queue.drain(..to_send);
        }
        true
    }
}

/// Applies one decoded event to the data model and session state.
fn dispatch_event(ctx: &mut DataContext, st: &mut SessionState, ev: QueueEvent) {
    match ev {
        QueueEvent::OperateBegin { ns_time, kind } => {
            let t = advance_ref_time(&mut st.ref_time, ns_time);
            let start = t - ctx.base_time;
            ctx.begin_op(start, kind);
        }
        QueueEvent::OperateEnd { ns_time, kind } => {
            let t = advance_ref_time(&mut st.ref_time, ns_time);
            let end = t - ctx.base_time;
            ctx.end_op(end, kind);
        }
        QueueEvent::FrameMark { ns_time } => {
            // frame marks carry absolute time, not deltas
            ctx.mark_frame(ns_time - ctx.base_time);
        }
        QueueEvent::ValueUint32 { name, value } => {
            push_value(ctx, st, DataType::Uint32, name, value.to_le_bytes().to_vec());
        }
        QueueEvent::ValueColor { name, value } => {
            push_value(ctx, st, DataType::Color, name, value.to_le_bytes().to_vec());
        }
        QueueEvent::ValueInt { name, value } => {
            push_value(ctx, st, DataType::Int, name, value.to_le_bytes().to_vec());
        }
        QueueEvent::ValueFloat { name, value } => {
            push_value(ctx, st, DataType::Float, name, value.to_le_bytes().to_vec());
        }
        QueueEvent::ValueFloat4 { name, value } => {
            let mut data = Vec::with_capacity(16);
            for v in value {
                data.extend_from_slice(&v.to_le_bytes());
            }
            push_value(ctx, st, DataType::Float4, name, data);
        }
        QueueEvent::ValueMat { name, value } => {
            let mut data = Vec::with_capacity(24);
            for v in value {
                data.extend_from_slice(&v.to_le_bytes());
            }
            push_value(ctx, st, DataType::Mat, name, data);
        }
        QueueEvent::ValueBool { name, value } => {
            push_value(ctx, st, DataType::Bool, name, vec![value as u8]);
        }
        QueueEvent::ValueEnum { name, value } => {
            push_value(ctx, st, DataType::Enum, name, value.to_le_bytes().to_vec());
        }
        QueueEvent::ValueName { ptr, bytes } => {
            ctx.insert_name(ptr, String::from_utf8_lossy(&bytes).into_owned());
            st.pending_names.remove(&ptr);
            st.space_left += 1;
        }
        QueueEvent::StringData { .. } => {
            st.space_left += 1;
        }
        QueueEvent::KeepAlive => {}
        // texture payloads are viewer-frontend concerns; skip on the wire
        QueueEvent::TextureSampler { .. }
        | QueueEvent::TextureData { .. }
        | QueueEvent::PixelsData { .. } => {}
    }
}

fn push_value(ctx: &mut DataContext, st: &mut SessionState, ty: DataType, name: u64, data: Vec<u8>) {
    if let Some(unresolved) = ctx.push_value(PropertyValue { ty, name, data }) {
        if !ctx.name_map.contains_key(&unresolved) {
            st.query_value_name(unresolved);
        }
    }
}

/// Viewer core: either a live two-thread capture session or a loaded file.
pub struct Worker {
    shared: Arc<Shared>,
    net_thread: Option<JoinHandle<()>>,
    work_thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Connects to an instrumented process and starts capturing.
    pub fn connect(addr: impl Into<String>, port: u16) -> Result<Worker> {
        let addr = addr.into();
        let shared = Arc::new(Shared::new());

        let work_thread = {
            let shared = Arc::clone(&shared);
            let addr = addr.clone();
            thread::Builder::new()
                .name("rinspect-work".into())
                .spawn(move || exec_loop(&shared, &addr, port))?
        };
        let net_thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("rinspect-net".into())
                .spawn(move || net_loop(&shared))?
        };
        Ok(Worker { shared, net_thread: Some(net_thread), work_thread: Some(work_thread) })
    }

    /// Loads a capture file. No threads are involved.
    pub fn open(path: impl AsRef<Path>) -> Result<Worker> {
        let bytes = std::fs::read(path)?;
        let context = load_context(&bytes).map_err(|e| {
            log::error!("capture load failed: {e}");
            e
        })?;
        let shared = Arc::new(Shared::new());
        shared.shutdown.store(true, Ordering::Release);
        *shared.context.lock().unwrap_or_else(|e| e.into_inner()) = context;
        Ok(Worker { shared, net_thread: None, work_thread: None })
    }

    /// Persists the current data model.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = {
            let context = self.context();
            save_context(&context)
        };
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shared.close_session();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Handshake outcome, once known.
    pub fn handshake(&self) -> Option<HandshakeStatus> {
        HandshakeStatus::from_u8(self.shared.handshake.load(Ordering::Acquire))
    }

    /// Compressed bytes received from the wire.
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes.load(Ordering::Relaxed)
    }

    /// Bytes after decompression.
    pub fn bytes_decoded(&self) -> u64 {
        self.shared.dec_bytes.load(Ordering::Relaxed)
    }

    /// The data model under its lock. Frontends hold this briefly.
    pub fn context(&self) -> MutexGuard<'_, DataContext> {
        self.shared.context.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn frame_count(&self) -> usize {
        self.context().frame_count()
    }

    pub fn last_time(&self) -> i64 {
        self.context().last_time
    }

    pub fn errors(&self) -> Vec<String> {
        self.context().error_messages.clone()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shared.close_session();
        if let Some(handle) = self.net_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.work_thread.take() {
            let _ = handle.join();
        }
    }
}

fn read_exact_poll(shared: &Shared, sock: &mut TcpStream, buf: &mut [u8]) -> bool {
    let mut read = 0;
    while read < buf.len() {
        if shared.should_exit() {
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

/// Same as [`read_exact_poll`] but gives up after `timeout` (handshake).
fn read_exact_deadline(
    shared: &Shared,
    sock: &mut TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    let mut read = 0;
    while read < buf.len() {
        if shared.should_exit() || Instant::now() > deadline {
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

fn query_terminate(sock: &mut TcpStream) {
    let packet = ServerQueryPacket::new(ServerQuery::Terminate, 0, 0);
    if let Ok(bytes) = bincode::encode_to_vec(packet, BINCODE_CONFIG) {
        let _ = sock.write_all(&bytes);
    }
}

fn connect_with_retry(shared: &Shared, addr: &str, port: u16) -> Option<TcpStream> {
    loop {
        if shared.should_exit() {
            return None;
        }
        let resolved = (addr, port).to_socket_addrs().ok().and_then(|mut a| a.next());
        if let Some(target) = resolved {
            if let Ok(sock) = TcpStream::connect_timeout(&target, Duration::from_millis(500)) {
                let _ = sock.set_nodelay(true);
                return Some(sock);
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Work thread: handshake, then dispatch decoded buffers into the model.
fn exec_loop(shared: &Shared, addr: &str, port: u16) {
    let Some(mut sock) = connect_with_retry(shared, addr, port) else {
        shared.close_session();
        shared.push_net(NetEvent::Closed);
        return;
    };
    let _ = sock.set_read_timeout(Some(Duration::from_millis(10)));

    if sock.write_all(HANDSHAKE_SHIBBOLETH).is_err()
        || sock.write_all(&PROTOCOL_VERSION.to_le_bytes()).is_err()
    {
        shared.handshake.store(HandshakeStatus::Dropped as u8, Ordering::Release);
        shared.close_session();
        return;
    }

    let mut status = [0u8; 1];
    if !read_exact_deadline(shared, &mut sock, &mut status, HANDSHAKE_TIMEOUT) {
        shared.handshake.store(HandshakeStatus::Dropped as u8, Ordering::Release);
        shared.close_session();
        return;
    }
    let status = HandshakeStatus::from_u8(status[0]).unwrap_or(HandshakeStatus::Dropped);
    shared.handshake.store(status as u8, Ordering::Release);
    if status != HandshakeStatus::Welcome {
        let err = if status == HandshakeStatus::ProtocolMismatch {
            Error::ProtocolMismatch
        } else {
            Error::HandshakeRejected(status)
        };
        info!("handshake failed: {err}");
        shared
            .context
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .throw_error(err.to_string());
        shared.close_session();
        return;
    }

    let mut welcome_bytes = [0u8; 88];
    if !read_exact_deadline(shared, &mut sock, &mut welcome_bytes, HANDSHAKE_TIMEOUT) {
        shared.handshake.store(HandshakeStatus::Dropped as u8, Ordering::Release);
        shared.close_session();
        return;
    }
    let Ok((welcome, _)) =
        bincode::decode_from_slice::<WelcomeMessage, _>(&welcome_bytes, BINCODE_CONFIG)
    else {
        shared.close_session();
        return;
    };

    let mut state = SessionState::new(welcome.ref_time, server_query_space(&sock));
    {
        let mut ctx = shared.context.lock().unwrap_or_else(|e| e.into_inner());
        ctx.base_time = welcome.init_begin;
        let init_end = welcome.init_end - ctx.base_time;
        ctx.frame_data.frames.push(FrameEvent::at(init_end));
        ctx.last_time = init_end;
    }
    debug!(
        "welcome from {:?}, base time {}",
        crate::protocol::name_text(&welcome.program_name),
        welcome.init_begin
    );

    // hand the socket to the network thread and open its read-ahead window
    {
        let mut gate = shared.net_write.lock().unwrap_or_else(|e| e.into_inner());
        match sock.try_clone() {
            Ok(clone) => gate.sock = Some(clone),
            Err(_) => {
                drop(gate);
                shared.close_session();
                return;
            }
        }
        gate.credits = NET_READ_AHEAD;
        shared.net_write_cv.notify_one();
    }
    shared.connected.store(true, Ordering::Release);

    loop {
        if shared.should_exit() {
            query_terminate(&mut sock);
            shared.close_session();
            return;
        }

        let event = {
            let mut queue = shared.net_read.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(event) = queue.pop_front() {
                    break event;
                }
                if shared.should_exit() {
                    break NetEvent::Closed;
                }
                queue = shared.net_read_cv.wait(queue).unwrap_or_else(|e| e.into_inner());
            }
        };
        let buffer = match event {
            NetEvent::Data(buffer) => buffer,
            NetEvent::Closed => {
                shared.close_session();
                return;
            }
        };

        let mut ctx = shared.context.lock().unwrap_or_else(|e| e.into_inner());
        let mut pos = 0;
        while pos < buffer.len() {
            match bincode::decode_from_slice::<QueueEvent, _>(&buffer[pos..], BINCODE_CONFIG) {
                Ok((ev, used)) => {
                    pos += used;
                    dispatch_event(&mut ctx, &mut state, ev);
                }
                Err(e) => {
                    // alignment is lost; the session cannot continue
                    let err = match e {
                        bincode::error::DecodeError::UnexpectedVariant { found, .. } => {
                            Error::UnknownTag(found as u8)
                        }
                        other => Error::Decode(other),
                    };
                    warn!("wire decode failed: {err}");
                    ctx.throw_error(err.to_string());
                    drop(ctx);
                    query_terminate(&mut sock);
                    shared.close_session();
                    return;
                }
            }
        }

        {
            let mut gate = shared.net_write.lock().unwrap_or_else(|e| e.into_inner());
            gate.credits += 1;
            shared.net_write_cv.notify_one();
        }

        if !state.flush_queries(&mut sock) {
            drop(ctx);
            shared.close_session();
            return;
        }
    }
}

/// Network thread: framed reads, streaming decompression, flow control.
fn net_loop(shared: &Shared) {
    // wait for the work thread to finish the handshake
    let mut sock = {
        let mut gate = shared.net_write.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if shared.should_exit() {
                shared.push_net(NetEvent::Closed);
                return;
            }
            if let Some(sock) = gate.sock.take() {
                break sock;
            }
            gate = shared.net_write_cv.wait(gate).unwrap_or_else(|e| e.into_inner());
        }
    };
    let _ = sock.set_read_timeout(Some(Duration::from_millis(10)));

    let mut ring = vec![0u8; TARGET_FRAME_SIZE * 3];
    let mut ring_offset = 0usize;
    let mut lz4_buf = vec![0u8; compress_bound(TARGET_FRAME_SIZE)];
    let mut decoder = StreamDecoder::new();

    loop {
        {
            let mut gate = shared.net_write.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if shared.should_exit() {
                    shared.push_net(NetEvent::Closed);
                    return;
                }
                if gate.credits > 0 {
                    gate.credits -= 1;
                    break;
                }
                gate = shared.net_write_cv.wait(gate).unwrap_or_else(|e| e.into_inner());
            }
        }

        let mut len_bytes = [0u8; 4];
        if !read_exact_poll(shared, &mut sock, &mut len_bytes) {
            shared.push_net(NetEvent::Closed);
            return;
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > lz4_buf.len() {
            warn!("oversized compressed frame ({len} bytes)");
            shared.push_net(NetEvent::Closed);
            return;
        }
        if !read_exact_poll(shared, &mut sock, &mut lz4_buf[..len]) {
            shared.push_net(NetEvent::Closed);
            return;
        }
        shared.bytes.fetch_add(4 + len as u64, Ordering::Relaxed);

        let out = &mut ring[ring_offset..ring_offset + TARGET_FRAME_SIZE];
        let Some(size) = decoder.decompress(&lz4_buf[..len], out) else {
            warn!("corrupt compressed frame");
            shared.push_net(NetEvent::Closed);
            return;
        };
        shared.dec_bytes.fetch_add(size as u64, Ordering::Relaxed);

        shared.push_net(NetEvent::Data(ring[ring_offset..ring_offset + size].to_vec()));

        ring_offset += size;
        if ring_offset > TARGET_FRAME_SIZE * 2 {
            ring_offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::name_handle;

    fn session() -> (DataContext, SessionState) {
        let mut ctx = DataContext::new();
        ctx.base_time = 0;
        (ctx, SessionState::new(0, 64))
    }

    #[test]
    fn operate_times_rebuild_from_deltas() {
        let (mut ctx, mut st) = session();
        ctx.base_time = 500_000_000;
        st.ref_time = 1_000_000_000;
        // deltas as the producer would have rewritten them
        dispatch_event(&mut ctx, &mut st, QueueEvent::OperateBegin { ns_time: 0, kind: 5 });
        dispatch_event(&mut ctx, &mut st, QueueEvent::OperateEnd { ns_time: 20_000, kind: 5 });
        dispatch_event(
            &mut ctx,
            &mut st,
            QueueEvent::FrameMark { ns_time: 1_000_030_000 },
        );
        assert_eq!(ctx.op_tasks.len(), 1);
        assert_eq!(ctx.op_tasks[0].start, 500_000_000);
        assert_eq!(ctx.op_tasks[0].end, 500_020_000);
        assert_eq!(ctx.op_tasks[0].kind, 5);
        assert_eq!(ctx.frame_data.frames.last().unwrap().start, 500_030_000);
    }

    #[test]
    fn unresolved_name_queried_exactly_once() {
        let (mut ctx, mut st) = session();
        ctx.begin_op(0, 0);
        let handle = 0xCAFE_BABE;
        dispatch_event(&mut ctx, &mut st, QueueEvent::ValueFloat { name: handle, value: 1.0 });
        assert_eq!(st.query_prio.len(), 1);
        assert_eq!(st.query_prio[0].query_type, ServerQuery::ValueName);
        assert_eq!(st.query_prio[0].ptr, handle);
        assert!(st.query_queue.is_empty());

        // a second value before the response arrives emits no further query
        dispatch_event(&mut ctx, &mut st, QueueEvent::ValueFloat { name: handle, value: 2.0 });
        assert_eq!(st.query_prio.len(), 1);

        let space_before = st.space_left;
        dispatch_event(
            &mut ctx,
            &mut st,
            QueueEvent::ValueName { ptr: handle, bytes: b"color".to_vec() },
        );
        assert_eq!(ctx.name_map[&handle], "color");
        assert_eq!(st.space_left, space_before + 1);
        assert!(!st.pending_names.contains(&handle));

        // resolved handles never query again
        dispatch_event(&mut ctx, &mut st, QueueEvent::ValueFloat { name: handle, value: 3.0 });
        assert_eq!(st.query_prio.len(), 1);
    }

    #[test]
    fn string_data_only_credits_the_window() {
        let (mut ctx, mut st) = session();
        let before = st.space_left;
        dispatch_event(
            &mut ctx,
            &mut st,
            QueueEvent::StringData { ptr: 1, bytes: b"x".to_vec() },
        );
        assert_eq!(st.space_left, before + 1);
        assert!(ctx.name_map.is_empty());
    }

    #[test]
    fn first_resolution_wins() {
        let (mut ctx, mut st) = session();
        dispatch_event(
            &mut ctx,
            &mut st,
            QueueEvent::ValueName { ptr: 9, bytes: b"first".to_vec() },
        );
        dispatch_event(
            &mut ctx,
            &mut st,
            QueueEvent::ValueName { ptr: 9, bytes: b"second".to_vec() },
        );
        assert_eq!(ctx.name_map[&9], "first");
    }

    #[test]
    fn values_without_open_op_do_not_query() {
        let (mut ctx, mut st) = session();
        let handle = name_handle("orphan");
        dispatch_event(&mut ctx, &mut st, QueueEvent::ValueInt { name: handle, value: 4 });
        assert!(st.query_prio.is_empty());
        assert!(ctx.properties.is_empty());
    }
}
