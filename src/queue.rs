//! Lock-free event queue between instrumentation call sites and the client
//! worker, plus the byte codec for queue items on the wire.
//!
//! Every item is a one-byte tag followed by a packed little-endian payload.
//! The encoded size of each fixed variant is known statically through
//! [`QUEUE_DATA_SIZE`]; string transfers append a u16 length and raw bytes
//! after their fixed part.

use std::sync::atomic::{AtomicU64, Ordering};

use bincode::de::Decoder;
use bincode::enc::Encoder;
use bincode::error::AllowedEnumVariants::Range;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use crossbeam_queue::SegQueue;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::protocol::{decode_u16_bytes, U16SizeString};

/// Wire tag of a queue item. The numeric order is the wire format.
#[derive(FromPrimitive, ToPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueType {
    OperateBegin = 0,
    OperateEnd = 1,
    FrameMarkMsg = 2,
    ValueDataUint32 = 3,
    ValueDataFloat4 = 4,
    ValueDataMat4 = 5,
    ValueDataInt = 6,
    ValueDataColor = 7,
    ValueDataFloat = 8,
    ValueDataBool = 9,
    ValueDataEnum = 10,
    TextureSampler = 11,
    TextureData = 12,
    KeepAlive = 13,
    StringData = 14,
    ValueName = 15,
    PixelsData = 16,
}

pub const QUEUE_TYPE_COUNT: usize = 17;

/// Encoded size of the fixed part of every variant, indexed by tag.
/// String transfers (`StringData` and above except none) additionally carry
/// `u16 len + len` bytes after this.
pub const QUEUE_DATA_SIZE: [usize; QUEUE_TYPE_COUNT] = [
    1 + 8 + 1,             // OperateBegin
    1 + 8 + 1,             // OperateEnd
    1 + 8,                 // FrameMarkMsg
    1 + 8 + 4,             // ValueDataUint32
    1 + 8 + 16,            // ValueDataFloat4
    1 + 8 + 24,            // ValueDataMat4 (six floats, affine 2x3; tag name is legacy)
    1 + 8 + 4,             // ValueDataInt
    1 + 8 + 4,             // ValueDataColor
    1 + 8 + 4,             // ValueDataFloat
    1 + 8 + 1,             // ValueDataBool
    1 + 8 + 2,             // ValueDataEnum
    1 + 8,                 // TextureSampler
    1 + 8 + 1 + 4 + 4 + 8 + 8, // TextureData
    1,                     // KeepAlive
    1 + 8,                 // StringData
    1 + 8,                 // ValueName
    1 + 8,                 // PixelsData
];

/// One instrumentation event.
///
/// `ValueMat` carries six floats: the affine 2x3 matrix interpretation of the
/// legacy `ValueDataMat4` tag.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueEvent {
    OperateBegin { ns_time: i64, kind: u8 },
    OperateEnd { ns_time: i64, kind: u8 },
    FrameMark { ns_time: i64 },
    ValueUint32 { name: u64, value: u32 },
    ValueFloat4 { name: u64, value: [f32; 4] },
    ValueMat { name: u64, value: [f32; 6] },
    ValueInt { name: u64, value: i32 },
    ValueColor { name: u64, value: u32 },
    ValueFloat { name: u64, value: f32 },
    ValueBool { name: u64, value: bool },
    ValueEnum { name: u64, value: u16 },
    TextureSampler { sampler: u64 },
    TextureData { sampler: u64, format: u8, width: i32, height: i32, row_bytes: u64, pixels: u64 },
    KeepAlive,
    StringData { ptr: u64, bytes: Vec<u8> },
    ValueName { ptr: u64, bytes: Vec<u8> },
    PixelsData { ptr: u64, bytes: Vec<u8> },
}

impl QueueEvent {
    pub fn tag(&self) -> QueueType {
        match self {
            QueueEvent::OperateBegin { .. } => QueueType::OperateBegin,
            QueueEvent::OperateEnd { .. } => QueueType::OperateEnd,
            QueueEvent::FrameMark { .. } => QueueType::FrameMarkMsg,
            QueueEvent::ValueUint32 { .. } => QueueType::ValueDataUint32,
            QueueEvent::ValueFloat4 { .. } => QueueType::ValueDataFloat4,
            QueueEvent::ValueMat { .. } => QueueType::ValueDataMat4,
            QueueEvent::ValueInt { .. } => QueueType::ValueDataInt,
            QueueEvent::ValueColor { .. } => QueueType::ValueDataColor,
            QueueEvent::ValueFloat { .. } => QueueType::ValueDataFloat,
            QueueEvent::ValueBool { .. } => QueueType::ValueDataBool,
            QueueEvent::ValueEnum { .. } => QueueType::ValueDataEnum,
            QueueEvent::TextureSampler { .. } => QueueType::TextureSampler,
            QueueEvent::TextureData { .. } => QueueType::TextureData,
            QueueEvent::KeepAlive => QueueType::KeepAlive,
            QueueEvent::StringData { .. } => QueueType::StringData,
            QueueEvent::ValueName { .. } => QueueType::ValueName,
            QueueEvent::PixelsData { .. } => QueueType::PixelsData,
        }
    }

    /// Total encoded size, including the variable tail of string transfers.
    pub fn encoded_size(&self) -> usize {
        let fixed = QUEUE_DATA_SIZE[self.tag() as usize];
        match self {
            QueueEvent::StringData { bytes, .. }
            | QueueEvent::ValueName { bytes, .. }
            | QueueEvent::PixelsData { bytes, .. } => fixed + 2 + bytes.len(),
            _ => fixed,
        }
    }

    /// Rewrites an operate timestamp to its delta against the running
    /// reference, advancing the reference. Other variants are untouched.
    pub fn rewrite_ref_time(&mut self, reference: &mut i64) {
        match self {
            QueueEvent::OperateBegin { ns_time, .. } | QueueEvent::OperateEnd { ns_time, .. } => {
                let t = *ns_time;
                *ns_time = t - *reference;
                *reference = t;
            }
            _ => {}
        }
    }
}

/// Decode-side inverse of [`QueueEvent::rewrite_ref_time`].
pub fn advance_ref_time(reference: &mut i64, delta: i64) -> i64 {
    *reference += delta;
    *reference
}

impl Encode for QueueEvent {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.tag().to_u8().unwrap().encode(encoder)?;
        match self {
            QueueEvent::OperateBegin { ns_time, kind }
            | QueueEvent::OperateEnd { ns_time, kind } => {
                ns_time.encode(encoder)?;
                kind.encode(encoder)
            }
            QueueEvent::FrameMark { ns_time } => ns_time.encode(encoder),
            QueueEvent::ValueUint32 { name, value } | QueueEvent::ValueColor { name, value } => {
                name.encode(encoder)?;
                value.encode(encoder)
            }
            QueueEvent::ValueFloat4 { name, value } => {
                name.encode(encoder)?;
                value.encode(encoder)
            }
            QueueEvent::ValueMat { name, value } => {
                name.encode(encoder)?;
                value.encode(encoder)
            }
            QueueEvent::ValueInt { name, value } => {
                name.encode(encoder)?;
                value.encode(encoder)
            }
            QueueEvent::ValueFloat { name, value } => {
                name.encode(encoder)?;
                value.encode(encoder)
            }
            QueueEvent::ValueBool { name, value } => {
                name.encode(encoder)?;
                value.encode(encoder)
            }
            QueueEvent::ValueEnum { name, value } => {
                name.encode(encoder)?;
                value.encode(encoder)
            }
            QueueEvent::TextureSampler { sampler } => sampler.encode(encoder),
            QueueEvent::TextureData { sampler, format, width, height, row_bytes, pixels } => {
                sampler.encode(encoder)?;
                format.encode(encoder)?;
                width.encode(encoder)?;
                height.encode(encoder)?;
                row_bytes.encode(encoder)?;
                pixels.encode(encoder)
            }
            QueueEvent::KeepAlive => Ok(()),
            QueueEvent::StringData { ptr, bytes }
            | QueueEvent::ValueName { ptr, bytes }
            | QueueEvent::PixelsData { ptr, bytes } => {
                ptr.encode(encoder)?;
                U16SizeString(bytes.as_slice()).encode(encoder)
            }
        }
    }
}

bincode::impl_borrow_decode!(QueueEvent);

impl<Ctx> Decode<Ctx> for QueueEvent {
    fn decode<D: Decoder<Context = Ctx>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let tag = u8::decode(decoder)?;
        let Some(tag) = QueueType::from_u8(tag) else {
            return Err(DecodeError::UnexpectedVariant {
                type_name: "QueueType",
                allowed: &Range { min: 0, max: QueueType::PixelsData as u32 },
                found: tag.into(),
            });
        };
        let ev = match tag {
            QueueType::OperateBegin => QueueEvent::OperateBegin {
                ns_time: i64::decode(decoder)?,
                kind: u8::decode(decoder)?,
            },
            QueueType::OperateEnd => QueueEvent::OperateEnd {
                ns_time: i64::decode(decoder)?,
                kind: u8::decode(decoder)?,
            },
            QueueType::FrameMarkMsg => QueueEvent::FrameMark { ns_time: i64::decode(decoder)? },
            QueueType::ValueDataUint32 => QueueEvent::ValueUint32 {
                name: u64::decode(decoder)?,
                value: u32::decode(decoder)?,
            },
            QueueType::ValueDataFloat4 => QueueEvent::ValueFloat4 {
                name: u64::decode(decoder)?,
                value: <[f32; 4]>::decode(decoder)?,
            },
            QueueType::ValueDataMat4 => QueueEvent::ValueMat {
                name: u64::decode(decoder)?,
                value: <[f32; 6]>::decode(decoder)?,
            },
            QueueType::ValueDataInt => QueueEvent::ValueInt {
                name: u64::decode(decoder)?,
                value: i32::decode(decoder)?,
            },
            QueueType::ValueDataColor => QueueEvent::ValueColor {
                name: u64::decode(decoder)?,
                value: u32::decode(decoder)?,
            },
            QueueType::ValueDataFloat => QueueEvent::ValueFloat {
                name: u64::decode(decoder)?,
                value: f32::decode(decoder)?,
            },
            QueueType::ValueDataBool => QueueEvent::ValueBool {
                name: u64::decode(decoder)?,
                value: bool::decode(decoder)?,
            },
            QueueType::ValueDataEnum => QueueEvent::ValueEnum {
                name: u64::decode(decoder)?,
                value: u16::decode(decoder)?,
            },
            QueueType::TextureSampler => {
                QueueEvent::TextureSampler { sampler: u64::decode(decoder)? }
            }
            QueueType::TextureData => QueueEvent::TextureData {
                sampler: u64::decode(decoder)?,
                format: u8::decode(decoder)?,
                width: i32::decode(decoder)?,
                height: i32::decode(decoder)?,
                row_bytes: u64::decode(decoder)?,
                pixels: u64::decode(decoder)?,
            },
            QueueType::KeepAlive => QueueEvent::KeepAlive,
            QueueType::StringData => QueueEvent::StringData {
                ptr: u64::decode(decoder)?,
                bytes: decode_u16_bytes(decoder)?,
            },
            QueueType::ValueName => QueueEvent::ValueName {
                ptr: u64::decode(decoder)?,
                bytes: decode_u16_bytes(decoder)?,
            },
            QueueType::PixelsData => QueueEvent::PixelsData {
                ptr: u64::decode(decoder)?,
                bytes: decode_u16_bytes(decoder)?,
            },
        };
        Ok(ev)
    }
}

/// Unbounded lock-free MPSC queue from instrumentation threads to the client
/// worker. Push never blocks on the consumer; storage grows in blocks, so
/// steady-state enqueues are allocation-free.
pub struct EventQueue {
    items: SegQueue<QueueEvent>,
    frame_count: AtomicU64,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            items: SegQueue::new(),
            frame_count: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn enqueue(&self, ev: QueueEvent) {
        self.items.push(ev);
    }

    pub fn dequeue(&self) -> Option<QueueEvent> {
        self.items.pop()
    }

    pub fn len_hint(&self) -> usize {
        self.items.len()
    }

    pub fn bump_frame(&self) -> u64 {
        self.frame_count.fetch_add(1, Ordering::Relaxed)
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    pub fn count_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue::new()
    }
}

const HANDLE_PTR_MASK: u64 = (1 << 48) - 1;

/// Packs a static attribute name into its 64-bit wire handle.
///
/// The pointer occupies the low 48 bits and the byte length the high 16, so
/// the producer can reconstruct the string when a viewer queries the handle
/// without keeping a registry on the hot path.
pub fn name_handle(name: &'static str) -> u64 {
    let ptr = name.as_ptr() as u64;
    debug_assert!(name.len() < (1 << 16));
    debug_assert_eq!(ptr & !HANDLE_PTR_MASK, 0);
    ((name.len() as u64) << 48) | (ptr & HANDLE_PTR_MASK)
}

/// Reconstructs the name a handle was packed from.
///
/// # Safety
///
/// `handle` must have been produced by [`name_handle`] in this process, i.e.
/// its pointer bits address a live `&'static str` of the packed length. The
/// client worker only calls this with handles it previously emitted and the
/// viewer echoed back.
pub unsafe fn resolve_name_handle(handle: u64) -> Option<&'static str> {
    let len = (handle >> 48) as usize;
    let ptr = (handle & HANDLE_PTR_MASK) as *const u8;
    if ptr.is_null() || len == 0 {
        return None;
    }
    let bytes = std::slice::from_raw_parts(ptr, len);
    std::str::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BINCODE_CONFIG;
    use std::sync::Arc;

    fn roundtrip(ev: QueueEvent) -> (QueueEvent, usize) {
        let bytes = bincode::encode_to_vec(&ev, BINCODE_CONFIG).unwrap();
        assert_eq!(bytes.len(), ev.encoded_size(), "size table disagrees for {:?}", ev.tag());
        let (back, used): (QueueEvent, usize) =
            bincode::decode_from_slice(&bytes, BINCODE_CONFIG).unwrap();
        assert_eq!(used, bytes.len());
        (back, used)
    }

    #[test]
    fn size_table_matches_encoded_sizes() {
        let events = [
            QueueEvent::OperateBegin { ns_time: 1, kind: 5 },
            QueueEvent::OperateEnd { ns_time: 2, kind: 5 },
            QueueEvent::FrameMark { ns_time: 3 },
            QueueEvent::ValueUint32 { name: 1, value: 2 },
            QueueEvent::ValueFloat4 { name: 1, value: [0.0; 4] },
            QueueEvent::ValueMat { name: 1, value: [0.0; 6] },
            QueueEvent::ValueInt { name: 1, value: -2 },
            QueueEvent::ValueColor { name: 1, value: 0xFF00FF00 },
            QueueEvent::ValueFloat { name: 1, value: 1.5 },
            QueueEvent::ValueBool { name: 1, value: true },
            QueueEvent::ValueEnum { name: 1, value: 0x0102 },
            QueueEvent::TextureSampler { sampler: 9 },
            QueueEvent::TextureData {
                sampler: 9,
                format: 1,
                width: 16,
                height: 16,
                row_bytes: 64,
                pixels: 77,
            },
            QueueEvent::KeepAlive,
        ];
        for ev in events {
            let (back, _) = roundtrip(ev.clone());
            assert_eq!(back, ev);
        }
    }

    #[test]
    fn string_transfer_roundtrip() {
        let ev = QueueEvent::ValueName { ptr: 0xCAFE_BABE, bytes: b"color".to_vec() };
        let bytes = bincode::encode_to_vec(&ev, BINCODE_CONFIG).unwrap();
        assert_eq!(bytes.len(), QUEUE_DATA_SIZE[QueueType::ValueName as usize] + 2 + 5);
        let (back, _): (QueueEvent, usize) =
            bincode::decode_from_slice(&bytes, BINCODE_CONFIG).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let err: Result<(QueueEvent, usize), _> =
            bincode::decode_from_slice(&[200u8, 0, 0], BINCODE_CONFIG);
        assert!(err.is_err());
    }

    #[test]
    fn ref_time_rewrite_roundtrip() {
        let mut reference = 1_000_000_000i64;
        let mut ev = QueueEvent::OperateBegin { ns_time: 1_000_020_000, kind: 1 };
        ev.rewrite_ref_time(&mut reference);
        let QueueEvent::OperateBegin { ns_time: delta, .. } = ev else { unreachable!() };
        assert_eq!(delta, 20_000);
        assert_eq!(reference, 1_000_020_000);

        let mut decode_ref = 1_000_000_000i64;
        let absolute = advance_ref_time(&mut decode_ref, delta);
        assert_eq!(absolute, 1_000_020_000);
        assert_eq!(decode_ref, absolute);
    }

    #[test]
    fn name_handle_roundtrip() {
        let name: &'static str = "triangles";
        let handle = name_handle(name);
        // SAFETY: handle was just packed from a live static str.
        let back = unsafe { resolve_name_handle(handle) };
        assert_eq!(back, Some(name));
        // SAFETY: a zero handle carries a null pointer and must resolve to None.
        assert_eq!(unsafe { resolve_name_handle(0) }, None);
    }

    #[test]
    fn dropped_counter_accumulates() {
        let queue = EventQueue::new();
        assert_eq!(queue.dropped(), 0);
        queue.count_dropped(3);
        queue.count_dropped(2);
        assert_eq!(queue.dropped(), 5);
    }

    #[test]
    fn mpsc_preserves_per_thread_order() {
        const THREADS: u64 = 4;
        const ITEMS: u64 = 2_000;
        let queue = Arc::new(EventQueue::new());
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                for i in 0..ITEMS {
                    queue.enqueue(QueueEvent::ValueUint32 {
                        name: t,
                        value: i as u32,
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = vec![0u32; THREADS as usize];
        let mut total = 0u64;
        while let Some(ev) = queue.dequeue() {
            let QueueEvent::ValueUint32 { name, value } = ev else { unreachable!() };
            let next = &mut seen[name as usize];
            assert_eq!(value, *next, "per-thread order broken for producer {name}");
            *next += 1;
            total += 1;
        }
        assert_eq!(total, THREADS * ITEMS);
    }
}
