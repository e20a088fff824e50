//! Stateful LZ4 block streaming with a persistent dictionary window.
//!
//! Thin owner types over the raw streaming API: the encoder keeps up to
//! 64 KiB of previously *seen* input as its dictionary, so consecutive
//! frames compress against each other. Callers must keep recent input (or
//! output, when decoding) bytes at stable addresses between calls, which the
//! staging rings on both ends of the connection guarantee.

use std::os::raw::{c_char, c_int};

#[repr(C)]
struct Lz4Stream {
    _private: [u8; 0],
}

#[repr(C)]
struct Lz4StreamDecode {
    _private: [u8; 0],
}

// Streaming entry points of the lz4 library that `lz4-sys` compiles and
// links; its Rust surface stops at the stateless block API, so the
// dictionary-carrying calls are declared here with their lz4.h signatures.
extern "C" {
    fn LZ4_createStream() -> *mut Lz4Stream;
    fn LZ4_freeStream(stream: *mut Lz4Stream) -> c_int;
    fn LZ4_compress_fast_continue(
        stream: *mut Lz4Stream,
        src: *const c_char,
        dst: *mut c_char,
        src_size: c_int,
        dst_capacity: c_int,
        acceleration: c_int,
    ) -> c_int;
    fn LZ4_createStreamDecode() -> *mut Lz4StreamDecode;
    fn LZ4_freeStreamDecode(stream: *mut Lz4StreamDecode) -> c_int;
    fn LZ4_decompress_safe_continue(
        stream: *mut Lz4StreamDecode,
        src: *const c_char,
        dst: *mut c_char,
        src_size: c_int,
        dst_capacity: c_int,
    ) -> c_int;
}

/// Worst-case compressed size for `size` input bytes (LZ4_COMPRESSBOUND).
pub const fn compress_bound(size: usize) -> usize {
    size + size / 255 + 16
}

/// The linked library's own bound; [`compress_bound`] must never be below it.
pub fn lib_compress_bound(size: usize) -> usize {
    // SAFETY: pure function, no state.
    unsafe { lz4_sys::LZ4_compressBound(size as c_int) as usize }
}

/// Streaming compressor. `Send` but deliberately not `Sync`: the stream
/// pointer stays on the thread that owns the staging buffer.
pub struct StreamEncoder {
    stream: *mut Lz4Stream,
}

// SAFETY: the raw stream is owned exclusively by this value and freed on
// drop; nothing else aliases it, so moving it across threads is fine.
unsafe impl Send for StreamEncoder {}

impl StreamEncoder {
    pub fn new() -> Self {
        // SAFETY: plain constructor call; failure is reported as null.
        let stream = unsafe { LZ4_createStream() };
        assert!(!stream.is_null(), "LZ4_createStream failed");
        StreamEncoder { stream }
    }

    /// Compresses `src` into `dst`, carrying the dictionary forward.
    ///
    /// `src` must stay valid and unmodified at its current address until
    /// 64 KiB of newer input has been fed, and `dst` must hold at least
    /// [`compress_bound`]`(src.len())` bytes. Returns the compressed size.
    pub fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> usize {
        debug_assert!(dst.len() >= compress_bound(src.len()));
        // SAFETY: both slices outlive the call and the capacity argument
        // matches `dst`; the stream pointer is owned by self.
        let n = unsafe {
            LZ4_compress_fast_continue(
                self.stream,
                src.as_ptr() as *const c_char,
                dst.as_mut_ptr() as *mut c_char,
                src.len() as c_int,
                dst.len() as c_int,
                1,
            )
        };
        n.max(0) as usize
    }
}

impl Drop for StreamEncoder {
    fn drop(&mut self) {
        // SAFETY: created by LZ4_createStream and not freed elsewhere.
        unsafe { LZ4_freeStream(self.stream) };
    }
}

impl Default for StreamEncoder {
    fn default() -> Self {
        StreamEncoder::new()
    }
}

/// Streaming decompressor mirroring [`StreamEncoder`].
pub struct StreamDecoder {
    stream: *mut Lz4StreamDecode,
}

// SAFETY: same exclusive-ownership argument as StreamEncoder.
unsafe impl Send for StreamDecoder {}

impl StreamDecoder {
    pub fn new() -> Self {
        // SAFETY: plain constructor call; failure is reported as null.
        let stream = unsafe { LZ4_createStreamDecode() };
        assert!(!stream.is_null(), "LZ4_createStreamDecode failed");
        StreamDecoder { stream }
    }

    /// Decompresses one block into `dst`.
    ///
    /// Previously decompressed output must still be readable at its original
    /// address (the dictionary window); returns `None` on malformed input.
    pub fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Option<usize> {
        // SAFETY: both slices outlive the call and the capacity argument
        // matches `dst`; the stream pointer is owned by self.
        let n = unsafe {
            LZ4_decompress_safe_continue(
                self.stream,
                src.as_ptr() as *const c_char,
                dst.as_mut_ptr() as *mut c_char,
                src.len() as c_int,
                dst.len() as c_int,
            )
        };
        if n < 0 {
            None
        } else {
            Some(n as usize)
        }
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        // SAFETY: created by LZ4_createStreamDecode and not freed elsewhere.
        unsafe { LZ4_freeStreamDecode(self.stream) };
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        StreamDecoder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TARGET_FRAME_SIZE;

    #[test]
    fn bound_matches_the_library() {
        for size in [0usize, 1, 4096, TARGET_FRAME_SIZE] {
            assert!(compress_bound(size) >= lib_compress_bound(size), "bound too small for {size}");
        }
        assert!(compress_bound(TARGET_FRAME_SIZE) > TARGET_FRAME_SIZE);
    }

    // Mirrors the real transport: the encoder reads successive regions of a
    // persistent staging ring, the decoder writes successive regions of its
    // own ring, and back-references cross block boundaries.
    #[test]
    fn streaming_roundtrip_with_dictionary() {
        let mut staging = vec![0u8; TARGET_FRAME_SIZE * 3];
        let mut ring = vec![0u8; TARGET_FRAME_SIZE * 3];
        let mut compressed = vec![0u8; compress_bound(TARGET_FRAME_SIZE)];

        let mut encoder = StreamEncoder::new();
        let mut decoder = StreamDecoder::new();

        let pattern: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut write_at = 0usize;
        let mut read_at = 0usize;
        let mut sizes = Vec::new();
        for round in 0..6 {
            let block = &mut staging[write_at..write_at + pattern.len()];
            block.copy_from_slice(&pattern);
            block[round] = round as u8; // small mutation per block
            let n = encoder.compress(&staging[write_at..write_at + pattern.len()], &mut compressed);
            assert!(n > 0);
            sizes.push(n);

            let out = decoder
                .decompress(&compressed[..n], &mut ring[read_at..read_at + TARGET_FRAME_SIZE])
                .expect("decompress failed");
            assert_eq!(out, pattern.len());
            assert_eq!(&ring[read_at..read_at + out], &staging[write_at..write_at + out]);

            write_at += pattern.len();
            read_at += out;
        }
        // later blocks reuse the dictionary built by earlier ones
        assert!(sizes[5] < sizes[0]);
    }

    #[test]
    fn decoder_rejects_garbage() {
        let mut decoder = StreamDecoder::new();
        let mut out = vec![0u8; 1024];
        assert_eq!(decoder.decompress(&[0xFF, 0x00, 0x12, 0x34], &mut out), None);
    }
}
