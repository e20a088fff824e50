//! Entities of the decoded data model.

use num_derive::{FromPrimitive, ToPrimitive};

/// Quantization step for persisted vertex positions.
pub const SPATIAL_PRECISION: f32 = 0.05;

/// One render frame delimited by frame marks. `end` stays -1 in continuous
/// capture mode, where a frame lasts until the next mark.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameEvent {
    pub start: i64,
    pub end: i64,
    pub draw_call: i64,
    pub triangles: i64,
    pub frame_image: i32,
}

impl FrameEvent {
    pub fn at(start: i64) -> Self {
        FrameEvent { start, end: -1, draw_call: 0, triangles: 0, frame_image: -1 }
    }
}

/// Frame sequence with rolling span statistics.
#[derive(Clone, Debug)]
pub struct FrameData {
    pub name: u64,
    pub continuous: bool,
    pub frames: Vec<FrameEvent>,
    pub min: i64,
    pub max: i64,
    pub total: i64,
    pub sum_sq: f64,
}

impl FrameData {
    pub fn new() -> Self {
        FrameData {
            name: 0,
            continuous: true,
            frames: Vec::new(),
            min: i64::MAX,
            max: i64::MIN,
            total: 0,
            sum_sq: 0.0,
        }
    }

    /// Span of frame `idx`. Continuous frames last until the next mark; the
    /// final (or still-open) frame extends to `last_time`.
    pub fn frame_time(&self, idx: usize, last_time: i64) -> i64 {
        if self.continuous {
            if idx + 1 < self.frames.len() {
                return self.frames[idx + 1].start - self.frames[idx].start;
            }
            return last_time - self.frames[idx].start;
        }
        let frame = &self.frames[idx];
        if frame.end >= 0 {
            return frame.end - frame.start;
        }
        last_time - frame.start
    }

    pub fn record_span(&mut self, span: i64) {
        if span > 0 {
            self.min = self.min.min(span);
            self.max = self.max.max(span);
            self.total += span;
            self.sum_sq += span as f64 * span as f64;
        }
    }

    pub fn rebuild_stats(&mut self, last_time: i64) {
        self.min = i64::MAX;
        self.max = i64::MIN;
        self.total = 0;
        self.sum_sq = 0.0;
        for idx in 0..self.frames.len() {
            let span = self.frame_time(idx, last_time);
            self.record_span(span);
        }
    }
}

impl Default for FrameData {
    fn default() -> Self {
        FrameData::new()
    }
}

/// One instrumented operation; `end` is -1 until the matching end event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpTaskData {
    pub id: u32,
    pub start: i64,
    pub end: i64,
    pub kind: u8,
}

/// Operation kinds emitted by the instrumented render pipeline.
#[derive(FromPrimitive, ToPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Unknown = 0,
    TextureUploadTask,
    ShapeBufferUploadTask,
    GpuUploadTask,
    TextureCreateTask,
    RenderTargetCreateTask,
    TextureFlattenTask,
    RenderTargetCopyTask,
    RuntimeDrawTask,
    TextureResolveTask,
    ClearOp,
    RectDrawOp,
    RRectDrawOp,
    ShapeDrawOp,
    DstTextureCopyOp,
    ResolveOp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpOrTask {
    NoType,
    Op,
    Task,
}

pub fn op_or_task(kind: OpKind) -> OpOrTask {
    match kind {
        OpKind::TextureUploadTask
        | OpKind::ShapeBufferUploadTask
        | OpKind::GpuUploadTask
        | OpKind::TextureCreateTask
        | OpKind::RenderTargetCreateTask
        | OpKind::TextureFlattenTask
        | OpKind::RenderTargetCopyTask
        | OpKind::RuntimeDrawTask
        | OpKind::TextureResolveTask => OpOrTask::Task,
        OpKind::ClearOp
        | OpKind::RectDrawOp
        | OpKind::RRectDrawOp
        | OpKind::ShapeDrawOp
        | OpKind::DstTextureCopyOp
        | OpKind::ResolveOp => OpOrTask::Op,
        OpKind::Unknown => OpOrTask::NoType,
    }
}

/// Value kind of a captured attribute.
#[derive(FromPrimitive, ToPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Uint32 = 0,
    Color = 1,
    Int = 2,
    Float = 3,
    Float4 = 4,
    Mat = 5,
    Bool = 6,
    Enum = 7,
}

/// One captured attribute value: name handle, kind, raw little-endian bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyValue {
    pub ty: DataType,
    pub name: u64,
    pub data: Vec<u8>,
}

/// Attribute values attached to one op task.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyData {
    pub summary: Vec<PropertyValue>,
    pub process: Vec<PropertyValue>,
}

/// Input/output texture snapshots of one op task.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TextureData {
    pub inputs: Vec<Vec<u8>>,
    pub output: Vec<u8>,
}

/// Captured vertex payload of one op task, quantized on disk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VertexData {
    pub vertices: Vec<f32>,
    pub has_uv: bool,
    pub has_color: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_stats_match_observed_spans() {
        let mut fd = FrameData::new();
        for start in [0i64, 100, 250, 450] {
            fd.frames.push(FrameEvent::at(start));
        }
        let last_time = 700;
        fd.rebuild_stats(last_time);
        // spans: 100, 150, 200, 250
        assert_eq!(fd.total, 700);
        assert_eq!(fd.min, 100);
        assert_eq!(fd.max, 250);
        let expected_sq = 100.0f64 * 100.0 + 150.0 * 150.0 + 200.0 * 200.0 + 250.0 * 250.0;
        assert!((fd.sum_sq - expected_sq).abs() < 1e-9);
    }

    #[test]
    fn non_continuous_frames_use_explicit_ends() {
        let mut fd = FrameData::new();
        fd.continuous = false;
        fd.frames.push(FrameEvent { end: 80, ..FrameEvent::at(10) });
        fd.frames.push(FrameEvent::at(100));
        assert_eq!(fd.frame_time(0, 500), 70);
        assert_eq!(fd.frame_time(1, 500), 400);
    }

    #[test]
    fn op_classification() {
        assert_eq!(op_or_task(OpKind::RectDrawOp), OpOrTask::Op);
        assert_eq!(op_or_task(OpKind::GpuUploadTask), OpOrTask::Task);
        assert_eq!(op_or_task(OpKind::Unknown), OpOrTask::NoType);
    }
}
