//! The decoded capture: everything a viewer frontend reads.

use std::collections::HashMap;

use num_traits::FromPrimitive;

use crate::event::{
    op_or_task, FrameData, FrameEvent, OpKind, OpOrTask, OpTaskData, PropertyData, PropertyValue,
    TextureData, VertexData,
};

/// Data model built from a live session or a capture file.
///
/// Op tasks live in an append-only arena indexed by `u32` id; the
/// parent-child relation is a separate map, never back-pointers. All times
/// are offsets from the session base time.
#[derive(Default)]
pub struct DataContext {
    pub frame_data: FrameData,
    pub op_tasks: Vec<OpTaskData>,
    pub op_stack: Vec<u32>,
    pub op_childs: HashMap<u32, Vec<u32>>,
    pub properties: HashMap<u32, PropertyData>,
    pub name_map: HashMap<u64, String>,
    pub textures: HashMap<u32, TextureData>,
    pub vertex_data: HashMap<u32, VertexData>,
    pub op_task_count: u64,
    pub base_time: i64,
    pub last_time: i64,
    pub error_messages: Vec<String>,
}

impl DataContext {
    pub fn new() -> Self {
        DataContext::default()
    }

    /// Records a decoding error, collapsing consecutive duplicates.
    pub fn throw_error(&mut self, message: String) -> bool {
        if self.error_messages.last() == Some(&message) {
            return false;
        }
        self.error_messages.push(message);
        true
    }

    pub fn has_error(&self) -> bool {
        !self.error_messages.is_empty()
    }

    /// Opens a new op task at `start` (base-time relative) and links it under
    /// the op currently on top of the stack. Draw ops count against the
    /// current frame.
    pub fn begin_op(&mut self, start: i64, kind: u8) -> u32 {
        self.op_task_count += 1;
        let id = self.op_tasks.len() as u32;
        self.op_tasks.push(OpTaskData { id, start, end: -1, kind });
        if let Some(&parent) = self.op_stack.last() {
            self.op_childs.entry(parent).or_default().push(id);
        }
        self.op_stack.push(id);
        if OpKind::from_u8(kind).map(op_or_task) == Some(OpOrTask::Op) {
            if let Some(frame) = self.frame_data.frames.last_mut() {
                frame.draw_call += 1;
            }
        }
        id
    }

    /// Closes the most recent open op. An end with no matching begin is
    /// dropped; mis-instrumentation is recoverable.
    pub fn end_op(&mut self, end: i64, kind: u8) {
        let Some(id) = self.op_stack.pop() else {
            return;
        };
        let op = &mut self.op_tasks[id as usize];
        debug_assert_eq!(op.end, -1);
        debug_assert_eq!(op.kind, kind);
        debug_assert!(end >= op.start);
        op.end = end;
    }

    /// Appends a frame boundary. A mark with no preceding ops still produces
    /// a zero-valued frame.
    pub fn mark_frame(&mut self, time: i64) {
        self.frame_data.frames.push(FrameEvent::at(time));
        if self.last_time < time {
            self.last_time = time;
        }
    }

    /// Attaches an attribute value to the op on top of the stack. Values
    /// outside any op are dropped. Returns the name handle when it still
    /// needs resolution.
    pub fn push_value(&mut self, value: PropertyValue) -> Option<u64> {
        let Some(&op) = self.op_stack.last() else {
            return None;
        };
        let name = value.name;
        self.properties.entry(op).or_default().summary.push(value);
        if self.name_map.contains_key(&name) {
            None
        } else {
            Some(name)
        }
    }

    /// Resolves a name handle. First resolution wins; entries are
    /// append-only within a session.
    pub fn insert_name(&mut self, handle: u64, name: String) {
        self.name_map.entry(handle).or_insert(name);
    }

    /// Attribute name for display; unresolved handles get a placeholder.
    pub fn display_name(&self, handle: u64) -> &str {
        self.name_map.get(&handle).map(String::as_str).unwrap_or("???")
    }

    pub fn frame_count(&self) -> usize {
        self.frame_data.frames.len()
    }

    pub fn frame_time(&self, idx: usize) -> i64 {
        self.frame_data.frame_time(idx, self.last_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DataType;

    #[test]
    fn nested_ops_build_parent_child_map() {
        let mut ctx = DataContext::new();
        let a = ctx.begin_op(100, 0);
        let b = ctx.begin_op(150, 0);
        ctx.end_op(200, 0);
        ctx.end_op(250, 0);
        assert_eq!((a, b), (0, 1));
        assert_eq!(ctx.op_childs.get(&0), Some(&vec![1]));
        assert_eq!(ctx.op_tasks[0].start, 100);
        assert_eq!(ctx.op_tasks[0].end, 250);
        assert_eq!(ctx.op_tasks[1].start, 150);
        assert_eq!(ctx.op_tasks[1].end, 200);
        assert!(ctx.op_stack.is_empty());
    }

    #[test]
    fn unmatched_end_is_dropped() {
        let mut ctx = DataContext::new();
        ctx.end_op(10, 0);
        assert!(ctx.op_tasks.is_empty());
        assert!(!ctx.has_error());
    }

    #[test]
    fn values_attach_to_current_op() {
        let mut ctx = DataContext::new();
        let dropped = ctx.push_value(PropertyValue {
            ty: DataType::Float,
            name: 7,
            data: vec![0; 4],
        });
        assert_eq!(dropped, None);
        assert!(ctx.properties.is_empty());

        ctx.begin_op(0, 0);
        let pending = ctx.push_value(PropertyValue {
            ty: DataType::Float,
            name: 7,
            data: 1.5f32.to_le_bytes().to_vec(),
        });
        assert_eq!(pending, Some(7));
        ctx.insert_name(7, "radius".into());
        let resolved = ctx.push_value(PropertyValue {
            ty: DataType::Float,
            name: 7,
            data: 2.5f32.to_le_bytes().to_vec(),
        });
        assert_eq!(resolved, None);
        assert_eq!(ctx.properties[&0].summary.len(), 2);
        assert_eq!(ctx.display_name(7), "radius");
        assert_eq!(ctx.display_name(8), "???");
    }

    #[test]
    fn draw_ops_count_into_current_frame() {
        let mut ctx = DataContext::new();
        ctx.mark_frame(0);
        ctx.begin_op(5, OpKind::RectDrawOp as u8);
        ctx.end_op(6, OpKind::RectDrawOp as u8);
        ctx.begin_op(7, OpKind::GpuUploadTask as u8);
        ctx.end_op(8, OpKind::GpuUploadTask as u8);
        assert_eq!(ctx.frame_data.frames[0].draw_call, 1);
        ctx.mark_frame(10);
        assert_eq!(ctx.frame_data.frames[1].draw_call, 0);
    }

    #[test]
    fn consecutive_duplicate_errors_collapse() {
        let mut ctx = DataContext::new();
        assert!(ctx.throw_error("bad magic".into()));
        assert!(!ctx.throw_error("bad magic".into()));
        assert!(ctx.throw_error("truncated chunk".into()));
        assert_eq!(ctx.error_messages.len(), 2);
    }
}
