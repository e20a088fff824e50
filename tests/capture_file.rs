//! Capture file round trip through a realistic data model.

use rinspect::context::DataContext;
use rinspect::event::{DataType, PropertyValue};
use rinspect::tags::save_context;
use rinspect::Worker;

fn build_context() -> DataContext {
    let mut ctx = DataContext::new();
    ctx.base_time = 500_000_000;
    let mut handle = 0x7f00_0000_1000u64;
    for frame in 0..60i64 {
        let frame_start = frame * 16_000_000;
        ctx.mark_frame(frame_start);
        for op in 0..10i64 {
            let kind = (op % 4) as u8 + 10;
            let start = frame_start + op * 1_000_000;
            ctx.begin_op(start, kind);
            for sample in 0..3 {
                ctx.push_value(PropertyValue {
                    ty: DataType::Float,
                    name: handle,
                    data: (sample as f32 * 0.5).to_le_bytes().to_vec(),
                });
            }
            ctx.insert_name(handle, format!("attr_{handle:x}"));
            handle += 1;
            ctx.end_op(start + 500_000, kind);
        }
    }
    ctx
}

#[test]
fn sixty_frame_capture_roundtrip() {
    let ctx = build_context();
    assert_eq!(ctx.frame_data.frames.len(), 60);
    assert_eq!(ctx.op_tasks.len(), 600);
    assert_eq!(ctx.name_map.len(), 600);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.insp");
    std::fs::write(&path, save_context(&ctx)).unwrap();

    let worker = Worker::open(&path).unwrap();
    {
        let loaded = worker.context();
        assert_eq!(loaded.base_time, ctx.base_time);
        assert_eq!(loaded.last_time, ctx.last_time);
        assert_eq!(loaded.frame_data.frames, ctx.frame_data.frames);
        assert_eq!(loaded.op_tasks, ctx.op_tasks);
        assert_eq!(loaded.op_childs, ctx.op_childs);
        assert_eq!(loaded.properties, ctx.properties);
        // every resolved name survives byte for byte
        assert_eq!(loaded.name_map, ctx.name_map);
    }

    // a second generation through Worker::save keeps the model stable
    let copy = dir.path().join("copy.insp");
    worker.save(&copy).unwrap();
    let again = Worker::open(&copy).unwrap();
    let loaded = again.context();
    assert_eq!(loaded.frame_data.frames, ctx.frame_data.frames);
    assert_eq!(loaded.op_tasks, ctx.op_tasks);
    assert_eq!(loaded.name_map, ctx.name_map);
}
