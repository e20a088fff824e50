//! Capture file persistence.
//!
//! Layout: `"INSP" || version:u8 || body_len:varint || body`, where the body
//! is a sequence of tag chunks terminated by an End tag. A chunk header is a
//! u16 with the tag code in the high 10 bits and the payload length in the
//! low 6; length 63 escapes to an extended u32 length.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::context::DataContext;
use crate::event::{
    FrameData, FrameEvent, OpTaskData, PropertyData, PropertyValue, TextureData, VertexData,
    DataType, SPATIAL_PRECISION,
};
use crate::protocol::PROTOCOL_VERSION;
use crate::stream::{DecodeStream, EncodeStream};
use crate::{Error, Result};

pub const FILE_MAGIC: [u8; 4] = *b"INSP";

#[derive(FromPrimitive, ToPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum TagCode {
    End = 0,
    Frame = 1,
    OpTask = 2,
    Property = 3,
    Texture = 4,
    VertexBuffer = 5,
    ShaderAndUniform = 6,
    NameMap = 7,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TagHeader {
    pub code: u16,
    pub length: u32,
}

pub fn read_tag_header(stream: &mut DecodeStream) -> Result<TagHeader> {
    let code_and_length = stream.read_u16()?;
    let code = code_and_length >> 6;
    let mut length = (code_and_length & 63) as u32;
    if length == 63 {
        length = stream.read_u32()?;
    }
    Ok(TagHeader { code, length })
}

fn write_type_and_length(stream: &mut EncodeStream, code: TagCode, length: u32) {
    let type_and_length = (code as u16) << 6;
    if length < 63 {
        stream.write_u16(type_and_length | length as u16);
    } else {
        stream.write_u16(type_and_length | 63);
        stream.write_u32(length);
    }
}

fn write_tag(stream: &mut EncodeStream, code: TagCode, body: &EncodeStream) {
    write_type_and_length(stream, code, body.len());
    stream.write_stream(body);
}

fn write_end_tag(stream: &mut EncodeStream) {
    stream.write_u16(0);
}

fn write_frame_data(stream: &mut EncodeStream, fd: &FrameData) {
    let mut ref_time = 0i64;
    stream.write_encoded_u64(fd.name);
    stream.write_bool(fd.continuous);
    stream.write_encoded_u64(fd.frames.len() as u64);
    for frame in &fd.frames {
        stream.write_time_offset(&mut ref_time, frame.start);
        if !fd.continuous {
            stream.write_time_offset(&mut ref_time, frame.end);
        }
        stream.write_encoded_i64(frame.draw_call);
        stream.write_encoded_i64(frame.triangles);
    }
}

fn read_frame_data(stream: &mut DecodeStream) -> Result<FrameData> {
    let mut fd = FrameData::new();
    fd.name = stream.read_encoded_u64()?;
    fd.continuous = stream.read_bool()?;
    let count = stream.read_encoded_u64()?;
    let mut ref_time = 0i64;
    for _ in 0..count {
        let start = stream.read_time_offset(&mut ref_time)?;
        let end = if fd.continuous { -1 } else { stream.read_time_offset(&mut ref_time)? };
        let draw_call = stream.read_encoded_i64()?;
        let triangles = stream.read_encoded_i64()?;
        fd.frames.push(FrameEvent { start, end, draw_call, triangles, frame_image: -1 });
    }
    Ok(fd)
}

fn write_frame_tag(stream: &mut EncodeStream, context: &DataContext) {
    // a single frame collection today; the count keeps the format open
    stream.write_encoded_u32(1);
    write_frame_data(stream, &context.frame_data);
}

fn read_frame_tag(stream: &mut DecodeStream, context: &mut DataContext) -> Result<()> {
    let count = stream.read_encoded_u32()?;
    for i in 0..count {
        let fd = read_frame_data(stream)?;
        if i == 0 {
            context.frame_data = fd;
        } else {
            log::warn!("capture carries {count} frame collections, keeping the first");
        }
    }
    Ok(())
}

fn write_op_task_tag(stream: &mut EncodeStream, context: &DataContext) {
    stream.write_encoded_i64(context.base_time);
    stream.write_encoded_i64(context.last_time);

    stream.write_encoded_u64(context.op_tasks.len() as u64);
    for op in &context.op_tasks {
        stream.write_encoded_i64(op.start);
        stream.write_encoded_i64(op.end);
        stream.write_u8(op.kind);
    }

    stream.write_encoded_u64(context.op_childs.len() as u64);
    for (&parent, childs) in &context.op_childs {
        stream.write_encoded_u32(parent);
        stream.write_encoded_u32(childs.len() as u32);
        for &child in childs {
            stream.write_encoded_u32(child);
        }
    }
}

fn read_op_task_tag(stream: &mut DecodeStream, context: &mut DataContext) -> Result<()> {
    context.base_time = stream.read_encoded_i64()?;
    context.last_time = stream.read_encoded_i64()?;

    let count = stream.read_encoded_u64()?;
    for i in 0..count {
        let start = stream.read_encoded_i64()?;
        let end = stream.read_encoded_i64()?;
        let kind = stream.read_u8()?;
        context.op_tasks.push(OpTaskData { id: i as u32, start, end, kind });
    }
    context.op_task_count = count;

    let count = stream.read_encoded_u64()?;
    for _ in 0..count {
        let parent = stream.read_encoded_u32()?;
        let child_count = stream.read_encoded_u32()?;
        let mut childs = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            childs.push(stream.read_encoded_u32()?);
        }
        context.op_childs.insert(parent, childs);
    }
    Ok(())
}

fn write_values(stream: &mut EncodeStream, values: &[PropertyValue]) {
    stream.write_encoded_u32(values.len() as u32);
    for value in values {
        stream.write_u8(value.ty as u8);
        stream.write_encoded_u64(value.name);
        stream.write_data(&value.data);
    }
}

fn read_values(stream: &mut DecodeStream) -> Result<Vec<PropertyValue>> {
    let count = stream.read_encoded_u32()?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ty = stream.read_u8()?;
        let Some(ty) = DataType::from_u8(ty) else {
            return Err(Error::FileFormat(format!("unknown attribute data type {ty}")));
        };
        let name = stream.read_encoded_u64()?;
        let data = stream.read_data()?;
        values.push(PropertyValue { ty, name, data });
    }
    Ok(values)
}

fn write_property_tag(stream: &mut EncodeStream, context: &DataContext) {
    stream.write_encoded_u32(context.properties.len() as u32);
    for (&op, property) in &context.properties {
        stream.write_encoded_u32(op);
        write_values(stream, &property.summary);
        write_values(stream, &property.process);
    }
}

fn read_property_tag(stream: &mut DecodeStream, context: &mut DataContext) -> Result<()> {
    let count = stream.read_encoded_u32()?;
    for _ in 0..count {
        let op = stream.read_encoded_u32()?;
        let summary = read_values(stream)?;
        let process = read_values(stream)?;
        context.properties.insert(op, PropertyData { summary, process });
    }
    Ok(())
}

fn write_name_map_tag(stream: &mut EncodeStream, context: &DataContext) {
    stream.write_encoded_u64(context.name_map.len() as u64);
    for (&handle, name) in &context.name_map {
        stream.write_encoded_u64(handle);
        stream.write_utf8(name);
    }
}

fn read_name_map_tag(stream: &mut DecodeStream, context: &mut DataContext) -> Result<()> {
    let count = stream.read_encoded_u64()?;
    for _ in 0..count {
        let handle = stream.read_encoded_u64()?;
        let name = stream.read_utf8()?;
        context.name_map.insert(handle, name);
    }
    Ok(())
}

fn write_texture_tag(stream: &mut EncodeStream, context: &DataContext) {
    stream.write_encoded_u32(context.textures.len() as u32);
    for (&op, texture) in &context.textures {
        stream.write_encoded_u32(op);
        stream.write_encoded_u32(texture.inputs.len() as u32);
        for input in &texture.inputs {
            stream.write_data(input);
        }
        stream.write_data(&texture.output);
    }
}

fn read_texture_tag(stream: &mut DecodeStream, context: &mut DataContext) -> Result<()> {
    let count = stream.read_encoded_u32()?;
    for _ in 0..count {
        let op = stream.read_encoded_u32()?;
        let input_count = stream.read_encoded_u32()?;
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            inputs.push(stream.read_data()?);
        }
        let output = stream.read_data()?;
        context.textures.insert(op, TextureData { inputs, output });
    }
    Ok(())
}

fn write_vertex_buffer_tag(stream: &mut EncodeStream, context: &DataContext) {
    stream.write_encoded_u32(context.vertex_data.len() as u32);
    for (&op, vertex) in &context.vertex_data {
        stream.write_encoded_u32(op);
        stream.write_encoded_u32(vertex.vertices.len() as u32);
        stream.write_float_list(&vertex.vertices, SPATIAL_PRECISION);
        stream.write_bool(vertex.has_uv);
        stream.write_bool(vertex.has_color);
    }
}

fn read_vertex_buffer_tag(stream: &mut DecodeStream, context: &mut DataContext) -> Result<()> {
    let count = stream.read_encoded_u32()?;
    for _ in 0..count {
        let op = stream.read_encoded_u32()?;
        let vertex_count = stream.read_encoded_u32()?;
        let vertices = stream.read_float_list(vertex_count as usize, SPATIAL_PRECISION)?;
        let has_uv = stream.read_bool()?;
        let has_color = stream.read_bool()?;
        context.vertex_data.insert(op, VertexData { vertices, has_uv, has_color });
    }
    Ok(())
}

/// Serializes a complete capture.
pub fn save_context(context: &DataContext) -> Vec<u8> {
    let mut body = EncodeStream::new();

    if !context.name_map.is_empty() {
        let mut bytes = EncodeStream::new();
        write_name_map_tag(&mut bytes, context);
        write_tag(&mut body, TagCode::NameMap, &bytes);
    }

    let mut bytes = EncodeStream::new();
    write_frame_tag(&mut bytes, context);
    write_tag(&mut body, TagCode::Frame, &bytes);

    // always written: carries the base/last time anchors
    let mut bytes = EncodeStream::new();
    write_op_task_tag(&mut bytes, context);
    write_tag(&mut body, TagCode::OpTask, &bytes);

    if !context.properties.is_empty() {
        let mut bytes = EncodeStream::new();
        write_property_tag(&mut bytes, context);
        write_tag(&mut body, TagCode::Property, &bytes);
    }

    if !context.textures.is_empty() {
        let mut bytes = EncodeStream::new();
        write_texture_tag(&mut bytes, context);
        write_tag(&mut body, TagCode::Texture, &bytes);
    }

    if !context.vertex_data.is_empty() {
        let mut bytes = EncodeStream::new();
        write_vertex_buffer_tag(&mut bytes, context);
        write_tag(&mut body, TagCode::VertexBuffer, &bytes);
    }

    write_end_tag(&mut body);

    let mut file = EncodeStream::new();
    file.write_bytes(&FILE_MAGIC);
    file.write_u8(PROTOCOL_VERSION as u8);
    file.write_encoded_u32(body.len());
    file.write_stream(&body);
    file.into_bytes()
}

/// Deserializes a capture. Partial state is discarded on error.
pub fn load_context(bytes: &[u8]) -> Result<DataContext> {
    let mut stream = DecodeStream::new(bytes);
    if stream.read_slice(4)? != FILE_MAGIC {
        return Err(Error::FileFormat("invalid capture file header".into()));
    }
    let version = stream.read_u8()?;
    if version as u32 > PROTOCOL_VERSION {
        return Err(Error::FileFormat(format!("capture file version {version} is too new")));
    }
    let body_length = stream.read_encoded_u32()?.min(stream.bytes_available());
    let mut body = stream.read_stream(body_length as usize)?;

    let mut context = DataContext::new();
    loop {
        let header = read_tag_header(&mut body)?;
        if header.code == TagCode::End as u16 {
            break;
        }
        let mut chunk = body.read_stream(header.length as usize)?;
        match TagCode::from_u16(header.code) {
            Some(TagCode::Frame) => read_frame_tag(&mut chunk, &mut context)?,
            Some(TagCode::OpTask) => read_op_task_tag(&mut chunk, &mut context)?,
            Some(TagCode::Property) => read_property_tag(&mut chunk, &mut context)?,
            Some(TagCode::NameMap) => read_name_map_tag(&mut chunk, &mut context)?,
            Some(TagCode::Texture) => read_texture_tag(&mut chunk, &mut context)?,
            Some(TagCode::VertexBuffer) => read_vertex_buffer_tag(&mut chunk, &mut context)?,
            // reserved or newer-but-compatible chunks are skipped whole
            Some(TagCode::ShaderAndUniform) | Some(TagCode::End) | None => {}
        }
    }
    context.frame_data.rebuild_stats(context.last_time);
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_length_boundary() {
        for len in [0usize, 1, 62, 63, 64, 100_000] {
            let mut body = EncodeStream::new();
            body.write_bytes(&vec![0xAB; len]);
            let mut stream = EncodeStream::new();
            write_tag(&mut stream, TagCode::Property, &body);
            let header_size = if len < 63 { 2 } else { 6 };
            let bytes = stream.into_bytes();
            assert_eq!(bytes.len(), header_size + len);
            let mut d = DecodeStream::new(&bytes);
            let header = read_tag_header(&mut d).unwrap();
            assert_eq!(header.code, TagCode::Property as u16);
            assert_eq!(header.length as usize, len);
        }
    }

    fn sample_context() -> DataContext {
        let mut ctx = DataContext::new();
        ctx.base_time = 500_000_000;
        ctx.mark_frame(0);
        for frame in 0..4 {
            let base = frame * 1_000_000;
            let outer = ctx.begin_op(base + 10, 1);
            ctx.begin_op(base + 20, 2);
            ctx.push_value(PropertyValue {
                ty: DataType::Float,
                name: 0xCAFE,
                data: 1.5f32.to_le_bytes().to_vec(),
            });
            ctx.end_op(base + 30, 2);
            ctx.end_op(base + 40, 1);
            let _ = outer;
            ctx.mark_frame(base + 50);
        }
        ctx.insert_name(0xCAFE, "radius".into());
        ctx.textures.insert(0, TextureData { inputs: vec![vec![1, 2, 3]], output: vec![9, 9] });
        ctx.vertex_data.insert(
            1,
            VertexData { vertices: vec![0.0, 0.05, 1.0, -2.5], has_uv: true, has_color: false },
        );
        ctx
    }

    #[test]
    fn save_load_roundtrip() {
        let ctx = sample_context();
        let bytes = save_context(&ctx);
        let loaded = load_context(&bytes).unwrap();

        assert_eq!(loaded.base_time, ctx.base_time);
        assert_eq!(loaded.last_time, ctx.last_time);
        assert_eq!(loaded.frame_data.frames, ctx.frame_data.frames);
        assert_eq!(loaded.op_tasks, ctx.op_tasks);
        assert_eq!(loaded.op_childs, ctx.op_childs);
        assert_eq!(loaded.properties, ctx.properties);
        assert_eq!(loaded.name_map, ctx.name_map);
        assert_eq!(loaded.textures, ctx.textures);
        // vertices round-trip modulo quantization
        let vd = &loaded.vertex_data[&1];
        for (a, b) in ctx.vertex_data[&1].vertices.iter().zip(&vd.vertices) {
            assert!((a - b).abs() <= SPATIAL_PRECISION / 2.0);
        }
        assert!(vd.has_uv && !vd.has_color);
        // stats were rebuilt from the loaded frames
        let mut expected = ctx.frame_data.clone();
        expected.rebuild_stats(ctx.last_time);
        assert_eq!(loaded.frame_data.total, expected.total);
        assert_eq!(loaded.frame_data.min, expected.min);
        assert_eq!(loaded.frame_data.max, expected.max);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = save_context(&sample_context());
        bytes[0] = b'X';
        assert!(matches!(load_context(&bytes), Err(Error::FileFormat(_))));
    }

    #[test]
    fn newer_file_version_is_rejected() {
        let mut bytes = save_context(&sample_context());
        bytes[4] = PROTOCOL_VERSION as u8 + 1;
        assert!(matches!(load_context(&bytes), Err(Error::FileFormat(_))));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let bytes = save_context(&sample_context());
        assert!(load_context(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn unknown_tag_chunks_are_skipped() {
        let ctx = sample_context();
        let mut body = EncodeStream::new();
        // a chunk with a code outside the known set
        let mut stray = EncodeStream::new();
        stray.write_bytes(&[1, 2, 3, 4]);
        write_type_and_length(&mut body, TagCode::ShaderAndUniform, stray.len());
        body.write_stream(&stray);
        let mut frame = EncodeStream::new();
        write_frame_tag(&mut frame, &ctx);
        write_tag(&mut body, TagCode::Frame, &frame);
        let mut ops = EncodeStream::new();
        write_op_task_tag(&mut ops, &ctx);
        write_tag(&mut body, TagCode::OpTask, &ops);
        write_end_tag(&mut body);

        let mut file = EncodeStream::new();
        file.write_bytes(&FILE_MAGIC);
        file.write_u8(PROTOCOL_VERSION as u8);
        file.write_encoded_u32(body.len());
        file.write_stream(&body);

        let loaded = load_context(&file.into_bytes()).unwrap();
        assert_eq!(loaded.frame_data.frames, ctx.frame_data.frames);
        assert_eq!(loaded.op_tasks, ctx.op_tasks);
    }
}
