//! Binary save format for shape lists, used by editor frontends. Everything
//! is little-endian and length-prefixed; the shape's variant is persisted as
//! a type string so loading needs no runtime type machinery.
//!
//! ```text
//! u32 version
//! u32 count
//! per shape:
//!     string type        ("box" | "cylinder" | "heightmap")
//!     string name
//!     f32[16] transform  (row-major 4x4)
//!     u8 op
//!     u8 material
//!     f32 smoothing
//!     type-specific tail (box: f32 corner radius; cylinder: f32 top,
//!                         f32 bottom; heightmap: none)
//! ```

use crate::{
    prelude::*,
    sdf::{Composer, CsgOp, Heightfield, Shape, ShapeId, ShapeKind},
    TerrainError,
};
use nalgebra::Matrix4;
use std::{
    io::{Read, Write},
    sync::Arc,
};

pub const SHAPE_LIST_VERSION: u32 = 1;

/// Strings longer than this are rejected as corrupt rather than allocated.
const MAX_STRING_LEN: u32 = 4096;

#[derive(Clone, Debug, PartialEq)]
pub enum ShapeParams {
    Box { corner_radius: f32 },
    Cylinder { top: f32, bottom: f32 },
    Heightmap,
}

/// One deserialized shape entry. The heightmap sampler is not part of the
/// format; it is re-borrowed at instantiation time, the same way the editor
/// re-binds its image.
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeRecord {
    pub name: String,
    pub transform: Matrix4<f32>,
    pub op: CsgOp,
    pub material: u8,
    pub smoothing: f32,
    pub params: ShapeParams,
}

fn write_u8<W: Write>(writer: &mut W, value: u8) -> Result<()> {
    writer.write_all(&[value])?;
    Ok(())
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_f32<W: Write>(writer: &mut W, value: f32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<()> {
    write_u32(writer, value.len() as u32)?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_u32(reader)?;
    if len > MAX_STRING_LEN {
        bail!("string length {} exceeds the format limit", len);
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn write_transform<W: Write>(writer: &mut W, transform: &Matrix4<f32>) -> Result<()> {
    for row in 0..4 {
        for col in 0..4 {
            write_f32(writer, transform[(row, col)])?;
        }
    }
    Ok(())
}

fn read_transform<R: Read>(reader: &mut R) -> Result<Matrix4<f32>> {
    let mut transform = Matrix4::zeros();
    for row in 0..4 {
        for col in 0..4 {
            transform[(row, col)] = read_f32(reader)?;
        }
    }
    Ok(transform)
}

/// Writes the named shapes in order.
pub fn save_shapes<W: Write>(writer: &mut W, shapes: &[(&str, &Shape)]) -> Result<()> {
    write_u32(writer, SHAPE_LIST_VERSION)?;
    write_u32(writer, shapes.len() as u32)?;

    for (name, shape) in shapes {
        write_string(writer, shape.kind().type_name())?;
        write_string(writer, name)?;
        write_transform(writer, shape.transform())?;
        write_u8(writer, shape.op() as u8)?;
        write_u8(writer, shape.material_id())?;
        write_f32(writer, shape.smoothing())?;

        match shape.kind() {
            ShapeKind::Box { corner_radius } => write_f32(writer, *corner_radius)?,
            ShapeKind::Cylinder { top, bottom } => {
                write_f32(writer, *top)?;
                write_f32(writer, *bottom)?;
            }
            ShapeKind::Heightmap { .. } => {}
        }
    }
    Ok(())
}

pub fn load_shapes<R: Read>(reader: &mut R) -> Result<Vec<ShapeRecord>> {
    let version = read_u32(reader)?;
    if version != SHAPE_LIST_VERSION {
        bail!("unsupported shape list version {}", version);
    }

    let count = read_u32(reader)?;
    let mut records = Vec::with_capacity(usize::min(count as usize, 1024));
    for _ in 0..count {
        let type_name = read_string(reader)?;
        let name = read_string(reader)?;
        let transform = read_transform(reader)?;
        let op_byte = read_u8(reader)?;
        let op = CsgOp::from_u8(op_byte)
            .ok_or_else(|| anyhow!("invalid shape operator {}", op_byte))?;
        let material = read_u8(reader)?;
        let smoothing = read_f32(reader)?;

        let params = match type_name.as_str() {
            "box" => ShapeParams::Box {
                corner_radius: read_f32(reader)?,
            },
            "cylinder" => ShapeParams::Cylinder {
                top: read_f32(reader)?,
                bottom: read_f32(reader)?,
            },
            "heightmap" => ShapeParams::Heightmap,
            other => return Err(TerrainError::UnknownShapeType(other.to_string()).into()),
        };

        records.push(ShapeRecord {
            name,
            transform,
            op,
            material,
            smoothing,
            params,
        });
    }
    Ok(records)
}

/// Recreates a loaded record inside a composer. Heightmap records need the
/// caller to lend the sampler the format deliberately does not carry.
pub fn instantiate(
    composer: &mut Composer,
    record: &ShapeRecord,
    heightmap: Option<&Arc<Heightfield>>,
) -> Result<ShapeId> {
    let id = match &record.params {
        ShapeParams::Box { corner_radius } => {
            let id = composer.create_box();
            composer.set_transform(id, record.transform)?;
            composer.set_corner_radius(id, *corner_radius)?;
            id
        }
        ShapeParams::Cylinder { top, bottom } => {
            let id = composer.create_cylinder();
            composer.set_transform(id, record.transform)?;
            composer.set_caps(id, *top, *bottom)?;
            id
        }
        ShapeParams::Heightmap => {
            let map = heightmap
                .ok_or_else(|| anyhow!("heightmap record `{}` needs a sampler", record.name))?;
            let id = composer.create_heightmap(Arc::clone(map));
            composer.set_transform(id, record.transform)?;
            id
        }
    };
    composer.set_op(id, record.op)?;
    composer.set_material(id, record.material)?;
    composer.set_smoothing(id, record.smoothing)?;
    Ok(id)
}
