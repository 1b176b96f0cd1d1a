//! Single-tensor binary serialization.
//!
//! Layout: the ASCII magic `FLNT`, one data-type tag byte, the dimension
//! count as a big-endian `i32`, each dimension size as a big-endian
//! `u64`, then the raw elements in row-major order and native endianness.

use std::io::{Read, Write};

use crate::data::{DataType, TensorData};
use crate::errors::{self, FlintError, FlintResult};
use crate::graph::{new_store, NodeRef};
use crate::memory;

const MAGIC: &[u8; 4] = b"FLNT";

fn dtype_tag(dtype: DataType) -> u8 {
    match dtype {
        DataType::I32 => 0,
        DataType::I64 => 1,
        DataType::F32 => 2,
        DataType::F64 => 3,
    }
}

fn tag_dtype(tag: u8) -> FlintResult<DataType> {
    match tag {
        0 => Ok(DataType::I32),
        1 => Ok(DataType::I64),
        2 => Ok(DataType::F32),
        3 => Ok(DataType::F64),
        other => Err(FlintError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown data type tag {other}"),
        ))),
    }
}

/// Writes the executed tensor under `node` to `w`.
pub fn write_to(node: &NodeRef, w: &mut impl Write) -> FlintResult<()> {
    errors::record(write_inner(node, w))
}

fn write_inner(node: &NodeRef, w: &mut impl Write) -> FlintResult<()> {
    crate::backend::execute(node)?;
    let data = memory::result_buffer(node)?;
    let shape = node.shape();
    w.write_all(MAGIC)?;
    w.write_all(&[dtype_tag(data.data_type())])?;
    w.write_all(&(shape.len() as i32).to_be_bytes())?;
    for dim in &shape {
        w.write_all(&(*dim as u64).to_be_bytes())?;
    }
    match &*data {
        TensorData::I32(v) => {
            for x in v {
                w.write_all(&x.to_ne_bytes())?;
            }
        }
        TensorData::I64(v) => {
            for x in v {
                w.write_all(&x.to_ne_bytes())?;
            }
        }
        TensorData::F32(v) => {
            for x in v {
                w.write_all(&x.to_ne_bytes())?;
            }
        }
        TensorData::F64(v) => {
            for x in v {
                w.write_all(&x.to_ne_bytes())?;
            }
        }
    }
    Ok(())
}

/// Reads one tensor from `r`, producing a storage node.
pub fn read_from(r: &mut impl Read) -> FlintResult<NodeRef> {
    errors::record(read_inner(r))
}

fn read_inner(r: &mut impl Read) -> FlintResult<NodeRef> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(FlintError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing FLNT magic",
        )));
    }
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;
    let dtype = tag_dtype(tag[0])?;
    let mut dims = [0u8; 4];
    r.read_exact(&mut dims)?;
    let rank = i32::from_be_bytes(dims);
    if rank <= 0 {
        return Err(FlintError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid dimension count {rank}"),
        )));
    }
    let mut shape = Vec::with_capacity(rank as usize);
    for _ in 0..rank {
        let mut dim = [0u8; 8];
        r.read_exact(&mut dim)?;
        shape.push(u64::from_be_bytes(dim) as usize);
    }
    let n: usize = shape.iter().product();
    macro_rules! read_elems {
        ($t:ty, $variant:ident, $width:literal) => {{
            let mut v = Vec::with_capacity(n);
            let mut buf = [0u8; $width];
            for _ in 0..n {
                r.read_exact(&mut buf)?;
                v.push(<$t>::from_ne_bytes(buf));
            }
            TensorData::$variant(v)
        }};
    }
    let data = match dtype {
        DataType::I32 => read_elems!(i32, I32, 4),
        DataType::I64 => read_elems!(i64, I64, 8),
        DataType::F32 => read_elems!(f32, F32, 4),
        DataType::F64 => read_elems!(f64, F64, 8),
    };
    new_store(data, shape)
}

/// Serializes the executed tensor under `node` into a byte vector.
pub fn serialize(node: &NodeRef) -> FlintResult<Vec<u8>> {
    let mut out = Vec::new();
    write_to(node, &mut out)?;
    Ok(out)
}

/// Deserializes a tensor previously produced by [`serialize`].
pub fn deserialize(bytes: &[u8]) -> FlintResult<NodeRef> {
    read_from(&mut std::io::Cursor::new(bytes))
}
