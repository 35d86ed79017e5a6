//! Minimal reader/writer for the NPY array format.
//!
//! Covers the subset this service produces and consumes: version 1.0
//! headers, little-endian scalar dtypes, C-order layout. Recordings,
//! spike-time label files, and persisted cluster results all use this
//! format so they stay interchangeable with standard numerical tooling.

use std::fs;
use std::io::Write;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{DataError, DataResult};

const MAGIC: &[u8] = b"\x93NUMPY";

/// Element type of an NPY payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F32,
    F64,
    I16,
    I32,
    I64,
}

impl Dtype {
    /// The dtype descriptor string used in headers.
    pub fn descr(&self) -> &'static str {
        match self {
            Dtype::F32 => "<f4",
            Dtype::F64 => "<f8",
            Dtype::I16 => "<i2",
            Dtype::I32 => "<i4",
            Dtype::I64 => "<i8",
        }
    }

    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Dtype::I16 => 2,
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::F64 | Dtype::I64 => 8,
        }
    }

    fn from_descr(descr: &str) -> Option<Self> {
        // Accept both '<' (little-endian) and '|' (not applicable) markers.
        match descr.trim_start_matches(['<', '|', '=']) {
            "f4" => Some(Dtype::F32),
            "f8" => Some(Dtype::F64),
            "i2" => Some(Dtype::I16),
            "i4" => Some(Dtype::I32),
            "i8" => Some(Dtype::I64),
            _ => None,
        }
    }

    /// Human-readable name for dataset info reporting.
    pub fn name(&self) -> &'static str {
        match self {
            Dtype::F32 => "float32",
            Dtype::F64 => "float64",
            Dtype::I16 => "int16",
            Dtype::I32 => "int32",
            Dtype::I64 => "int64",
        }
    }
}

/// Parsed NPY header.
#[derive(Debug, Clone)]
pub struct NpyHeader {
    pub dtype: Dtype,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
    /// Byte offset where the payload starts.
    pub data_offset: usize,
}

impl NpyHeader {
    /// Total number of elements described by the shape.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Parse the header of an NPY byte buffer (file contents or memory map).
pub fn parse_header(bytes: &[u8], path: &Path) -> DataResult<NpyHeader> {
    let parse_err = |message: &str| DataError::parse(path.display().to_string(), message);

    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(parse_err("not an NPY file"));
    }

    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (LittleEndian::read_u16(&bytes[8..10]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(parse_err("truncated header length"));
            }
            (LittleEndian::read_u32(&bytes[8..12]) as usize, 12)
        }
        _ => return Err(parse_err("unsupported NPY version")),
    };

    let data_offset = header_start + header_len;
    if bytes.len() < data_offset {
        return Err(parse_err("truncated header"));
    }

    let header = std::str::from_utf8(&bytes[header_start..data_offset])
        .map_err(|_| parse_err("header is not valid UTF-8"))?;

    let descr = dict_str_value(header, "descr").ok_or_else(|| parse_err("missing descr"))?;
    let dtype =
        Dtype::from_descr(&descr).ok_or_else(|| parse_err("unsupported dtype descriptor"))?;

    let fortran_order = header
        .split("'fortran_order'")
        .nth(1)
        .map(|rest| rest.trim_start_matches([':', ' ']).starts_with("True"))
        .ok_or_else(|| parse_err("missing fortran_order"))?;

    let shape = dict_shape_value(header).ok_or_else(|| parse_err("missing shape"))?;

    let expected = data_offset + shape.iter().product::<usize>() * dtype.size();
    if bytes.len() < expected {
        return Err(parse_err("payload shorter than header shape"));
    }

    Ok(NpyHeader {
        dtype,
        fortran_order,
        shape,
        data_offset,
    })
}

/// Extract a quoted string value for `key` from the header dict literal.
fn dict_str_value(header: &str, key: &str) -> Option<String> {
    let rest = header.split(&format!("'{key}'")).nth(1)?;
    let rest = rest.trim_start_matches([':', ' ']);
    let quote = rest.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let inner = &rest[1..];
    let end = inner.find(quote)?;
    Some(inner[..end].to_string())
}

/// Extract the shape tuple from the header dict literal.
fn dict_shape_value(header: &str) -> Option<Vec<usize>> {
    let rest = header.split("'shape'").nth(1)?;
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    let dims = rest[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<usize>().ok())
        .collect::<Option<Vec<_>>>()?;
    Some(dims)
}

/// Decode the payload as f32 values regardless of stored dtype.
pub fn decode_f32(header: &NpyHeader, bytes: &[u8]) -> Vec<f32> {
    let payload = &bytes[header.data_offset..];
    let count = header.element_count();
    match header.dtype {
        Dtype::F32 => {
            let mut out = vec![0f32; count];
            LittleEndian::read_f32_into(&payload[..count * 4], &mut out);
            out
        }
        Dtype::F64 => payload[..count * 8]
            .chunks_exact(8)
            .map(|c| LittleEndian::read_f64(c) as f32)
            .collect(),
        Dtype::I16 => payload[..count * 2]
            .chunks_exact(2)
            .map(|c| LittleEndian::read_i16(c) as f32)
            .collect(),
        Dtype::I32 => payload[..count * 4]
            .chunks_exact(4)
            .map(|c| LittleEndian::read_i32(c) as f32)
            .collect(),
        Dtype::I64 => payload[..count * 8]
            .chunks_exact(8)
            .map(|c| LittleEndian::read_i64(c) as f32)
            .collect(),
    }
}

/// Decode the payload as f64 values regardless of stored dtype.
pub fn decode_f64(header: &NpyHeader, bytes: &[u8]) -> Vec<f64> {
    let payload = &bytes[header.data_offset..];
    let count = header.element_count();
    match header.dtype {
        Dtype::F64 => {
            let mut out = vec![0f64; count];
            LittleEndian::read_f64_into(&payload[..count * 8], &mut out);
            out
        }
        Dtype::F32 => payload[..count * 4]
            .chunks_exact(4)
            .map(|c| LittleEndian::read_f32(c) as f64)
            .collect(),
        Dtype::I16 => payload[..count * 2]
            .chunks_exact(2)
            .map(|c| LittleEndian::read_i16(c) as f64)
            .collect(),
        Dtype::I32 => payload[..count * 4]
            .chunks_exact(4)
            .map(|c| LittleEndian::read_i32(c) as f64)
            .collect(),
        Dtype::I64 => payload[..count * 8]
            .chunks_exact(8)
            .map(|c| LittleEndian::read_i64(c) as f64)
            .collect(),
    }
}

/// Decode the payload as i64 values (spike times, cluster ids).
pub fn decode_i64(header: &NpyHeader, bytes: &[u8]) -> Vec<i64> {
    let payload = &bytes[header.data_offset..];
    let count = header.element_count();
    match header.dtype {
        Dtype::I64 => {
            let mut out = vec![0i64; count];
            LittleEndian::read_i64_into(&payload[..count * 8], &mut out);
            out
        }
        Dtype::I16 => payload[..count * 2]
            .chunks_exact(2)
            .map(|c| LittleEndian::read_i16(c) as i64)
            .collect(),
        Dtype::I32 => payload[..count * 4]
            .chunks_exact(4)
            .map(|c| LittleEndian::read_i32(c) as i64)
            .collect(),
        Dtype::F32 => payload[..count * 4]
            .chunks_exact(4)
            .map(|c| LittleEndian::read_f32(c) as i64)
            .collect(),
        Dtype::F64 => payload[..count * 8]
            .chunks_exact(8)
            .map(|c| LittleEndian::read_f64(c) as i64)
            .collect(),
    }
}

/// Serialize an f64 array to NPY bytes with the given shape.
pub fn to_bytes_f64(shape: &[usize], data: &[f64]) -> Vec<u8> {
    let mut bytes = header_bytes(Dtype::F64, shape);
    let mut payload = vec![0u8; data.len() * 8];
    LittleEndian::write_f64_into(data, &mut payload);
    bytes.extend_from_slice(&payload);
    bytes
}

/// Serialize an f32 array to NPY bytes with the given shape.
pub fn to_bytes_f32(shape: &[usize], data: &[f32]) -> Vec<u8> {
    let mut bytes = header_bytes(Dtype::F32, shape);
    let mut payload = vec![0u8; data.len() * 4];
    LittleEndian::write_f32_into(data, &mut payload);
    bytes.extend_from_slice(&payload);
    bytes
}

/// Write an f64 array to an NPY file with the given shape.
pub fn write_f64(path: &Path, shape: &[usize], data: &[f64]) -> DataResult<()> {
    let op = || format!("writing {}", path.display());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| DataError::io(op(), e))?;
    }
    let mut file = fs::File::create(path).map_err(|e| DataError::io(op(), e))?;
    file.write_all(&to_bytes_f64(shape, data))
        .map_err(|e| DataError::io(op(), e))?;
    Ok(())
}

/// Build a version 1.0 header for a C-order little-endian array.
fn header_bytes(dtype: Dtype, shape: &[usize]) -> Vec<u8> {
    let shape_str = match shape.len() {
        1 => format!("({},)", shape[0]),
        _ => format!(
            "({})",
            shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        dtype.descr(),
        shape_str
    );

    // Pad with spaces so the payload starts on a 64-byte boundary,
    // terminated by a newline.
    let unpadded = MAGIC.len() + 4 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    dict.extend(std::iter::repeat(' ').take(padding));
    dict.push('\n');

    let mut bytes = Vec::with_capacity(MAGIC.len() + 4 + dict.len());
    bytes.extend_from_slice(MAGIC);
    bytes.push(1);
    bytes.push(0);
    let mut len = [0u8; 2];
    LittleEndian::write_u16(&mut len, dict.len() as u16);
    bytes.extend_from_slice(&len);
    bytes.extend_from_slice(dict.as_bytes());
    bytes
}
