//! Candidate loaders for the on-disk recording variants.
//!
//! Loading is an ordered list of strategies, each inspecting the resolved
//! dataset path and returning `Ok(None)` when its layout does not apply;
//! the first match wins. Order encodes preference:
//!
//! 1. `<stem>_float32.npy` - preprocessed dense f32, memory-mapped.
//!    Always preferred: no per-request int-to-float conversion cost.
//! 2. `<stem>_mmap.npy` + `<stem>_shape.txt` - raw i16 memory map with an
//!    external shape descriptor.
//! 3. `<name>.npy` - generic tensor container, eagerly loaded and oriented
//!    so channels land on the first axis.
//! 4. Anything else - flat i16 stream reshaped with the configured default
//!    channel count.

use std::fs;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;

use crate::error::{DataError, DataResult};

use super::npy::{self, Dtype};
use super::store::{sibling, Recording, Storage};

struct LoadContext<'a> {
    path: &'a Path,
    name: &'a str,
    default_channels: usize,
}

type Loader = fn(&LoadContext) -> DataResult<Option<Recording>>;

const LOADERS: &[(&str, Loader)] = &[
    ("preprocessed_float32", preprocessed_float32),
    ("mapped_int16", mapped_int16),
    ("npy_container", npy_container),
    ("flat_int16", flat_int16),
];

/// Load a recording from a resolved path, trying each candidate in order.
pub(crate) fn load_recording(
    path: &Path,
    name: &str,
    default_channels: usize,
) -> DataResult<Recording> {
    let ctx = LoadContext {
        path,
        name,
        default_channels,
    };

    for &(loader_name, loader) in LOADERS {
        if let Some(recording) = loader(&ctx)? {
            tracing::debug!(loader = loader_name, dataset = name, "loader matched");
            return Ok(recording);
        }
    }

    // flat_int16 matches any existing file, so a resolved path never gets here
    Err(DataError::not_found("Recording", name))
}

/// Path of the preprocessed single-precision sibling for a dataset file.
pub(crate) fn preprocessed_sibling(path: &Path) -> std::path::PathBuf {
    sibling(path, "_float32.npy")
}

fn map_file(path: &Path) -> DataResult<Mmap> {
    let file = fs::File::open(path)
        .map_err(|e| DataError::io(format!("opening {}", path.display()), e))?;
    // Safety: recording files are opened read-only and are immutable once
    // written; nothing truncates them while the service holds the map.
    unsafe { Mmap::map(&file) }
        .map_err(|e| DataError::io(format!("mapping {}", path.display()), e))
}

/// Preprocessed dense f32 NPY sibling, memory-mapped read-only.
fn preprocessed_float32(ctx: &LoadContext) -> DataResult<Option<Recording>> {
    let path = preprocessed_sibling(ctx.path);
    if !path.exists() {
        return Ok(None);
    }

    let map = map_file(&path)?;
    let header = npy::parse_header(&map, &path)?;
    if header.dtype != Dtype::F32 || header.fortran_order || header.shape.len() != 2 {
        return Err(DataError::parse(
            path.display().to_string(),
            "preprocessed variant must be a C-order 2-D float32 array",
        ));
    }

    let (channels, samples) = (header.shape[0], header.shape[1]);
    let offset = header.data_offset;
    Ok(Some(Recording::new(
        ctx.name,
        channels,
        samples,
        Storage::MappedF32 { map, offset },
    )))
}

/// Raw i16 memory map with shape taken from the text descriptor sibling.
fn mapped_int16(ctx: &LoadContext) -> DataResult<Option<Recording>> {
    let data_path = sibling(ctx.path, "_mmap.npy");
    let shape_path = sibling(ctx.path, "_shape.txt");
    if !data_path.exists() || !shape_path.exists() {
        return Ok(None);
    }

    let shape_text = fs::read_to_string(&shape_path)
        .map_err(|e| DataError::io(format!("reading {}", shape_path.display()), e))?;
    let dims: Vec<usize> = shape_text
        .trim()
        .split(',')
        .map(|part| part.trim().parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|e| DataError::parse(shape_path.display().to_string(), e.to_string()))?;
    if dims.len() != 2 {
        return Err(DataError::parse(
            shape_path.display().to_string(),
            format!("expected 2 dimensions, got {}", dims.len()),
        ));
    }

    let (channels, samples) = (dims[0], dims[1]);
    let map = map_file(&data_path)?;
    if map.len() < channels * samples * 2 {
        return Err(DataError::parse(
            data_path.display().to_string(),
            "file shorter than the declared shape",
        ));
    }

    Ok(Some(Recording::new(
        ctx.name,
        channels,
        samples,
        Storage::MappedI16 { map },
    )))
}

/// Generic NPY tensor container, eagerly loaded into memory.
///
/// Multi-channel neural recordings have far more samples than channels, so
/// a matrix with more rows than columns is assumed to be sample-major and
/// is transposed to put channels on the first axis.
fn npy_container(ctx: &LoadContext) -> DataResult<Option<Recording>> {
    if ctx.path.extension().and_then(|e| e.to_str()) != Some("npy") {
        return Ok(None);
    }

    let bytes = fs::read(ctx.path)
        .map_err(|e| DataError::io(format!("reading {}", ctx.path.display()), e))?;
    let header = npy::parse_header(&bytes, ctx.path)?;
    if header.fortran_order {
        return Err(DataError::parse(
            ctx.path.display().to_string(),
            "Fortran-order arrays are not supported",
        ));
    }

    let data = npy::decode_f32(&header, &bytes);
    let (channels, samples, data) = match header.shape.len() {
        1 => (1, data.len(), data),
        2 => {
            let (rows, cols) = (header.shape[0], header.shape[1]);
            if rows > cols {
                tracing::info!(
                    dataset = ctx.name,
                    from = ?(rows, cols),
                    to = ?(cols, rows),
                    "transposing container to channel-major orientation"
                );
                (cols, rows, transpose(&data, rows, cols))
            } else {
                (rows, cols, data)
            }
        }
        dims => {
            return Err(DataError::UnsupportedShape {
                path: ctx.path.to_path_buf(),
                dims,
            })
        }
    };

    Ok(Some(Recording::new(
        ctx.name,
        channels,
        samples,
        Storage::InMemory { data },
    )))
}

/// Fallback: a flat i16 sample stream with no shape metadata.
///
/// The stream is interpreted as one frame of `default_channels` values per
/// sample tick (sample-major), which the recording exposes transposed as
/// channels x samples.
fn flat_int16(ctx: &LoadContext) -> DataResult<Option<Recording>> {
    let map = map_file(ctx.path)?;
    let total = map.len() / 2;
    let channels = ctx.default_channels;
    if total % channels != 0 {
        return Err(DataError::parse(
            ctx.path.display().to_string(),
            format!("{total} samples do not divide into {channels} channels"),
        ));
    }

    let samples = total / channels;
    Ok(Some(Recording::new(
        ctx.name,
        channels,
        samples,
        Storage::MappedI16Interleaved { map },
    )))
}

fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0f32; data.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn container_with_more_rows_than_columns_is_transposed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.npy");
        // 4 sample frames x 2 channels, stored sample-major
        let data = vec![1.0f32, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0];
        fs::write(&path, npy::to_bytes_f32(&[4, 2], &data)).unwrap();

        let rec = load_recording(&path, "rec.npy", 385).unwrap();
        assert_eq!(rec.channels(), 2);
        assert_eq!(rec.samples(), 4);
        assert_eq!(
            rec.channel_slice(2, 0, 4).unwrap(),
            vec![10.0, 20.0, 30.0, 40.0]
        );
    }

    #[test]
    fn one_dimensional_container_is_a_single_channel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mono.npy");
        fs::write(&path, npy::to_bytes_f32(&[5], &[1.0, 2.0, 3.0, 4.0, 5.0])).unwrap();

        let rec = load_recording(&path, "mono.npy", 385).unwrap();
        assert_eq!(rec.channels(), 1);
        assert_eq!(rec.samples(), 5);
    }

    #[test]
    fn three_dimensional_container_is_unsupported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cube.npy");
        fs::write(&path, npy::to_bytes_f32(&[2, 2, 2], &[0.0; 8])).unwrap();

        let err = load_recording(&path, "cube.npy", 385).unwrap_err();
        assert!(matches!(err, DataError::UnsupportedShape { dims: 3, .. }));
    }

    #[test]
    fn flat_stream_must_divide_into_channels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        fs::write(&path, vec![0u8; 10]).unwrap(); // 5 samples, 3 channels

        let err = load_recording(&path, "bad.bin", 3).unwrap_err();
        assert!(matches!(err, DataError::Parse { .. }));
    }
}
