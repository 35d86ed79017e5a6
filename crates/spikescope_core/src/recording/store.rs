//! Recording access.
//!
//! A [`Recording`] is an immutable channels x samples matrix backed either
//! by a read-only memory map or by an eagerly loaded buffer. Recordings are
//! tens of gigabytes, so per-request reads only materialize the requested
//! window; the backing storage is never copied wholesale.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use serde::Serialize;

use crate::error::{DataError, DataResult};

use super::loaders;

/// Backing storage for a recording.
#[derive(Debug)]
pub(crate) enum Storage {
    /// Preprocessed dense f32 NPY, memory-mapped; payload starts at `offset`.
    MappedF32 { map: Mmap, offset: usize },
    /// Channel-major flat i16, memory-mapped.
    MappedI16 { map: Mmap },
    /// Sample-major flat i16 (samples x channels), memory-mapped.
    /// Produced by the shapeless flat-binary fallback, which stores one
    /// frame of all channels per sample tick.
    MappedI16Interleaved { map: Mmap },
    /// Eagerly loaded f32, channel-major.
    InMemory { data: Vec<f32> },
}

/// One loaded recording: an immutable channels x samples matrix.
#[derive(Debug)]
pub struct Recording {
    name: String,
    channels: usize,
    samples: usize,
    storage: Storage,
}

impl Recording {
    pub(crate) fn new(name: &str, channels: usize, samples: usize, storage: Storage) -> Self {
        Self {
            name: name.to_string(),
            channels,
            samples,
            storage,
        }
    }

    /// Build a recording from an in-memory channel-major matrix.
    ///
    /// `data.len()` must be a multiple of `channels`. Mostly useful for
    /// synthetic data and tests; real datasets go through [`RecordingStore`].
    pub fn from_matrix(name: &str, channels: usize, data: Vec<f32>) -> Self {
        assert!(channels > 0, "channel count must be positive");
        assert!(
            data.len() % channels == 0,
            "matrix length {} does not divide into {} channels",
            data.len(),
            channels
        );
        let samples = data.len() / channels;
        Self::new(name, channels, samples, Storage::InMemory { data })
    }

    /// Dataset name this recording was loaded from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of channels (first axis).
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of samples per channel (second axis).
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Element type name of the backing storage.
    pub fn dtype_name(&self) -> &'static str {
        match self.storage {
            Storage::MappedF32 { .. } | Storage::InMemory { .. } => "float32",
            Storage::MappedI16 { .. } | Storage::MappedI16Interleaved { .. } => "int16",
        }
    }

    /// Read one channel's samples over `[start, end)`.
    ///
    /// `channel_id` is 1-indexed. Returns `None` when the channel is outside
    /// `1..=channels`; `start` and `end` are clamped to the recorded range.
    pub fn channel_slice(&self, channel_id: usize, start: usize, end: usize) -> Option<Vec<f64>> {
        if channel_id < 1 || channel_id > self.channels {
            return None;
        }
        let row = channel_id - 1;
        let start = start.min(self.samples);
        let end = end.min(self.samples);
        if end <= start {
            return Some(Vec::new());
        }

        let out = match &self.storage {
            Storage::MappedF32 { map, offset } => {
                let from = offset + (row * self.samples + start) * 4;
                let to = offset + (row * self.samples + end) * 4;
                map[from..to]
                    .chunks_exact(4)
                    .map(|c| LittleEndian::read_f32(c) as f64)
                    .collect()
            }
            Storage::MappedI16 { map } => {
                let from = (row * self.samples + start) * 2;
                let to = (row * self.samples + end) * 2;
                map[from..to]
                    .chunks_exact(2)
                    .map(|c| LittleEndian::read_i16(c) as f64)
                    .collect()
            }
            Storage::MappedI16Interleaved { map } => (start..end)
                .map(|s| {
                    let at = (s * self.channels + row) * 2;
                    LittleEndian::read_i16(&map[at..at + 2]) as f64
                })
                .collect(),
            Storage::InMemory { data } => data[row * self.samples + start..row * self.samples + end]
                .iter()
                .map(|&v| v as f64)
                .collect(),
        };
        Some(out)
    }

    /// Materialize the full recording as a dense channel-major f32 tensor.
    ///
    /// Borrows when the storage is already single-precision in memory;
    /// sorting runs are the only callers, so the conversion cost is paid
    /// once per run rather than per visualization request.
    pub fn to_dense(&self) -> DenseTensor<'_> {
        let data: Cow<'_, [f32]> = match &self.storage {
            Storage::InMemory { data } => Cow::Borrowed(data.as_slice()),
            Storage::MappedF32 { map, offset } => Cow::Owned(
                map[*offset..*offset + self.channels * self.samples * 4]
                    .chunks_exact(4)
                    .map(LittleEndian::read_f32)
                    .collect(),
            ),
            Storage::MappedI16 { map } => Cow::Owned(
                map[..self.channels * self.samples * 2]
                    .chunks_exact(2)
                    .map(|c| LittleEndian::read_i16(c) as f32)
                    .collect(),
            ),
            Storage::MappedI16Interleaved { .. } => {
                let mut data = vec![0f32; self.channels * self.samples];
                for ch in 1..=self.channels {
                    let row = self.channel_slice(ch, 0, self.samples).unwrap_or_default();
                    for (s, v) in row.into_iter().enumerate() {
                        data[(ch - 1) * self.samples + s] = v as f32;
                    }
                }
                Cow::Owned(data)
            }
        };
        DenseTensor {
            data,
            channels: self.channels,
            samples: self.samples,
        }
    }

    /// Summary for dataset info queries.
    pub fn info(&self) -> RecordingInfo {
        RecordingInfo {
            loaded: true,
            dataset: self.name.clone(),
            channels: self.channels,
            total_samples: Some(self.samples),
            dtype: Some(self.dtype_name().to_string()),
        }
    }
}

/// Dense channel-major view of a full recording, for sorting runs.
pub struct DenseTensor<'a> {
    pub data: Cow<'a, [f32]>,
    pub channels: usize,
    pub samples: usize,
}

impl DenseTensor<'_> {
    /// One channel's full sample row.
    pub fn channel(&self, row: usize) -> &[f32] {
        &self.data[row * self.samples..(row + 1) * self.samples]
    }
}

/// Dataset information exposed at the service boundary.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingInfo {
    pub loaded: bool,
    pub dataset: String,
    pub channels: usize,
    pub total_samples: Option<usize>,
    pub dtype: Option<String>,
}

impl RecordingInfo {
    /// Info record for the no-recording-loaded state.
    pub fn absent(dataset: &str, channels: usize) -> Self {
        Self {
            loaded: false,
            dataset: dataset.to_string(),
            channels,
            total_samples: None,
            dtype: None,
        }
    }
}

/// Opens named recording files, preferring preprocessed on-disk variants.
pub struct RecordingStore {
    datasets_folder: PathBuf,
    default_channels: usize,
}

impl RecordingStore {
    /// Create a store rooted at the given datasets folder.
    pub fn new(datasets_folder: impl Into<PathBuf>, default_channels: usize) -> Self {
        Self {
            datasets_folder: datasets_folder.into(),
            default_channels,
        }
    }

    /// Resolve a dataset name to an existing file path.
    ///
    /// Names are looked up under the datasets folder first, then treated as
    /// a literal path.
    pub fn resolve_path(&self, name: &str) -> Option<PathBuf> {
        let in_folder = self.datasets_folder.join(name);
        if in_folder.exists() {
            return Some(in_folder);
        }
        let literal = PathBuf::from(name);
        if literal.exists() {
            return Some(literal);
        }
        None
    }

    /// Load a recording by dataset name.
    ///
    /// Tries each candidate loader in order of preference and takes the
    /// first that matches the on-disk layout (see [`loaders`]).
    pub fn load(&self, name: &str) -> DataResult<Recording> {
        let path = self
            .resolve_path(name)
            .ok_or_else(|| DataError::not_found("Dataset", name))?;

        let recording = loaders::load_recording(&path, name, self.default_channels)?;
        tracing::info!(
            dataset = name,
            channels = recording.channels(),
            samples = recording.samples(),
            dtype = recording.dtype_name(),
            "recording loaded"
        );
        Ok(recording)
    }

    /// Whether a preprocessed single-precision variant exists for a dataset.
    pub fn has_preprocessed(&self, name: &str) -> bool {
        self.resolve_path(name)
            .map(|path| loaders::preprocessed_sibling(&path).exists())
            .unwrap_or(false)
    }
}

/// Build the sibling path `<stem><suffix>` next to `path`.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::npy;
    use std::fs;
    use tempfile::tempdir;

    fn write_f32_npy(path: &Path, shape: &[usize], data: &[f32]) {
        fs::write(path, npy::to_bytes_f32(shape, data)).unwrap();
    }

    #[test]
    fn load_fails_for_unknown_dataset() {
        let dir = tempdir().unwrap();
        let store = RecordingStore::new(dir.path(), 385);
        let err = store.load("missing.bin").unwrap_err();
        assert!(matches!(err, DataError::NotFound { .. }));
    }

    #[test]
    fn preprocessed_variant_is_preferred() {
        let dir = tempdir().unwrap();
        // The container holds different values than the f32 sibling; the
        // sibling must win.
        write_f32_npy(&dir.path().join("rec.npy"), &[2, 3], &[9.0; 6]);
        write_f32_npy(
            &dir.path().join("rec_float32.npy"),
            &[2, 3],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        );

        let store = RecordingStore::new(dir.path(), 385);
        let rec = store.load("rec.npy").unwrap();
        assert_eq!(rec.channel_slice(1, 0, 3).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(rec.dtype_name(), "float32");
        assert!(store.has_preprocessed("rec.npy"));
    }

    #[test]
    fn mapped_i16_with_shape_descriptor() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("rec.bin"), b"").unwrap();
        // 2 channels x 4 samples, channel-major
        let values: [i16; 8] = [10, 11, 12, 13, 20, 21, 22, 23];
        let mut bytes = vec![0u8; 16];
        LittleEndian::write_i16_into(&values, &mut bytes);
        fs::write(dir.path().join("rec_mmap.npy"), &bytes).unwrap();
        fs::write(dir.path().join("rec_shape.txt"), "2,4").unwrap();

        let store = RecordingStore::new(dir.path(), 385);
        let rec = store.load("rec.bin").unwrap();
        assert_eq!(rec.channels(), 2);
        assert_eq!(rec.samples(), 4);
        assert_eq!(
            rec.channel_slice(2, 1, 3).unwrap(),
            vec![21.0, 22.0]
        );
    }

    #[test]
    fn flat_binary_reshapes_with_default_channel_count() {
        let dir = tempdir().unwrap();
        // 385 channels x 40 sample frames, sample-major on disk
        let channels = 385usize;
        let frames = 40usize;
        let mut values = vec![0i16; channels * frames];
        for s in 0..frames {
            for ch in 0..channels {
                values[s * channels + ch] = (ch as i16) * 100 + s as i16;
            }
        }
        let mut bytes = vec![0u8; values.len() * 2];
        LittleEndian::write_i16_into(&values, &mut bytes);
        fs::write(dir.path().join("raw.bin"), &bytes).unwrap();

        let store = RecordingStore::new(dir.path(), channels);
        let rec = store.load("raw.bin").unwrap();
        assert_eq!(rec.channels(), 385);
        assert_eq!(rec.samples(), frames);
        // Channel 3 (1-indexed) holds 200 + sample index after the transpose
        assert_eq!(
            rec.channel_slice(3, 0, 4).unwrap(),
            vec![200.0, 201.0, 202.0, 203.0]
        );
    }

    #[test]
    fn channel_slice_clamps_and_validates() {
        let dir = tempdir().unwrap();
        write_f32_npy(
            &dir.path().join("rec_float32.npy"),
            &[1, 5],
            &[0.0, 1.0, 2.0, 3.0, 4.0],
        );
        fs::write(dir.path().join("rec.bin"), b"").unwrap();

        let store = RecordingStore::new(dir.path(), 385);
        let rec = store.load("rec.bin").unwrap();

        // end clamped to sample count
        assert_eq!(rec.channel_slice(1, 3, 50).unwrap(), vec![3.0, 4.0]);
        // channel ids outside 1..=channels yield None
        assert!(rec.channel_slice(0, 0, 5).is_none());
        assert!(rec.channel_slice(2, 0, 5).is_none());
        // inverted ranges yield an empty window
        assert!(rec.channel_slice(1, 4, 2).unwrap().is_empty());
    }

    #[test]
    fn dense_tensor_borrows_in_memory_f32() {
        let rec = Recording::new(
            "mem",
            2,
            3,
            Storage::InMemory {
                data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            },
        );
        let dense = rec.to_dense();
        assert!(matches!(dense.data, Cow::Borrowed(_)));
        assert_eq!(dense.channel(1), &[4.0, 5.0, 6.0]);
    }
}
