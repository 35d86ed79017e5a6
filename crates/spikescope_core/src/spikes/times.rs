//! Precomputed spike-time index.
//!
//! Spike times come from per-dataset label files, either one global list
//! applied to every channel or a per-channel map. An absent index is a
//! valid state: the viewer simply has no detection overlay.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::config::PathSettings;
use crate::error::{DataError, DataResult};
use crate::recording::npy;

/// Direction for spike navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
}

impl Direction {
    /// Parse a direction name from a request; anything but "prev" means next.
    pub fn from_name(name: &str) -> Self {
        if name == "prev" {
            Self::Prev
        } else {
            Self::Next
        }
    }
}

/// Precomputed spike timestamps for one dataset.
#[derive(Debug, Clone)]
pub enum SpikeTimeIndex {
    /// One ordered list of sample indices applied to every channel.
    Global(Vec<i64>),
    /// Each channel has its own ordered list of sample indices.
    PerChannel(BTreeMap<usize, Vec<i64>>),
}

impl SpikeTimeIndex {
    /// Load the spike-time index associated with a dataset, if any.
    ///
    /// The dataset-to-label-file mapping and the label file itself are
    /// external bookkeeping; a missing mapping entry, a missing file, or an
    /// undecodable file all resolve to "no index" rather than an error.
    pub fn for_dataset(paths: &PathSettings, dataset: &str) -> Option<Self> {
        let label_file = match LabelMapping::load(&paths.label_mapping_path()) {
            Ok(mapping) => mapping.get(dataset).map(str::to_string),
            Err(err) => {
                tracing::warn!(%err, "could not read label mapping");
                None
            }
        }?;

        let label_path = paths.labels_folder().join(&label_file);
        if !label_path.exists() {
            tracing::warn!(path = %label_path.display(), "label file not found");
            return None;
        }

        match Self::load(&label_path) {
            Ok(index) => {
                tracing::info!(
                    dataset,
                    label = %label_file,
                    spikes = index.total_spikes(),
                    "spike times loaded"
                );
                Some(index)
            }
            Err(err) => {
                tracing::warn!(%err, path = %label_path.display(), "failed to load spike times");
                None
            }
        }
    }

    /// Load spike times from an NPY label file.
    ///
    /// A 1-D array is a global list; an `(n, 2)` array holds
    /// `[channel, time]` rows grouped into a per-channel index.
    pub fn load(path: &Path) -> DataResult<Self> {
        let bytes =
            fs::read(path).map_err(|e| DataError::io(format!("reading {}", path.display()), e))?;
        let header = npy::parse_header(&bytes, path)?;
        let values = npy::decode_i64(&header, &bytes);

        match header.shape.as_slice() {
            [_] => {
                let mut times = values;
                times.sort_unstable();
                Ok(Self::Global(times))
            }
            [_, 2] => {
                let mut by_channel: BTreeMap<usize, Vec<i64>> = BTreeMap::new();
                for row in values.chunks_exact(2) {
                    by_channel.entry(row[0] as usize).or_default().push(row[1]);
                }
                for times in by_channel.values_mut() {
                    times.sort_unstable();
                }
                Ok(Self::PerChannel(by_channel))
            }
            shape => Err(DataError::parse(
                path.display().to_string(),
                format!("expected a 1-D or (n, 2) label array, got shape {shape:?}"),
            )),
        }
    }

    /// Spike times for one channel inside `[start, end)`, window-relative.
    pub fn window_offsets(&self, channel_id: usize, start: i64, end: i64) -> Vec<usize> {
        let times: &[i64] = match self {
            Self::Global(times) => times,
            Self::PerChannel(map) => map
                .get(&channel_id)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        };
        times
            .iter()
            .filter(|&&t| t >= start && t < end)
            .map(|&t| (t - start) as usize)
            .collect()
    }

    /// Find the nearest spike strictly after/before `current_time` among the
    /// union of the given channels' spike times, wrapping around to the
    /// first/last spike when none exists in the requested direction.
    ///
    /// Returns the target time and the number of distinct spike times
    /// considered, or `None` when the index holds no spikes for the
    /// requested channels.
    pub fn navigate(
        &self,
        current_time: i64,
        direction: Direction,
        channels: &[usize],
    ) -> Option<(i64, usize)> {
        let mut all: Vec<i64> = match self {
            Self::Global(times) => times.clone(),
            Self::PerChannel(map) => channels
                .iter()
                .filter_map(|ch| map.get(ch))
                .flatten()
                .copied()
                .collect(),
        };
        if all.is_empty() {
            return None;
        }

        all.sort_unstable();
        all.dedup();

        let target = match direction {
            Direction::Next => all
                .iter()
                .find(|&&t| t > current_time)
                .copied()
                .unwrap_or(all[0]),
            Direction::Prev => all
                .iter()
                .rev()
                .find(|&&t| t < current_time)
                .copied()
                .unwrap_or(all[all.len() - 1]),
        };

        Some((target, all.len()))
    }

    /// Total number of recorded spike times.
    pub fn total_spikes(&self) -> usize {
        match self {
            Self::Global(times) => times.len(),
            Self::PerChannel(map) => map.values().map(Vec::len).sum(),
        }
    }

    /// Summary for availability queries.
    pub fn info(&self) -> SpikeTimesInfo {
        match self {
            Self::Global(times) => SpikeTimesInfo {
                available: true,
                kind: "global",
                count: times.len(),
                channels: Vec::new(),
            },
            Self::PerChannel(map) => SpikeTimesInfo {
                available: true,
                kind: "channel_specific",
                count: self.total_spikes(),
                channels: map.keys().copied().collect(),
            },
        }
    }
}

/// Availability summary for the spike-time index.
#[derive(Debug, Clone, Serialize)]
pub struct SpikeTimesInfo {
    pub available: bool,
    pub kind: &'static str,
    pub count: usize,
    pub channels: Vec<usize>,
}

impl SpikeTimesInfo {
    /// Info record for the no-index state.
    pub fn absent() -> Self {
        Self {
            available: false,
            kind: "none",
            count: 0,
            channels: Vec::new(),
        }
    }
}

/// Dataset-to-label-file mapping, kept as a JSON object on disk.
pub struct LabelMapping {
    entries: HashMap<String, String>,
}

impl LabelMapping {
    /// Load the mapping file; a missing file is an empty mapping.
    pub fn load(path: &Path) -> DataResult<Self> {
        if !path.exists() {
            return Ok(Self {
                entries: HashMap::new(),
            });
        }
        let content =
            fs::read_to_string(path).map_err(|e| DataError::io(format!("reading {}", path.display()), e))?;
        let entries = serde_json::from_str(&content)
            .map_err(|e| DataError::parse(path.display().to_string(), e.to_string()))?;
        Ok(Self { entries })
    }

    /// Label file name for a dataset, if mapped.
    pub fn get(&self, dataset: &str) -> Option<&str> {
        self.entries.get(dataset).map(String::as_str)
    }
}
