//! Core types for clustering results.
//!
//! All three result provenances (in-process run, remote GPU run, reloaded
//! on-disk cache) normalize into one [`ClusterSet`] shape, so statistics
//! and waveform queries never need to know where a result came from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Sorting algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    /// Clustering over detected waveform features.
    WaveformClustering,
    /// Template-matching pipeline over the raw binary.
    TemplateMatching,
}

impl AlgorithmKind {
    /// Stable name used in requests and persisted file names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WaveformClustering => "waveform_clustering",
            Self::TemplateMatching => "template_matching",
        }
    }

    /// Parse an algorithm name from a request.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "waveform_clustering" => Some(Self::WaveformClustering),
            "template_matching" => Some(Self::TemplateMatching),
            _ => None,
        }
    }

    /// File name the persisted result set uses, namespaced per family.
    pub fn results_file_name(&self) -> String {
        format!("{}_results.npy", self.name())
    }
}

/// Where the current result set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Produced by an in-process sorting run.
    Local,
    /// Produced by the remote GPU worker.
    Remote,
    /// Rebuilt from a persisted result file.
    Reloaded,
}

/// One sorted spike: 2-D projection coordinates, assigned channel
/// (1-indexed), absolute sample time, and dense index within its cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSpike {
    pub x: f64,
    pub y: f64,
    pub channel: usize,
    pub time: i64,
    pub index: usize,
}

/// A normalized sorting result: an ordered sequence of clusters, each an
/// ordered sequence of spikes. Exactly one set is current at a time.
#[derive(Debug, Clone)]
pub struct ClusterSet {
    pub clusters: Vec<Vec<ClusterSpike>>,
    pub algorithm: AlgorithmKind,
    pub provenance: Provenance,
}

impl ClusterSet {
    /// Number of clusters.
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Whether the set holds no clusters.
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Total spike count across all clusters.
    pub fn total_spikes(&self) -> usize {
        self.clusters.iter().map(Vec::len).sum()
    }

    /// Flatten into persisted row order: `[x, y, cluster_id, time, channel]`.
    pub fn to_rows(&self) -> Vec<f64> {
        let mut rows = Vec::with_capacity(self.total_spikes() * 5);
        for (cluster_id, spikes) in self.clusters.iter().enumerate() {
            for spike in spikes {
                rows.extend_from_slice(&[
                    spike.x,
                    spike.y,
                    cluster_id as f64,
                    spike.time as f64,
                    spike.channel as f64,
                ]);
            }
        }
        rows
    }

    /// Rebuild the grouped-by-cluster structure from flat rows.
    ///
    /// Rows are grouped by their cluster-id column in ascending id order;
    /// the index within each cluster is re-densified to `0..n`.
    pub fn from_rows(rows: &[f64], algorithm: AlgorithmKind, provenance: Provenance) -> Self {
        let mut grouped: BTreeMap<i64, Vec<ClusterSpike>> = BTreeMap::new();
        for row in rows.chunks_exact(5) {
            let cluster_id = row[2] as i64;
            let spikes = grouped.entry(cluster_id).or_default();
            spikes.push(ClusterSpike {
                x: row[0],
                y: row[1],
                channel: row[4] as usize,
                time: row[3] as i64,
                index: spikes.len(),
            });
        }

        Self {
            clusters: grouped.into_values().collect(),
            algorithm,
            provenance,
        }
    }
}

/// Summary of a completed sorting run, exposed at the service boundary.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub algorithm: AlgorithmKind,
    pub provenance: Provenance,
    pub num_clusters: usize,
    pub num_spikes: usize,
    pub data_shape: (usize, usize),
    pub clusters: Vec<ClusterOverview>,
}

/// Per-cluster slice of a run summary.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterOverview {
    pub cluster_id: usize,
    pub num_spikes: usize,
    /// Distinct assigned channels, ascending.
    pub channels: Vec<usize>,
    /// Earliest and latest spike time, when the cluster is non-empty.
    pub time_range: Option<(i64, i64)>,
}

impl ClusterOverview {
    /// Build the overview for one cluster.
    pub fn of(cluster_id: usize, spikes: &[ClusterSpike]) -> Self {
        let mut channels: Vec<usize> = spikes.iter().map(|s| s.channel).collect();
        channels.sort_unstable();
        channels.dedup();

        let time_range = spikes
            .iter()
            .map(|s| s.time)
            .fold(None, |acc: Option<(i64, i64)>, t| match acc {
                None => Some((t, t)),
                Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
            });

        Self {
            cluster_id,
            num_spikes: spikes.len(),
            channels,
            time_range,
        }
    }
}

/// Derived per-cluster quality statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatistics {
    /// Fraction of consecutive inter-spike intervals shorter than the
    /// refractory threshold; high values indicate double-counted or
    /// misassigned spikes.
    pub isi_violation_rate: f64,
    pub num_spikes: usize,
    /// Most frequent assigned channel among the cluster's spikes.
    pub peak_channel: usize,
    /// Centroid of the 2-D projection, rounded to integers.
    pub mean_position: (i64, i64),
}

/// One extracted waveform snippet with its millisecond time axis.
#[derive(Debug, Clone, Serialize)]
pub struct Waveform {
    /// Time axis in milliseconds, centered on the spike.
    pub time_ms: Vec<f64>,
    /// Z-score normalized amplitudes.
    pub amplitude: Vec<f64>,
}

/// Waveforms for one channel of a multi-channel query.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelWaveforms {
    pub channel_id: usize,
    pub waveforms: Vec<Waveform>,
    /// Whether this channel is the cluster's peak channel.
    pub is_peak: bool,
}

/// Result of a multi-channel waveform query: the peak channel plus its
/// neighbors.
#[derive(Debug, Clone, Serialize)]
pub struct MultiChannelWaveforms {
    pub cluster_id: usize,
    pub peak_channel: usize,
    pub channels: BTreeMap<usize, ChannelWaveforms>,
}
