//! Call contracts for the external sorting algorithms.
//!
//! The algorithms themselves are black boxes supplied by the embedding
//! application (in-process GPU code, FFI, or subprocess wrappers). This
//! module pins down the narrow interface the result store invokes them
//! through; their internal correctness is not this crate's concern.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::DataResult;
use crate::recording::DenseTensor;

/// Parameter bag for the waveform-clustering algorithm.
///
/// Defaults are the tuned values used in production; callers override
/// individual fields per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringParams {
    /// Detection window size in samples.
    pub window_size: usize,
    /// Detection threshold on the filtered amplitude.
    pub threshold: i64,
    /// Frame size around each detection.
    pub frame_size: usize,
    /// Per-spike normalization mode.
    pub normalize: String,
    /// Detection ordering mode.
    pub sort_by: String,
    /// Channel distance within which near-duplicate detections merge.
    pub leniency_channel: usize,
    /// Time distance (samples) within which near-duplicate detections merge.
    pub leniency_time: usize,
    /// Similarity metric for cluster assignment.
    pub similarity_mode: String,
    /// Spikes less similar than this to every centroid are rejected.
    pub outlier_threshold: f64,
    /// Number of clusters to produce.
    pub n_clusters: usize,
    /// Feature vector size per cluster centroid.
    pub cluster_feature_size: usize,
    /// Feature vector size per spike.
    pub n_features: usize,
    /// Padding value for windows at the recording edges.
    pub pad_value: i64,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self {
            window_size: 3,
            threshold: 36,
            frame_size: 13,
            normalize: "zscore".to_string(),
            sort_by: "value".to_string(),
            leniency_channel: 7,
            leniency_time: 32,
            similarity_mode: "cosine".to_string(),
            outlier_threshold: 0.8,
            n_clusters: 8,
            cluster_feature_size: 7,
            n_features: 7,
            pad_value: 0,
        }
    }
}

/// Per-spike metadata reported by the clustering algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpikeMeta {
    /// Assigned channel, 1-indexed.
    pub channel: usize,
    /// Absolute sample time.
    pub time: i64,
}

/// One raw cluster as reported by the clustering algorithm, before
/// normalization and projection.
#[derive(Debug, Clone)]
pub struct RawCluster {
    /// One feature vector per spike.
    pub features: Vec<Vec<f64>>,
    /// Cluster centroid in feature space.
    pub centroid: Vec<f64>,
    /// Per-spike (channel, time) metadata, parallel to `features`.
    pub spikes: Vec<SpikeMeta>,
}

/// In-process waveform-clustering algorithm.
pub trait ClusteringBackend: Send + Sync {
    /// Run clustering over the dense channels x samples tensor.
    fn run(&self, data: &DenseTensor<'_>, params: &ClusteringParams) -> DataResult<Vec<RawCluster>>;
}

/// Settings handed to the template-matching pipeline.
#[derive(Debug, Clone)]
pub struct TemplateMatchingSettings {
    /// Flat binary file holding samples x channels f32 data.
    pub data_path: PathBuf,
    /// Number of channels in the binary.
    pub channel_count: usize,
    /// Acquisition sampling rate in Hz.
    pub sampling_rate: u32,
    /// Processing batch size in samples.
    pub batch_size: usize,
    /// Drift-correction block count.
    pub blocks: usize,
    /// Probe geometry file.
    pub probe_path: PathBuf,
    /// Directory the pipeline may write artifacts into.
    pub results_dir: PathBuf,
}

/// Raw output of the template-matching pipeline: parallel arrays of spike
/// times and their cluster assignments.
#[derive(Debug, Clone)]
pub struct TemplateMatchingOutput {
    pub spike_times: Vec<i64>,
    pub spike_clusters: Vec<i64>,
}

/// In-process template-matching pipeline.
///
/// Implementations may write artifacts relative to the current working
/// directory; the result store runs them inside an isolated temporary
/// directory and restores the original directory afterwards.
pub trait TemplateMatchingBackend: Send + Sync {
    fn run(&self, settings: &TemplateMatchingSettings) -> DataResult<TemplateMatchingOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clustering_defaults_match_tuned_values() {
        let params = ClusteringParams::default();
        assert_eq!(params.window_size, 3);
        assert_eq!(params.threshold, 36);
        assert_eq!(params.leniency_time, 32);
        assert_eq!(params.n_clusters, 8);
        assert_eq!(params.similarity_mode, "cosine");
    }

    #[test]
    fn partial_params_json_fills_defaults() {
        let params: ClusteringParams =
            serde_json::from_str(r#"{"n_clusters": 12, "threshold": 40}"#).unwrap();
        assert_eq!(params.n_clusters, 12);
        assert_eq!(params.threshold, 40);
        assert_eq!(params.frame_size, 13);
        assert_eq!(params.normalize, "zscore");
    }
}
