//! The clustering result store.
//!
//! Owns the single "current result" slot and the three ways a result can
//! arrive: an in-process run, a remote GPU run, or a reload of a persisted
//! file. Every path converges on the same normalized [`ClusterSet`] before
//! publication, so statistics and waveform queries are provenance-blind.
//!
//! Results persist beside the dataset label files as flat
//! `[x, y, cluster_id, time, channel]` rows, namespaced per algorithm
//! family, letting a completed run outlive a restart without re-invoking
//! the (expensive) algorithm.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use rand::seq::index::sample as sample_indices;

use crate::config::{Settings, SortingSettings};
use crate::error::{DataError, DataResult};
use crate::recording::{npy, Recording};
use crate::remote::RemoteExecutionClient;

use super::algorithms::{
    ClusteringBackend, ClusteringParams, TemplateMatchingBackend, TemplateMatchingSettings,
};
use super::projection::{project_with_subsample, Projection};
use super::types::{
    AlgorithmKind, ChannelWaveforms, ClusterOverview, ClusterSet, ClusterSpike, ClusterStatistics,
    MultiChannelWaveforms, Provenance, RunSummary, Waveform,
};

/// Default cap on waveforms returned per cluster.
pub const DEFAULT_MAX_WAVEFORMS: usize = 100;

/// Default cap on waveforms per channel in multi-channel queries.
pub const DEFAULT_MAX_MULTI_WAVEFORMS: usize = 50;

/// Default half-width in samples of an extracted waveform snippet.
pub const DEFAULT_WAVEFORM_HALFWIDTH: usize = 30;

/// Refractory threshold for ISI violation counting, in seconds.
const ISI_REFRACTORY_SECS: f64 = 0.002;

/// Half-width in samples of the all-channel window used to assign each
/// template-matched spike a peak channel.
const PEAK_WINDOW_HALFWIDTH: usize = 15;

/// Neighbor offsets for multi-channel waveform queries.
const NEIGHBOR_OFFSETS: [i64; 5] = [-2, -1, 0, 1, 2];

/// Stores and serves the current clustering result.
pub struct ClusterResultStore {
    labels_folder: PathBuf,
    sampling_rate: u32,
    sorting: SortingSettings,
    clustering_backend: Option<Box<dyn ClusteringBackend>>,
    template_backend: Option<Box<dyn TemplateMatchingBackend>>,
    remote: Option<RemoteExecutionClient>,
    current: Option<ClusterSet>,
}

impl ClusterResultStore {
    /// Create a store with no backends registered.
    pub fn new(settings: &Settings) -> Self {
        Self {
            labels_folder: settings.paths.labels_folder(),
            sampling_rate: settings.signal.sampling_rate,
            sorting: settings.sorting.clone(),
            clustering_backend: None,
            template_backend: None,
            remote: None,
            current: None,
        }
    }

    /// Register the in-process waveform-clustering backend.
    pub fn with_clustering_backend(mut self, backend: Box<dyn ClusteringBackend>) -> Self {
        self.clustering_backend = Some(backend);
        self
    }

    /// Register the in-process template-matching backend.
    pub fn with_template_backend(mut self, backend: Box<dyn TemplateMatchingBackend>) -> Self {
        self.template_backend = Some(backend);
        self
    }

    /// Register a remote execution client; when present, all runs offload.
    pub fn with_remote(mut self, remote: RemoteExecutionClient) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Whether the algorithm can run: remotely (always, the worker carries
    /// its own dependencies) or through a registered local backend.
    pub fn is_available(&self, algorithm: AlgorithmKind) -> bool {
        if self.remote.is_some() {
            return true;
        }
        match algorithm {
            AlgorithmKind::WaveformClustering => self.clustering_backend.is_some(),
            AlgorithmKind::TemplateMatching => self.template_backend.is_some(),
        }
    }

    /// The current result set, if any.
    pub fn current(&self) -> Option<&ClusterSet> {
        self.current.as_ref()
    }

    /// Publish a fully built result set as current.
    ///
    /// This is the only setter: local runs, remote runs, and reloads all
    /// pass through here, replacing the previous set wholesale.
    pub fn set_current(&mut self, set: ClusterSet) {
        tracing::info!(
            algorithm = set.algorithm.name(),
            provenance = ?set.provenance,
            clusters = set.len(),
            spikes = set.total_spikes(),
            "clustering result published"
        );
        self.current = Some(set);
    }

    /// Discard the current result set.
    pub fn clear(&mut self) {
        self.current = None;
    }

    /// Run a sorting algorithm over the recording and publish its result.
    pub fn run(
        &mut self,
        algorithm: AlgorithmKind,
        recording: &Recording,
        params: &ClusteringParams,
    ) -> DataResult<RunSummary> {
        tracing::info!(
            algorithm = algorithm.name(),
            shape = ?(recording.channels(), recording.samples()),
            "starting sorting run"
        );

        let set = if let Some(remote) = &self.remote {
            let dense = recording.to_dense();
            let params_json = serde_json::to_value(params)
                .map_err(|e| DataError::parse("sorting params", e.to_string()))?;
            let dataset_info = serde_json::json!({
                "probe_path": self.sorting.probe_path,
                "sampling_rate": self.sampling_rate,
            });
            remote.run_algorithm(algorithm, &dense, &params_json, &dataset_info)?
        } else {
            match algorithm {
                AlgorithmKind::WaveformClustering => self.run_clustering_local(recording, params)?,
                AlgorithmKind::TemplateMatching => self.run_template_local(recording)?,
            }
        };

        let summary = RunSummary {
            algorithm,
            provenance: set.provenance,
            num_clusters: set.len(),
            num_spikes: set.total_spikes(),
            data_shape: (recording.channels(), recording.samples()),
            clusters: set
                .clusters
                .iter()
                .enumerate()
                .map(|(id, spikes)| ClusterOverview::of(id, spikes))
                .collect(),
        };

        self.set_current(set);
        self.persist()?;
        Ok(summary)
    }

    /// In-process waveform clustering.
    ///
    /// Each raw cluster's spikes sort by time, then all spikes across all
    /// clusters project through one shared 2-D fit so clusters share a
    /// coordinate system; the projected coordinates slice back out along
    /// the original cluster boundaries.
    fn run_clustering_local(
        &self,
        recording: &Recording,
        params: &ClusteringParams,
    ) -> DataResult<ClusterSet> {
        let backend = self
            .clustering_backend
            .as_ref()
            .ok_or_else(|| DataError::algorithm_unavailable(AlgorithmKind::WaveformClustering.name()))?;

        let dense = recording.to_dense();
        let mut raw = backend.run(&dense, params)?;

        for cluster in &mut raw {
            let mut order: Vec<usize> = (0..cluster.spikes.len()).collect();
            order.sort_by_key(|&i| cluster.spikes[i].time);
            let spikes = order.iter().map(|&i| cluster.spikes[i]).collect();
            let features = order.iter().map(|&i| cluster.features[i].clone()).collect();
            cluster.spikes = spikes;
            cluster.features = features;
        }

        let all_features: Vec<Vec<f64>> = raw
            .iter()
            .flat_map(|c| c.features.iter().cloned())
            .collect();
        let coords = Projection::fit(&all_features).transform_all(&all_features);

        let mut clusters = Vec::with_capacity(raw.len());
        let mut at = 0;
        for cluster in &raw {
            let spikes = cluster
                .spikes
                .iter()
                .enumerate()
                .map(|(index, meta)| {
                    let (x, y) = coords[at + index];
                    ClusterSpike {
                        x,
                        y,
                        channel: meta.channel,
                        time: meta.time,
                        index,
                    }
                })
                .collect();
            at += cluster.spikes.len();
            clusters.push(spikes);
        }

        Ok(ClusterSet {
            clusters,
            algorithm: AlgorithmKind::WaveformClustering,
            provenance: Provenance::Local,
        })
    }

    /// In-process template matching.
    ///
    /// The pipeline consumes a flat samples x channels binary and writes
    /// artifacts relative to the current directory, so it runs inside an
    /// isolated temporary directory; the original directory is restored and
    /// the temporary tree deleted whether the run succeeds or fails.
    ///
    /// The pipeline does not report a peak channel per spike, so one is
    /// assigned here: the channel with the largest absolute
    /// baseline-corrected deviation in a fixed window around the spike.
    fn run_template_local(&self, recording: &Recording) -> DataResult<ClusterSet> {
        let backend = self
            .template_backend
            .as_ref()
            .ok_or_else(|| DataError::algorithm_unavailable(AlgorithmKind::TemplateMatching.name()))?;

        let dense = recording.to_dense();
        let (channels, samples) = (dense.channels, dense.samples);

        // samples x channels layout, one frame per tick
        let mut interleaved = vec![0f32; channels * samples];
        for ch in 0..channels {
            let row = dense.channel(ch);
            for (s, &v) in row.iter().enumerate() {
                interleaved[s * channels + ch] = v;
            }
        }

        let mut data_file = tempfile::Builder::new()
            .prefix("sorting_input_")
            .suffix(".bin")
            .tempfile()
            .map_err(|e| DataError::io("creating temporary binary".to_string(), e))?;
        let mut bytes = vec![0u8; interleaved.len() * 4];
        LittleEndian::write_f32_into(&interleaved, &mut bytes);
        data_file
            .write_all(&bytes)
            .map_err(|e| DataError::io("writing temporary binary".to_string(), e))?;
        drop(bytes);
        drop(interleaved);

        let results_dir = tempfile::Builder::new()
            .prefix("template_matching_")
            .tempdir()
            .map_err(|e| DataError::io("creating results directory".to_string(), e))?;

        let settings = TemplateMatchingSettings {
            data_path: data_file.path().to_path_buf(),
            channel_count: channels,
            sampling_rate: self.sampling_rate,
            batch_size: self.sorting.batch_size,
            blocks: self.sorting.blocks,
            probe_path: PathBuf::from(&self.sorting.probe_path),
            results_dir: results_dir.path().to_path_buf(),
        };

        let output = {
            let _cwd = WorkingDirGuard::enter(results_dir.path())?;
            backend.run(&settings)
        }?;

        tracing::info!(
            spikes = output.spike_times.len(),
            "template matching finished, assigning peak channels"
        );

        // Group spikes by cluster id, ascending, keeping output order
        let mut cluster_ids: Vec<i64> = output.spike_clusters.clone();
        cluster_ids.sort_unstable();
        cluster_ids.dedup();

        let half = PEAK_WINDOW_HALFWIDTH;
        let mut waveforms: Vec<Vec<f64>> = Vec::new();
        let mut flat_meta: Vec<(usize, i64)> = Vec::new(); // (peak channel, time)
        let mut cluster_sizes: Vec<usize> = Vec::new();

        for &cluster_id in &cluster_ids {
            let mut size = 0;
            for (i, &assigned) in output.spike_clusters.iter().enumerate() {
                if assigned != cluster_id {
                    continue;
                }
                let time = output.spike_times[i];
                // Spikes too close to either edge have no full window
                if time <= half as i64 || time as usize + half >= samples {
                    continue;
                }
                let t = time as usize;

                let mut waveform = Vec::with_capacity(channels * half * 2);
                let mut peak_channel = 1;
                let mut peak_amplitude = f64::MIN;
                for ch in 0..channels {
                    let window = &dense.channel(ch)[t - half..t + half];
                    let mean =
                        window.iter().map(|&v| v as f64).sum::<f64>() / window.len() as f64;
                    let amplitude = window
                        .iter()
                        .map(|&v| (v as f64 - mean).abs())
                        .fold(0f64, f64::max);
                    if amplitude > peak_amplitude {
                        peak_amplitude = amplitude;
                        peak_channel = ch + 1;
                    }
                    waveform.extend(window.iter().map(|&v| v as f64));
                }

                waveforms.push(waveform);
                flat_meta.push((peak_channel, time));
                size += 1;
            }
            cluster_sizes.push(size);
        }

        let coords = project_with_subsample(&waveforms, self.sorting.projection_fit_subsample);

        let mut clusters = Vec::with_capacity(cluster_sizes.len());
        let mut at = 0;
        for &size in &cluster_sizes {
            let spikes = (0..size)
                .map(|index| {
                    let (x, y) = coords[at + index];
                    let (channel, time) = flat_meta[at + index];
                    ClusterSpike {
                        x,
                        y,
                        channel,
                        time,
                        index,
                    }
                })
                .collect();
            at += size;
            clusters.push(spikes);
        }

        Ok(ClusterSet {
            clusters,
            algorithm: AlgorithmKind::TemplateMatching,
            provenance: Provenance::Local,
        })
    }

    /// Path the given algorithm family persists its results under.
    pub fn results_path(&self, algorithm: AlgorithmKind) -> PathBuf {
        self.labels_folder.join(algorithm.results_file_name())
    }

    /// Whether a persisted result file exists for the algorithm family.
    pub fn has_persisted(&self, algorithm: AlgorithmKind) -> bool {
        self.results_path(algorithm).exists()
    }

    /// Persist the current result set beside the label files.
    ///
    /// A no-op when no result is current or the set holds no spikes.
    pub fn persist(&self) -> DataResult<()> {
        let Some(set) = &self.current else {
            tracing::warn!("no clustering result to persist");
            return Ok(());
        };

        let rows = set.to_rows();
        if rows.is_empty() {
            tracing::warn!("clustering result holds no spikes, not persisting");
            return Ok(());
        }

        let path = self.results_path(set.algorithm);
        npy::write_f64(&path, &[set.total_spikes(), 5], &rows)?;
        tracing::info!(
            path = %path.display(),
            spikes = set.total_spikes(),
            "clustering result persisted"
        );
        Ok(())
    }

    /// Rebuild the grouped result from a persisted file and publish it.
    pub fn reload(&mut self, algorithm: AlgorithmKind) -> DataResult<()> {
        let path = self.results_path(algorithm);
        if !path.exists() {
            return Err(DataError::not_found(
                "Persisted results",
                path.display().to_string(),
            ));
        }

        let bytes = fs::read(&path)
            .map_err(|e| DataError::io(format!("reading {}", path.display()), e))?;
        let header = npy::parse_header(&bytes, &path)?;
        if header.shape.len() != 2 || header.shape[1] != 5 {
            return Err(DataError::parse(
                path.display().to_string(),
                format!("expected (n, 5) result rows, got {:?}", header.shape),
            ));
        }

        let rows = npy::decode_f64(&header, &bytes);
        self.set_current(ClusterSet::from_rows(&rows, algorithm, Provenance::Reloaded));
        Ok(())
    }

    /// Derived statistics for the requested clusters.
    ///
    /// Unknown cluster ids are skipped; the map holds entries for the valid
    /// ones only.
    pub fn statistics(&self, cluster_ids: &[usize]) -> BTreeMap<usize, ClusterStatistics> {
        let Some(set) = &self.current else {
            return BTreeMap::new();
        };

        let mut out = BTreeMap::new();
        for &cluster_id in cluster_ids {
            let Some(spikes) = set.clusters.get(cluster_id) else {
                continue;
            };

            let mut times_secs: Vec<f64> = spikes
                .iter()
                .map(|s| s.time as f64 / self.sampling_rate as f64)
                .collect();
            times_secs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let isi_violation_rate = if times_secs.len() > 1 {
                let violations = times_secs
                    .windows(2)
                    .filter(|pair| pair[1] - pair[0] < ISI_REFRACTORY_SECS)
                    .count();
                violations as f64 / (times_secs.len() - 1) as f64
            } else {
                0.0
            };

            let (mean_x, mean_y) = if spikes.is_empty() {
                (0.0, 0.0)
            } else {
                (
                    spikes.iter().map(|s| s.x).sum::<f64>() / spikes.len() as f64,
                    spikes.iter().map(|s| s.y).sum::<f64>() / spikes.len() as f64,
                )
            };

            out.insert(
                cluster_id,
                ClusterStatistics {
                    isi_violation_rate,
                    num_spikes: spikes.len(),
                    peak_channel: modal_channel(spikes),
                    mean_position: (mean_x.round() as i64, mean_y.round() as i64),
                },
            );
        }
        out
    }

    /// Waveform snippets for the requested clusters, on each spike's
    /// assigned channel.
    ///
    /// Clusters larger than `max_count` are randomly subsampled. Each
    /// snippet is z-score normalized (skipping the divide when the standard
    /// deviation is zero) with a millisecond time axis centered on the
    /// spike.
    pub fn waveforms(
        &self,
        recording: &Recording,
        cluster_ids: &[usize],
        max_count: usize,
        window: usize,
    ) -> BTreeMap<usize, Vec<Waveform>> {
        let Some(set) = &self.current else {
            return BTreeMap::new();
        };

        let mut out = BTreeMap::new();
        for &cluster_id in cluster_ids {
            let Some(spikes) = set.clusters.get(cluster_id) else {
                continue;
            };

            let selected = subsample(spikes, max_count);
            let waveforms = selected
                .iter()
                .filter_map(|spike| {
                    self.extract_waveform(recording, spike.channel, spike.time, window)
                })
                .collect();
            out.insert(cluster_id, waveforms);
        }
        out
    }

    /// Waveform snippets for one cluster across its peak channel and the
    /// two neighbors on each side, flagged so the caller can highlight the
    /// peak.
    pub fn multi_channel_waveforms(
        &self,
        recording: &Recording,
        cluster_id: usize,
        max_count: usize,
        window: usize,
    ) -> DataResult<MultiChannelWaveforms> {
        let set = self
            .current
            .as_ref()
            .ok_or_else(|| DataError::not_found("Clustering results", cluster_id.to_string()))?;
        let spikes = set
            .clusters
            .get(cluster_id)
            .filter(|spikes| !spikes.is_empty())
            .ok_or_else(|| {
                DataError::not_found("Spikes for cluster", cluster_id.to_string())
            })?;

        let peak_channel = modal_channel(spikes);
        let selected = subsample(spikes, max_count);

        let mut channels = BTreeMap::new();
        for offset in NEIGHBOR_OFFSETS {
            let target = peak_channel as i64 + offset;
            if target < 1 || target as usize > recording.channels() {
                continue;
            }
            let channel_id = target as usize;

            let waveforms = selected
                .iter()
                .filter_map(|spike| {
                    self.extract_waveform(recording, channel_id, spike.time, window)
                })
                .collect();

            channels.insert(
                channel_id,
                ChannelWaveforms {
                    channel_id,
                    waveforms,
                    is_peak: channel_id == peak_channel,
                },
            );
        }

        Ok(MultiChannelWaveforms {
            cluster_id,
            peak_channel,
            channels,
        })
    }

    fn extract_waveform(
        &self,
        recording: &Recording,
        channel_id: usize,
        time: i64,
        window: usize,
    ) -> Option<Waveform> {
        let start = (time - window as i64).max(0) as usize;
        let end = ((time + window as i64).max(0) as usize).min(recording.samples());
        if start >= end {
            return None;
        }

        let mut amplitude = recording.channel_slice(channel_id, start, end)?;
        if amplitude.is_empty() {
            return None;
        }

        let mean = amplitude.iter().sum::<f64>() / amplitude.len() as f64;
        let std = (amplitude.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / amplitude.len() as f64)
            .sqrt();
        if std > 0.0 {
            for v in &mut amplitude {
                *v = (*v - mean) / std;
            }
        }

        let samples_per_ms = self.sampling_rate as f64 / 1000.0;
        let time_ms = (0..amplitude.len())
            .map(|i| (i as f64 - window as f64) / samples_per_ms)
            .collect();

        Some(Waveform { time_ms, amplitude })
    }
}

/// Most frequent assigned channel; ties resolve to the lowest channel.
fn modal_channel(spikes: &[ClusterSpike]) -> usize {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for spike in spikes {
        *counts.entry(spike.channel).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(channel, count)| (count, std::cmp::Reverse(channel)))
        .map(|(channel, _)| channel)
        .unwrap_or(0)
}

/// At most `max_count` randomly chosen spikes; smaller clusters pass
/// through untouched.
fn subsample(spikes: &[ClusterSpike], max_count: usize) -> Vec<&ClusterSpike> {
    if spikes.len() <= max_count {
        return spikes.iter().collect();
    }
    let mut rng = rand::thread_rng();
    sample_indices(&mut rng, spikes.len(), max_count)
        .into_iter()
        .map(|i| &spikes[i])
        .collect()
}

/// Restores the process working directory when dropped.
struct WorkingDirGuard {
    original: PathBuf,
}

impl WorkingDirGuard {
    fn enter(dir: &Path) -> DataResult<Self> {
        let original = std::env::current_dir()
            .map_err(|e| DataError::io("reading working directory".to_string(), e))?;
        std::env::set_current_dir(dir)
            .map_err(|e| DataError::io(format!("entering {}", dir.display()), e))?;
        Ok(Self { original })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(err) = std::env::set_current_dir(&self.original) {
            tracing::error!(%err, "failed to restore working directory");
        }
    }
}
