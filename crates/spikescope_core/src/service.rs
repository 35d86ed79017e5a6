//! Service facade over the recording, spike, and cluster stores.
//!
//! Owns the process-wide "current" slots (recording, spike-time index,
//! clustering result) behind reader-writer locks with replace-then-publish
//! semantics: a dataset switch or sorting run builds the new value
//! completely, then swaps the slot, so concurrent readers never observe a
//! half-updated state. Mutating operations are expected to be serialized
//! by the surrounding transport (single-writer convention).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::cluster::{
    AlgorithmKind, ClusterResultStore, ClusterStatistics, ClusteringParams, MultiChannelWaveforms,
    RunSummary, Waveform,
};
use crate::config::Settings;
use crate::error::{DataError, DataResult};
use crate::recording::{Recording, RecordingInfo, RecordingStore};
use crate::spikes::{
    ChannelWindow, Direction, SpikeExtractor, SpikeTimeIndex, SpikeTimesInfo, WindowRequest,
};

/// Result of a spike navigation query.
#[derive(Debug, Clone, Serialize)]
pub struct SpikeNavigation {
    /// Target spike time (absolute sample index).
    pub time: i64,
    /// Number of distinct spike times considered.
    pub total: usize,
}

/// The signal-delivery and spike-extraction service.
pub struct SpikeService {
    settings: Settings,
    store: RecordingStore,
    recording: RwLock<Option<Arc<Recording>>>,
    spike_times: RwLock<Option<Arc<SpikeTimeIndex>>>,
    clusters: RwLock<ClusterResultStore>,
}

impl SpikeService {
    /// Create a service with no sorting backends registered.
    pub fn new(settings: Settings) -> Self {
        let clusters = ClusterResultStore::new(&settings);
        Self::with_cluster_store(settings, clusters)
    }

    /// Create a service around a prepared cluster store (with backends
    /// and/or a remote client registered).
    pub fn with_cluster_store(settings: Settings, clusters: ClusterResultStore) -> Self {
        let store = RecordingStore::new(
            &settings.paths.datasets_folder,
            settings.recording.default_channels,
        );
        Self {
            settings,
            store,
            recording: RwLock::new(None),
            spike_times: RwLock::new(None),
            clusters: RwLock::new(clusters),
        }
    }

    /// The service settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Load the configured default dataset when it exists on disk.
    ///
    /// Called at startup; a missing or unreadable default is logged, not
    /// fatal.
    pub fn load_default_dataset(&self) {
        let name = self.settings.recording.default_dataset.clone();
        if name.is_empty() {
            return;
        }
        if let Err(err) = self.select_dataset(&name) {
            tracing::warn!(dataset = %name, %err, "default dataset not loaded");
        }
    }

    /// Switch to a dataset: load its recording, publish it, and reload the
    /// associated spike-time index.
    pub fn select_dataset(&self, name: &str) -> DataResult<RecordingInfo> {
        let recording = Arc::new(self.store.load(name)?);
        let info = recording.info();

        // Publish only after both values are fully built
        let index = SpikeTimeIndex::for_dataset(&self.settings.paths, name).map(Arc::new);
        *self.recording.write() = Some(recording);
        *self.spike_times.write() = index;

        Ok(info)
    }

    /// Handle removal of a dataset: when it is the active one, the
    /// recording and spike-time slots are cleared.
    ///
    /// Returns whether the active recording was discarded.
    pub fn drop_dataset(&self, name: &str) -> bool {
        let mut slot = self.recording.write();
        let was_active = slot
            .as_ref()
            .map(|rec| rec.name() == name)
            .unwrap_or(false);
        if was_active {
            *slot = None;
            *self.spike_times.write() = None;
            tracing::info!(dataset = name, "active recording discarded");
        }
        was_active
    }

    /// Info about the currently loaded recording.
    pub fn recording_info(&self) -> RecordingInfo {
        match self.recording.read().as_ref() {
            Some(recording) => recording.info(),
            None => RecordingInfo::absent(
                &self.settings.recording.default_dataset,
                self.settings.recording.default_channels,
            ),
        }
    }

    /// Availability summary of the spike-time index.
    pub fn spike_times_info(&self) -> SpikeTimesInfo {
        match self.spike_times.read().as_ref() {
            Some(index) => index.info(),
            None => SpikeTimesInfo::absent(),
        }
    }

    /// Per-channel window query.
    ///
    /// The window is clamped to at most `max_window_samples`; invalid
    /// channels in the batch are skipped, so the map holds entries for the
    /// valid ones only. When `use_precomputed` is set and an index is
    /// loaded, spike flags come from the precomputed times instead of
    /// threshold detection.
    pub fn channel_windows(
        &self,
        mut request: WindowRequest,
        use_precomputed: bool,
    ) -> DataResult<BTreeMap<usize, ChannelWindow>> {
        let recording = self.current_recording()?;

        request.end = request
            .end
            .min(request.start + self.settings.signal.max_window_samples);

        let extractor = SpikeExtractor::new(&recording, &self.settings.signal);

        let index = self.spike_times.read().clone();
        match index {
            Some(index) if use_precomputed => Ok(extractor.extract_precomputed(&request, &index)),
            _ => Ok(extractor.extract(&request)),
        }
    }

    /// Find the next/previous spike among the given channels' precomputed
    /// times, wrapping around past the ends.
    pub fn navigate_spike(
        &self,
        current_time: i64,
        direction: Direction,
        channels: &[usize],
    ) -> DataResult<SpikeNavigation> {
        let index = self
            .spike_times
            .read()
            .clone()
            .ok_or_else(|| DataError::not_found("Spike times", "no index loaded"))?;

        index
            .navigate(current_time, direction, channels)
            .map(|(time, total)| SpikeNavigation { time, total })
            .ok_or_else(|| DataError::not_found("Spike", current_time.to_string()))
    }

    /// Whether a sorting algorithm can run (locally or remotely).
    pub fn algorithm_available(&self, algorithm: AlgorithmKind) -> bool {
        self.clusters.read().is_available(algorithm)
    }

    /// Trigger a sorting run over the full current recording.
    ///
    /// Blocks until the run completes; the normalized result is published
    /// as current and persisted for reuse across restarts.
    pub fn run_sorting(
        &self,
        algorithm: AlgorithmKind,
        params: &ClusteringParams,
    ) -> DataResult<RunSummary> {
        let recording = self.current_recording()?;
        self.clusters.write().run(algorithm, &recording, params)
    }

    /// Statistics for the requested clusters.
    pub fn cluster_statistics(
        &self,
        cluster_ids: &[usize],
        reload_from: Option<AlgorithmKind>,
    ) -> DataResult<BTreeMap<usize, ClusterStatistics>> {
        self.ensure_cluster_results(reload_from)?;
        Ok(self.clusters.read().statistics(cluster_ids))
    }

    /// Waveform snippets for the requested clusters.
    pub fn cluster_waveforms(
        &self,
        cluster_ids: &[usize],
        max_count: usize,
        window: usize,
        reload_from: Option<AlgorithmKind>,
    ) -> DataResult<BTreeMap<usize, Vec<Waveform>>> {
        let recording = self.current_recording()?;
        self.ensure_cluster_results(reload_from)?;
        Ok(self
            .clusters
            .read()
            .waveforms(&recording, cluster_ids, max_count, window))
    }

    /// Waveforms around one cluster's peak channel and its neighbors.
    pub fn multi_channel_waveforms(
        &self,
        cluster_id: usize,
        max_count: usize,
        window: usize,
        reload_from: Option<AlgorithmKind>,
    ) -> DataResult<MultiChannelWaveforms> {
        let recording = self.current_recording()?;
        self.ensure_cluster_results(reload_from)?;
        self.clusters
            .read()
            .multi_channel_waveforms(&recording, cluster_id, max_count, window)
    }

    /// Whether a persisted result file exists for the algorithm family.
    pub fn has_persisted_results(&self, algorithm: AlgorithmKind) -> bool {
        self.clusters.read().has_persisted(algorithm)
    }

    /// Reload a persisted result set into the current slot.
    pub fn reload_cluster_results(&self, algorithm: AlgorithmKind) -> DataResult<()> {
        self.clusters.write().reload(algorithm)
    }

    /// Discard the current clustering result.
    pub fn clear_cluster_results(&self) {
        self.clusters.write().clear();
    }

    fn current_recording(&self) -> DataResult<Arc<Recording>> {
        self.recording
            .read()
            .clone()
            .ok_or(DataError::NoDataLoaded)
    }

    /// When no result is in memory and a persisted family was named,
    /// reload it before serving the query.
    fn ensure_cluster_results(&self, reload_from: Option<AlgorithmKind>) -> DataResult<()> {
        let Some(algorithm) = reload_from else {
            return Ok(());
        };
        if self.clusters.read().current().is_some() {
            return Ok(());
        }
        self.clusters.write().reload(algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::npy;
    use crate::signal::FilterKind;
    use crate::spikes::DisplayMode;
    use std::fs;
    use tempfile::tempdir;

    fn service_with_dataset(dir: &std::path::Path) -> SpikeService {
        // 2 channels x 1000 samples with dips on channel 1
        let mut data = vec![0f32; 2000];
        data[100] = -50.0;
        data[500] = -80.0;
        fs::write(
            dir.join("session.npy"),
            npy::to_bytes_f32(&[2, 1000], &data),
        )
        .unwrap();

        let mut settings = Settings::default();
        settings.paths.datasets_folder = dir.to_string_lossy().to_string();
        let service = SpikeService::new(settings);
        service.select_dataset("session.npy").unwrap();
        service
    }

    fn window_request(channels: Vec<usize>) -> WindowRequest {
        WindowRequest {
            channels,
            threshold: Some(-30.0),
            invert: false,
            start: 0,
            end: 1000,
            display: DisplayMode::Raw,
            filter: FilterKind::None,
        }
    }

    #[test]
    fn select_dataset_publishes_recording_info() {
        let dir = tempdir().unwrap();
        let service = service_with_dataset(dir.path());

        let info = service.recording_info();
        assert!(info.loaded);
        assert_eq!(info.channels, 2);
        assert_eq!(info.total_samples, Some(1000));
    }

    #[test]
    fn channel_windows_require_a_recording() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.paths.datasets_folder = dir.path().to_string_lossy().to_string();
        let service = SpikeService::new(settings);

        let err = service
            .channel_windows(window_request(vec![1]), false)
            .unwrap_err();
        assert!(matches!(err, DataError::NoDataLoaded));
    }

    #[test]
    fn channel_windows_skip_invalid_channels() {
        let dir = tempdir().unwrap();
        let service = service_with_dataset(dir.path());

        let windows = service
            .channel_windows(window_request(vec![1, 999]), false)
            .unwrap();
        assert_eq!(windows.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(windows[&1].spike_peaks, vec![100, 500]);
    }

    #[test]
    fn window_length_is_capped() {
        let dir = tempdir().unwrap();
        let service = service_with_dataset(dir.path());
        // 1000-sample recording, but cap the request harder than that
        let mut request = window_request(vec![1]);
        request.end = 900;

        let mut settings = service.settings().clone();
        settings.signal.max_window_samples = 64;
        let capped = SpikeService::new(settings);
        capped.select_dataset("session.npy").unwrap();

        let windows = capped.channel_windows(request, false).unwrap();
        assert_eq!(windows[&1].samples.len(), 64);
    }

    #[test]
    fn navigation_requires_an_index() {
        let dir = tempdir().unwrap();
        let service = service_with_dataset(dir.path());

        let err = service
            .navigate_spike(0, Direction::Next, &[1])
            .unwrap_err();
        assert!(matches!(err, DataError::NotFound { .. }));
        assert!(!service.spike_times_info().available);
    }

    #[test]
    fn dataset_with_labels_navigates_and_overlays() {
        let dir = tempdir().unwrap();

        // Label file plus the dataset-to-label mapping
        let labels_dir = dir.path().join("labels");
        fs::create_dir_all(&labels_dir).unwrap();
        fs::write(
            labels_dir.join("session_times.npy"),
            npy::to_bytes_f64(&[3], &[100.0, 500.0, 900.0]),
        )
        .unwrap();
        fs::write(
            dir.path().join("dataset_labels_mapping.json"),
            r#"{"session.npy": "session_times.npy"}"#,
        )
        .unwrap();

        let service = service_with_dataset(dir.path());
        let info = service.spike_times_info();
        assert!(info.available);
        assert_eq!(info.count, 3);

        // Wraparound navigation over the global list
        let nav = service.navigate_spike(950, Direction::Next, &[1]).unwrap();
        assert_eq!(nav.time, 100);
        assert_eq!(nav.total, 3);

        // Precomputed overlay is flagged as such
        let windows = service
            .channel_windows(window_request(vec![1]), true)
            .unwrap();
        assert!(windows[&1].precomputed);
        assert_eq!(windows[&1].spike_peaks, vec![100, 500, 900]);
    }

    #[test]
    fn drop_dataset_clears_the_active_slots() {
        let dir = tempdir().unwrap();
        let service = service_with_dataset(dir.path());

        assert!(!service.drop_dataset("other.npy"));
        assert!(service.recording_info().loaded);

        assert!(service.drop_dataset("session.npy"));
        assert!(!service.recording_info().loaded);
        assert!(matches!(
            service.channel_windows(window_request(vec![1]), false),
            Err(DataError::NoDataLoaded)
        ));
    }

    #[test]
    fn run_sorting_requires_recording_and_backend() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.paths.datasets_folder = dir.path().to_string_lossy().to_string();
        let service = SpikeService::new(settings);

        let err = service
            .run_sorting(AlgorithmKind::WaveformClustering, &ClusteringParams::default())
            .unwrap_err();
        assert!(matches!(err, DataError::NoDataLoaded));

        let service = service_with_dataset(dir.path());
        assert!(!service.algorithm_available(AlgorithmKind::WaveformClustering));
        let err = service
            .run_sorting(AlgorithmKind::WaveformClustering, &ClusteringParams::default())
            .unwrap_err();
        assert!(matches!(err, DataError::AlgorithmUnavailable { .. }));
    }

    #[test]
    fn cluster_queries_lazily_reload_persisted_results() {
        let dir = tempdir().unwrap();
        let service = service_with_dataset(dir.path());

        // Persist a result file the way a completed run would
        let rows = vec![
            1.0, 2.0, 0.0, 100.0, 1.0, //
            3.0, 4.0, 0.0, 500.0, 1.0,
        ];
        let labels_dir = dir.path().join("labels");
        fs::create_dir_all(&labels_dir).unwrap();
        fs::write(
            labels_dir.join("waveform_clustering_results.npy"),
            npy::to_bytes_f64(&[2, 5], &rows),
        )
        .unwrap();

        let stats = service
            .cluster_statistics(&[0], Some(AlgorithmKind::WaveformClustering))
            .unwrap();
        assert_eq!(stats[&0].num_spikes, 2);
        assert_eq!(stats[&0].peak_channel, 1);

        // Without a named family and nothing in memory, queries are empty
        service.clear_cluster_results();
        let stats = service.cluster_statistics(&[0], None).unwrap();
        assert!(stats.is_empty());
    }

    #[test]
    fn missing_persisted_family_fails_the_reload() {
        let dir = tempdir().unwrap();
        let service = service_with_dataset(dir.path());
        let err = service
            .cluster_statistics(&[0], Some(AlgorithmKind::TemplateMatching))
            .unwrap_err();
        assert!(matches!(err, DataError::NotFound { .. }));
    }
}
