//! Settings struct with TOML-based sections.
//!
//! Settings are organized into logical sections that map to TOML tables.
//! Every field has a default so a partial config file (or none at all)
//! still yields a working configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root settings structure containing all configuration sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Path-related settings.
    #[serde(default)]
    pub paths: PathSettings,

    /// Recording loading defaults.
    #[serde(default)]
    pub recording: RecordingSettings,

    /// Signal processing settings.
    #[serde(default)]
    pub signal: SignalSettings,

    /// Spike sorting settings.
    #[serde(default)]
    pub sorting: SortingSettings,

    /// Remote GPU worker settings.
    #[serde(default)]
    pub remote: RemoteSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Folder layout for datasets, labels, and persisted results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Folder holding recording files.
    #[serde(default = "default_datasets_folder")]
    pub datasets_folder: String,
}

fn default_datasets_folder() -> String {
    "datasets".to_string()
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            datasets_folder: default_datasets_folder(),
        }
    }
}

impl PathSettings {
    /// Folder holding spike-time label files and persisted cluster results.
    pub fn labels_folder(&self) -> PathBuf {
        PathBuf::from(&self.datasets_folder).join("labels")
    }

    /// Path of the dataset-to-label-file mapping.
    pub fn label_mapping_path(&self) -> PathBuf {
        PathBuf::from(&self.datasets_folder).join("dataset_labels_mapping.json")
    }
}

/// Defaults applied when loading recordings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSettings {
    /// Dataset loaded at startup when present on disk.
    #[serde(default)]
    pub default_dataset: String,

    /// Channel count assumed for flat binary files with no shape metadata.
    #[serde(default = "default_channels")]
    pub default_channels: usize,
}

fn default_channels() -> usize {
    385
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            default_dataset: String::new(),
            default_channels: default_channels(),
        }
    }
}

/// Signal processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSettings {
    /// Acquisition sampling rate in Hz.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,

    /// Butterworth filter order.
    #[serde(default = "default_filter_order")]
    pub filter_order: usize,

    /// High-pass cutoff in Hz (also the band-pass lower edge).
    #[serde(default = "default_highpass_cutoff")]
    pub highpass_cutoff_hz: f64,

    /// Low-pass cutoff in Hz (also the band-pass upper edge).
    #[serde(default = "default_lowpass_cutoff")]
    pub lowpass_cutoff_hz: f64,

    /// Extra samples fetched on each side of a window before filtering,
    /// so IIR edge distortion falls outside the returned range.
    #[serde(default = "default_edge_buffer")]
    pub filter_edge_buffer: usize,

    /// Half-width of the displayed envelope around a precomputed spike time.
    #[serde(default = "default_overlay_halfwidth")]
    pub spike_overlay_halfwidth: usize,

    /// Hard cap on the number of samples a single window query may span.
    #[serde(default = "default_max_window")]
    pub max_window_samples: usize,
}

fn default_sampling_rate() -> u32 {
    30_000
}

fn default_filter_order() -> usize {
    4
}

fn default_highpass_cutoff() -> f64 {
    300.0
}

fn default_lowpass_cutoff() -> f64 {
    3000.0
}

fn default_edge_buffer() -> usize {
    100
}

fn default_overlay_halfwidth() -> usize {
    5
}

fn default_max_window() -> usize {
    20_000
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            filter_order: default_filter_order(),
            highpass_cutoff_hz: default_highpass_cutoff(),
            lowpass_cutoff_hz: default_lowpass_cutoff(),
            filter_edge_buffer: default_edge_buffer(),
            spike_overlay_halfwidth: default_overlay_halfwidth(),
            max_window_samples: default_max_window(),
        }
    }
}

/// Spike sorting settings shared by the local and remote execution paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortingSettings {
    /// Probe geometry file handed to the template-matching pipeline.
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Batch size for the template-matching pipeline.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Drift-correction block count for the template-matching pipeline.
    #[serde(default = "default_blocks")]
    pub blocks: usize,

    /// Above this many spikes the 2-D projection is fitted on a random
    /// subsample and then applied to every spike.
    #[serde(default = "default_fit_subsample")]
    pub projection_fit_subsample: usize,
}

fn default_probe_path() -> String {
    "probes/default_probe.json".to_string()
}

fn default_batch_size() -> usize {
    60_000
}

fn default_blocks() -> usize {
    1
}

fn default_fit_subsample() -> usize {
    5000
}

impl Default for SortingSettings {
    fn default() -> Self {
        Self {
            probe_path: default_probe_path(),
            batch_size: default_batch_size(),
            blocks: default_blocks(),
            projection_fit_subsample: default_fit_subsample(),
        }
    }
}

/// Remote GPU worker configuration.
///
/// An empty `worker_url` means sorting runs in-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Base URL of the remote worker. Empty disables remote execution.
    #[serde(default)]
    pub worker_url: String,

    /// Object-storage bucket (or local staging directory) for job data.
    #[serde(default)]
    pub storage_bucket: String,

    /// Round-trip timeout in seconds. Covers worker cold start plus the
    /// algorithm run itself, so it is long.
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

fn default_remote_timeout() -> u64 {
    3600
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            worker_url: String::new(),
            storage_bucket: String::new(),
            timeout_secs: default_remote_timeout(),
        }
    }
}

impl RemoteSettings {
    /// Whether a remote worker is configured.
    pub fn is_configured(&self) -> bool {
        !self.worker_url.is_empty()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default log level when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_acquisition_conventions() {
        let settings = Settings::default();
        assert_eq!(settings.signal.sampling_rate, 30_000);
        assert_eq!(settings.recording.default_channels, 385);
        assert_eq!(settings.signal.max_window_samples, 20_000);
    }

    #[test]
    fn partial_toml_fills_missing_sections() {
        let settings: Settings =
            toml::from_str("[signal]\nsampling_rate = 25000\n").unwrap();
        assert_eq!(settings.signal.sampling_rate, 25_000);
        // Untouched sections get defaults
        assert_eq!(settings.signal.filter_order, 4);
        assert_eq!(settings.paths.datasets_folder, "datasets");
    }

    #[test]
    fn labels_folder_is_under_datasets() {
        let paths = PathSettings::default();
        assert_eq!(paths.labels_folder(), PathBuf::from("datasets/labels"));
    }

    #[test]
    fn remote_configured_only_with_url() {
        let mut remote = RemoteSettings::default();
        assert!(!remote.is_configured());
        remote.worker_url = "https://gpu-worker.example.com".to_string();
        assert!(remote.is_configured());
    }
}
