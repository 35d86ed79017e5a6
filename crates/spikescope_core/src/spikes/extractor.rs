//! Per-channel window extraction with spike detection.
//!
//! Combines the recording, the filter, and (optionally) the precomputed
//! spike-time index to produce, per requested channel and time window, the
//! display samples, a per-sample spike flag, and the spike peak offsets.
//!
//! Channel ids outside the recording's range are silently skipped so a
//! batch of channels still returns partial results.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::SignalSettings;
use crate::recording::Recording;
use crate::signal::{apply_filter_with_buffer, FilterConfig, FilterKind};

use super::times::SpikeTimeIndex;

/// What the `samples` field of a channel window holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    /// Raw samples; any filtered trace rides along as an overlay.
    #[default]
    Raw,
    /// Raw samples as the primary series, filtered trace as the overlay.
    Filtered,
    /// The filtered trace itself, rounded to integers, so detection and
    /// display operate on the same denoised signal.
    Spikes,
}

impl DisplayMode {
    /// Parse a display-mode name from a request.
    pub fn from_name(name: &str) -> Self {
        match name {
            "filtered" => Self::Filtered,
            "spikes" => Self::Spikes,
            _ => Self::Raw,
        }
    }
}

/// A channel-window query.
#[derive(Debug, Clone)]
pub struct WindowRequest {
    /// 1-indexed channel ids.
    pub channels: Vec<usize>,
    /// Threshold for crossing detection; `None` disables detection.
    pub threshold: Option<f64>,
    /// Negate samples before detection and display.
    pub invert: bool,
    /// Window start (sample index).
    pub start: usize,
    /// Window end (exclusive sample index).
    pub end: usize,
    /// What the samples field holds.
    pub display: DisplayMode,
    /// Filter applied before display/detection.
    pub filter: FilterKind,
}

/// Extraction result for one channel window. Produced fresh per request,
/// never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelWindow {
    pub channel_id: usize,
    pub samples: Vec<i32>,
    pub is_spike: Vec<bool>,
    pub spike_peaks: Vec<usize>,
    pub start: usize,
    pub end: usize,
    /// Filtered overlay trace, when a filter was applied.
    pub filtered: Option<Vec<i32>>,
    /// Whether the spike flags come from precomputed timing rather than
    /// threshold detection.
    pub precomputed: bool,
}

/// Extracts channel windows from the current recording.
pub struct SpikeExtractor<'a> {
    recording: &'a Recording,
    settings: &'a SignalSettings,
}

impl<'a> SpikeExtractor<'a> {
    pub fn new(recording: &'a Recording, settings: &'a SignalSettings) -> Self {
        Self {
            recording,
            settings,
        }
    }

    /// Extract windows using threshold-crossing detection.
    pub fn extract(&self, request: &WindowRequest) -> BTreeMap<usize, ChannelWindow> {
        let (start, end) = self.clamp_window(request);
        let mut out = BTreeMap::new();

        for &channel_id in &request.channels {
            let Some((display, filtered)) = self.prepare_channel(channel_id, start, end, request)
            else {
                continue;
            };

            let (is_spike, spike_peaks) =
                detect_spikes(&display, request.threshold, request.invert);

            tracing::debug!(
                channel = channel_id,
                start,
                end,
                peaks = spike_peaks.len(),
                "channel window extracted"
            );

            out.insert(
                channel_id,
                ChannelWindow {
                    channel_id,
                    samples: round_to_i32(&display),
                    is_spike,
                    spike_peaks,
                    start,
                    end,
                    filtered: filtered.as_deref().map(round_to_i32),
                    precomputed: false,
                },
            );
        }

        out
    }

    /// Extract windows using the precomputed spike-time index.
    ///
    /// Each recorded spike time inside the window marks a fixed neighborhood
    /// of samples around it as "in spike" - a display envelope, not a
    /// re-detection.
    pub fn extract_precomputed(
        &self,
        request: &WindowRequest,
        index: &SpikeTimeIndex,
    ) -> BTreeMap<usize, ChannelWindow> {
        let (start, end) = self.clamp_window(request);
        let halfwidth = self.settings.spike_overlay_halfwidth;
        let mut out = BTreeMap::new();

        for &channel_id in &request.channels {
            let Some((display, filtered)) = self.prepare_channel(channel_id, start, end, request)
            else {
                continue;
            };

            let spike_peaks = index.window_offsets(channel_id, start as i64, end as i64);

            let mut is_spike = vec![false; display.len()];
            for &peak in &spike_peaks {
                let from = peak.saturating_sub(halfwidth);
                let to = (peak + halfwidth + 1).min(is_spike.len());
                for flag in &mut is_spike[from..to] {
                    *flag = true;
                }
            }

            // Precomputed responses only ship the filtered trace in
            // filtered display mode
            let filtered = if request.display == DisplayMode::Filtered {
                filtered
            } else {
                None
            };

            out.insert(
                channel_id,
                ChannelWindow {
                    channel_id,
                    samples: round_to_i32(&display),
                    is_spike,
                    spike_peaks,
                    start,
                    end,
                    filtered: filtered.as_deref().map(round_to_i32),
                    precomputed: true,
                },
            );
        }

        out
    }

    fn clamp_window(&self, request: &WindowRequest) -> (usize, usize) {
        let start = request.start.min(self.recording.samples());
        let end = request.end.min(self.recording.samples());
        (start, end.max(start))
    }

    /// Fetch, filter, and orient one channel's window.
    ///
    /// Returns the display samples plus the filtered trace (when a filter
    /// was requested), or `None` for a channel id outside the recording.
    fn prepare_channel(
        &self,
        channel_id: usize,
        start: usize,
        end: usize,
        request: &WindowRequest,
    ) -> Option<(Vec<f64>, Option<Vec<f64>>)> {
        let raw = self.recording.channel_slice(channel_id, start, end)?;

        let mut filtered = if request.filter != FilterKind::None {
            let config = FilterConfig::from_settings(request.filter, self.settings);
            Some(apply_filter_with_buffer(
                &raw,
                self.recording,
                channel_id,
                start,
                end,
                &config,
                self.settings.filter_edge_buffer,
            ))
        } else {
            None
        };

        let mut display = match (&filtered, request.display) {
            // Detection and display both use the denoised trace
            (Some(f), DisplayMode::Spikes) => f.iter().map(|v| v.round()).collect(),
            _ => raw,
        };

        if request.invert {
            for v in &mut display {
                *v = -*v;
            }
            if let Some(f) = &mut filtered {
                for v in f.iter_mut() {
                    *v = -*v;
                }
            }
        }

        Some((display, filtered))
    }
}

/// Threshold-crossing detection.
///
/// A sample is "in spike" when it crosses the threshold in the deflection
/// direction (at or below normally, at or above when inverted). Contiguous
/// runs merge into single events whose peak is the extreme value within the
/// run, picking the deepest deflection as the canonical spike time.
/// Peaks come out in ascending time order by construction.
fn detect_spikes(data: &[f64], threshold: Option<f64>, invert: bool) -> (Vec<bool>, Vec<usize>) {
    let Some(threshold) = threshold else {
        return (vec![false; data.len()], Vec::new());
    };

    let is_spike: Vec<bool> = data
        .iter()
        .map(|&v| if invert { v >= threshold } else { v <= threshold })
        .collect();

    let mut spike_peaks = Vec::new();
    let mut run_start: Option<usize> = None;

    for i in 0..=is_spike.len() {
        let in_run = i < is_spike.len() && is_spike[i];
        match (run_start, in_run) {
            (None, true) => run_start = Some(i),
            (Some(start), false) => {
                let segment = &data[start..i];
                let peak = if invert {
                    argmax(segment)
                } else {
                    argmin(segment)
                };
                spike_peaks.push(start + peak);
                run_start = None;
            }
            _ => {}
        }
    }

    (is_spike, spike_peaks)
}

fn argmin(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v < values[best] {
            best = i;
        }
    }
    best
}

fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

fn round_to_i32(values: &[f64]) -> Vec<i32> {
    values.iter().map(|&v| v.round() as i32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spikes::times::SpikeTimeIndex;

    fn recording_with_dips() -> Recording {
        // One channel, 40 samples, baseline 0 with dips at 10..13 and 25
        let mut data = vec![0f32; 40];
        data[10] = -20.0;
        data[11] = -55.0;
        data[12] = -30.0;
        data[25] = -40.0;
        Recording::from_matrix("dips", 1, data)
    }

    fn request(channels: Vec<usize>, threshold: Option<f64>) -> WindowRequest {
        WindowRequest {
            channels,
            threshold,
            invert: false,
            start: 0,
            end: 40,
            display: DisplayMode::Raw,
            filter: FilterKind::None,
        }
    }

    #[test]
    fn returned_window_length_matches_clamped_range() {
        let recording = recording_with_dips();
        let settings = SignalSettings::default();
        let extractor = SpikeExtractor::new(&recording, &settings);

        let mut req = request(vec![1], None);
        req.start = 30;
        req.end = 500;
        let result = extractor.extract(&req);
        let window = &result[&1];
        assert_eq!(window.samples.len(), 10);
        assert_eq!(window.start, 30);
        assert_eq!(window.end, 40);
    }

    #[test]
    fn invalid_channels_are_silently_skipped() {
        let recording = recording_with_dips();
        let settings = SignalSettings::default();
        let extractor = SpikeExtractor::new(&recording, &settings);

        let result = extractor.extract(&request(vec![1, 999], Some(-10.0)));
        assert_eq!(result.len(), 1);
        assert!(result.contains_key(&1));
        assert!(!result.contains_key(&999));
    }

    #[test]
    fn threshold_runs_merge_into_single_peaks() {
        let recording = recording_with_dips();
        let settings = SignalSettings::default();
        let extractor = SpikeExtractor::new(&recording, &settings);

        let result = extractor.extract(&request(vec![1], Some(-10.0)));
        let window = &result[&1];
        // The 10..13 run collapses to its deepest sample, 25 stands alone
        assert_eq!(window.spike_peaks, vec![11, 25]);
        assert!(window.is_spike[10] && window.is_spike[11] && window.is_spike[12]);
        assert!(!window.is_spike[13]);
        assert!(!window.precomputed);
    }

    #[test]
    fn detection_is_idempotent() {
        let recording = recording_with_dips();
        let settings = SignalSettings::default();
        let extractor = SpikeExtractor::new(&recording, &settings);

        let first = extractor.extract(&request(vec![1], Some(-10.0)));
        let second = extractor.extract(&request(vec![1], Some(-10.0)));
        assert_eq!(first[&1].spike_peaks, second[&1].spike_peaks);
        assert_eq!(first[&1].is_spike, second[&1].is_spike);
    }

    #[test]
    fn inverted_detection_finds_the_same_positions() {
        let recording = recording_with_dips();
        let settings = SignalSettings::default();
        let extractor = SpikeExtractor::new(&recording, &settings);

        let normal = extractor.extract(&request(vec![1], Some(-10.0)));

        // Inversion negates the data, so the same dips cross an inverted
        // threshold from the other side at the same sample positions.
        let mut inverted_req = request(vec![1], Some(10.0));
        inverted_req.invert = true;
        let inverted = extractor.extract(&inverted_req);

        assert_eq!(normal[&1].spike_peaks, inverted[&1].spike_peaks);
        assert_eq!(inverted[&1].samples[11], 55);
    }

    #[test]
    fn no_threshold_means_no_detection() {
        let recording = recording_with_dips();
        let settings = SignalSettings::default();
        let extractor = SpikeExtractor::new(&recording, &settings);

        let result = extractor.extract(&request(vec![1], None));
        let window = &result[&1];
        assert!(window.spike_peaks.is_empty());
        assert!(window.is_spike.iter().all(|&flag| !flag));
    }

    #[test]
    fn precomputed_envelope_stays_within_halfwidth_of_peaks() {
        let recording = Recording::from_matrix("flat", 1, vec![0f32; 1000]);
        let settings = SignalSettings::default();
        let extractor = SpikeExtractor::new(&recording, &settings);
        let index = SpikeTimeIndex::Global(vec![100, 500, 900]);

        let mut req = request(vec![1], None);
        req.start = 0;
        req.end = 1000;
        let result = extractor.extract_precomputed(&req, &index);
        let window = &result[&1];

        assert!(window.precomputed);
        assert_eq!(window.spike_peaks, vec![100, 500, 900]);

        let halfwidth = settings.spike_overlay_halfwidth as i64;
        for (i, &flag) in window.is_spike.iter().enumerate() {
            let near_peak = window
                .spike_peaks
                .iter()
                .any(|&p| (i as i64 - p as i64).abs() <= halfwidth);
            assert_eq!(flag, near_peak, "envelope mismatch at sample {i}");
        }
    }

    #[test]
    fn precomputed_peaks_are_window_relative() {
        let recording = Recording::from_matrix("flat", 1, vec![0f32; 1000]);
        let settings = SignalSettings::default();
        let extractor = SpikeExtractor::new(&recording, &settings);
        let index = SpikeTimeIndex::Global(vec![100, 500, 900]);

        let mut req = request(vec![1], None);
        req.start = 400;
        req.end = 600;
        let result = extractor.extract_precomputed(&req, &index);
        assert_eq!(result[&1].spike_peaks, vec![100]); // 500 - 400
    }

    #[test]
    fn spikes_display_mode_uses_the_filtered_trace() {
        // Strong low-frequency drift plus one sharp dip; high-pass removes
        // the drift so the dip shows on a flat baseline.
        let n = 2000;
        let mut data: Vec<f32> = (0..n)
            .map(|i| {
                (2.0 * std::f32::consts::PI * 5.0 * i as f32 / 30_000.0).sin() * 500.0
            })
            .collect();
        data[1000] = -800.0;
        let recording = Recording::from_matrix("drifty", 1, data);
        let settings = SignalSettings::default();
        let extractor = SpikeExtractor::new(&recording, &settings);

        let mut req = request(vec![1], None);
        req.end = n;
        req.display = DisplayMode::Spikes;
        req.filter = FilterKind::HighPass;
        let result = extractor.extract(&req);
        let window = &result[&1];

        // Overlay attached, and the displayed trace equals it in this mode
        let filtered = window.filtered.as_ref().unwrap();
        assert_eq!(&window.samples, filtered);
    }

    #[test]
    fn filtered_display_mode_keeps_raw_as_primary() {
        let recording = recording_with_dips();
        let settings = SignalSettings::default();
        let extractor = SpikeExtractor::new(&recording, &settings);

        let mut req = request(vec![1], None);
        req.display = DisplayMode::Filtered;
        req.filter = FilterKind::HighPass;
        let result = extractor.extract(&req);
        let window = &result[&1];

        assert!(window.filtered.is_some());
        assert_eq!(window.samples[11], -55);
    }
}
