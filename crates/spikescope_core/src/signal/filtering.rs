//! Signal filtering for spike visualization and detection.
//!
//! Provides band-pass, low-pass, and high-pass filters using IIR Butterworth
//! design via the biquad crate, applied forward-backward so the output has
//! zero phase shift. Spike peak timing must stay aligned to the original
//! sample index, so a one-directional pass is never used.
//!
//! Filtering is best-effort enhancement: any numerical failure (for example
//! an invalid normalized cutoff at a low sampling rate) logs a warning and
//! returns the input unfiltered rather than failing the request.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F64};

use crate::config::SignalSettings;
use crate::recording::Recording;

/// Filtering method applied before display and detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterKind {
    /// No filtering.
    #[default]
    None,
    /// High-pass (removes DC and low-frequency drift).
    HighPass,
    /// Low-pass (removes high-frequency noise).
    LowPass,
    /// Band-pass (isolates the spike band).
    BandPass,
}

impl FilterKind {
    /// Parse a filter name from a request.
    ///
    /// Unknown names map to `None` so the caller's "none-or-unknown" path
    /// stays uniform; this is deliberately not an error.
    pub fn from_name(name: &str) -> Self {
        match name {
            "highpass" => Self::HighPass,
            "lowpass" => Self::LowPass,
            "bandpass" => Self::BandPass,
            "none" | "" => Self::None,
            other => {
                tracing::warn!(filter = other, "unknown filter type, not filtering");
                Self::None
            }
        }
    }
}

/// Configuration for a filter application.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Type of filter to apply.
    pub kind: FilterKind,
    /// Sample rate of the recording.
    pub sampling_rate: u32,
    /// Low cutoff frequency (Hz) for band-pass/high-pass.
    pub low_cutoff_hz: f64,
    /// High cutoff frequency (Hz) for band-pass/low-pass.
    pub high_cutoff_hz: f64,
    /// Filter order, implemented as cascaded second-order sections.
    pub order: usize,
}

impl FilterConfig {
    /// Build a config for the given kind from the signal settings.
    pub fn from_settings(kind: FilterKind, settings: &SignalSettings) -> Self {
        Self {
            kind,
            sampling_rate: settings.sampling_rate,
            low_cutoff_hz: settings.highpass_cutoff_hz,
            high_cutoff_hz: settings.lowpass_cutoff_hz,
            order: settings.filter_order,
        }
    }
}

/// Apply the configured filter to samples with zero phase shift.
pub fn apply_filter(samples: &[f64], config: &FilterConfig) -> Vec<f64> {
    match config.kind {
        FilterKind::None => samples.to_vec(),
        FilterKind::LowPass => apply_butterworth_lowpass(
            samples,
            config.sampling_rate,
            config.high_cutoff_hz,
            config.order,
        ),
        FilterKind::HighPass => apply_butterworth_highpass(
            samples,
            config.sampling_rate,
            config.low_cutoff_hz,
            config.order,
        ),
        FilterKind::BandPass => apply_butterworth_bandpass(
            samples,
            config.sampling_rate,
            config.low_cutoff_hz,
            config.high_cutoff_hz,
            config.order,
        ),
    }
}

/// Apply a filter over a window using extra edge samples from the recording.
///
/// IIR filters distort samples near both edges of a short window. This
/// refetches the superset `[start - buffer, end + buffer)` clamped to the
/// recorded range, filters the superset, then slices the sub-range matching
/// the original window back out, so the distortion falls in the discarded
/// margins.
///
/// High-pass and band-pass filtering removes the signal's mean; the mean of
/// the original (unbuffered) window is added back so the filtered trace sits
/// at the same baseline as the raw trace in side-by-side display. Low-pass
/// preserves DC and needs no correction.
pub fn apply_filter_with_buffer(
    window: &[f64],
    recording: &Recording,
    channel_id: usize,
    start: usize,
    end: usize,
    config: &FilterConfig,
    buffer: usize,
) -> Vec<f64> {
    let buffer_start = start.saturating_sub(buffer);
    let buffered = match recording.channel_slice(channel_id, buffer_start, end + buffer) {
        Some(samples) => samples,
        None => return window.to_vec(),
    };

    let original_mean = mean(window);

    let filtered_buffered = apply_filter(&buffered, config);

    let offset = start - buffer_start;
    let take = window.len().min(filtered_buffered.len().saturating_sub(offset));
    let mut filtered: Vec<f64> = filtered_buffered[offset..offset + take].to_vec();

    if matches!(config.kind, FilterKind::HighPass | FilterKind::BandPass) {
        for v in &mut filtered {
            *v += original_mean;
        }
    }

    filtered
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// Apply a Butterworth low-pass filter with zero phase shift.
fn apply_butterworth_lowpass(
    samples: &[f64],
    sampling_rate: u32,
    cutoff_hz: f64,
    order: usize,
) -> Vec<f64> {
    if samples.is_empty() {
        return Vec::new();
    }

    let coeffs = match Coefficients::<f64>::from_params(
        Type::LowPass,
        sampling_rate.hz(),
        cutoff_hz.hz(),
        Q_BUTTERWORTH_F64,
    ) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(?err, cutoff_hz, sampling_rate, "low-pass design failed, returning unfiltered data");
            return samples.to_vec();
        }
    };

    filtfilt(samples, &coeffs, order)
}

/// Apply a Butterworth high-pass filter with zero phase shift.
fn apply_butterworth_highpass(
    samples: &[f64],
    sampling_rate: u32,
    cutoff_hz: f64,
    order: usize,
) -> Vec<f64> {
    if samples.is_empty() {
        return Vec::new();
    }

    let coeffs = match Coefficients::<f64>::from_params(
        Type::HighPass,
        sampling_rate.hz(),
        cutoff_hz.hz(),
        Q_BUTTERWORTH_F64,
    ) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(?err, cutoff_hz, sampling_rate, "high-pass design failed, returning unfiltered data");
            return samples.to_vec();
        }
    };

    filtfilt(samples, &coeffs, order)
}

/// Apply a Butterworth band-pass filter with zero phase shift.
///
/// Band-pass is implemented as high-pass followed by low-pass, each taking
/// half the order (rounded up).
fn apply_butterworth_bandpass(
    samples: &[f64],
    sampling_rate: u32,
    low_hz: f64,
    high_hz: f64,
    order: usize,
) -> Vec<f64> {
    if samples.is_empty() {
        return Vec::new();
    }

    let half_order = (order + 1) / 2;
    let high_passed = apply_butterworth_highpass(samples, sampling_rate, low_hz, half_order);
    apply_butterworth_lowpass(&high_passed, sampling_rate, high_hz, half_order)
}

/// Run the cascaded sections forward, then backward over the result.
///
/// The backward pass cancels the phase delay of the forward pass, so peaks
/// in the output line up with peaks in the input.
fn filtfilt(samples: &[f64], coeffs: &Coefficients<f64>, order: usize) -> Vec<f64> {
    let mut forward = run_cascade(samples, coeffs, order);
    forward.reverse();
    let mut backward = run_cascade(&forward, coeffs, order);
    backward.reverse();
    backward
}

/// Apply a filter multiple times (cascaded) for higher order response.
fn run_cascade(samples: &[f64], coeffs: &Coefficients<f64>, order: usize) -> Vec<f64> {
    // A biquad is 2nd order, so order/2 sections (minimum 1)
    let num_sections = ((order + 1) / 2).max(1);

    let mut result = samples.to_vec();

    for _ in 0..num_sections {
        let mut filter = DirectForm2Transposed::<f64>::new(*coeffs);
        for sample in &mut result {
            *sample = filter.run(*sample);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn config(kind: FilterKind) -> FilterConfig {
        FilterConfig::from_settings(kind, &SignalSettings::default())
    }

    #[test]
    fn no_filter_returns_same() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = apply_filter(&samples, &config(FilterKind::None));
        assert_eq!(result, samples);
    }

    #[test]
    fn unknown_filter_name_maps_to_none() {
        assert_eq!(FilterKind::from_name("wavelet"), FilterKind::None);
        assert_eq!(FilterKind::from_name("bandpass"), FilterKind::BandPass);
    }

    #[test]
    fn highpass_attenuates_drift() {
        // 10 Hz drift, far below the 300 Hz cutoff at 30 kHz
        let n = 6000;
        let samples: Vec<f64> = (0..n)
            .map(|i| (2.0 * PI * 10.0 * i as f64 / 30_000.0).sin() * 100.0)
            .collect();

        let filtered = apply_filter(&samples, &config(FilterKind::HighPass));

        let mid = n / 4..3 * n / 4;
        let original_energy: f64 = samples[mid.clone()].iter().map(|x| x * x).sum();
        let filtered_energy: f64 = filtered[mid].iter().map(|x| x * x).sum();
        assert!(
            filtered_energy < original_energy * 0.05,
            "high-pass should remove drift: original={original_energy}, filtered={filtered_energy}"
        );
    }

    #[test]
    fn lowpass_attenuates_noise() {
        // 12 kHz tone, far above the 3 kHz cutoff at 30 kHz
        let n = 6000;
        let samples: Vec<f64> = (0..n)
            .map(|i| (2.0 * PI * 12_000.0 * i as f64 / 30_000.0).sin() * 100.0)
            .collect();

        let filtered = apply_filter(&samples, &config(FilterKind::LowPass));

        let mid = n / 4..3 * n / 4;
        let original_energy: f64 = samples[mid.clone()].iter().map(|x| x * x).sum();
        let filtered_energy: f64 = filtered[mid].iter().map(|x| x * x).sum();
        assert!(
            filtered_energy < original_energy * 0.05,
            "low-pass should remove noise: original={original_energy}, filtered={filtered_energy}"
        );
    }

    #[test]
    fn bandpass_passes_spike_band() {
        // 1 kHz tone, inside the 300-3000 Hz band
        let n = 6000;
        let samples: Vec<f64> = (0..n)
            .map(|i| (2.0 * PI * 1000.0 * i as f64 / 30_000.0).sin())
            .collect();

        let filtered = apply_filter(&samples, &config(FilterKind::BandPass));

        let mid = n / 4..3 * n / 4;
        let original_energy: f64 = samples[mid.clone()].iter().map(|x| x * x).sum();
        let filtered_energy: f64 = filtered[mid].iter().map(|x| x * x).sum();
        assert!(
            filtered_energy > original_energy * 0.25,
            "band-pass should keep in-band energy: original={original_energy}, filtered={filtered_energy}"
        );
    }

    #[test]
    fn zero_phase_impulse_response_is_symmetric() {
        let n = 4096;
        let center = n / 2;
        let mut samples = vec![0.0; n];
        samples[center] = 1.0;

        for kind in [FilterKind::HighPass, FilterKind::LowPass, FilterKind::BandPass] {
            let response = apply_filter(&samples, &config(kind));
            let peak = response
                .iter()
                .fold(0f64, |acc, v| acc.max(v.abs()))
                .max(f64::MIN_POSITIVE);

            for k in 1..200 {
                let diff = (response[center + k] - response[center - k]).abs();
                assert!(
                    diff < peak * 1e-6,
                    "{kind:?} response asymmetric at offset {k}: {diff}"
                );
            }
        }
    }

    #[test]
    fn invalid_cutoff_degrades_to_unfiltered() {
        // 3 kHz low-pass cutoff is above Nyquist at a 100 Hz sampling rate
        let samples: Vec<f64> = (0..64).map(|i| i as f64).collect();
        let bad = FilterConfig {
            kind: FilterKind::LowPass,
            sampling_rate: 100,
            low_cutoff_hz: 300.0,
            high_cutoff_hz: 3000.0,
            order: 4,
        };
        assert_eq!(apply_filter(&samples, &bad), samples);
    }

    #[test]
    fn buffered_filter_restores_dc_for_constant_input() {
        let channels = 1;
        let n = 2000;
        let level = 1000.0f32;
        let recording = Recording::from_matrix("dc", channels, vec![level; n]);

        let (start, end) = (500, 900);
        let window = recording.channel_slice(1, start, end).unwrap();

        for kind in [FilterKind::HighPass, FilterKind::BandPass, FilterKind::LowPass] {
            let filtered = apply_filter_with_buffer(
                &window,
                &recording,
                1,
                start,
                end,
                &config(kind),
                100,
            );
            assert_eq!(filtered.len(), window.len());
            for (i, v) in filtered.iter().enumerate() {
                assert!(
                    (v - level as f64).abs() < 1.0,
                    "{kind:?} sample {i} deviates from baseline: {v}"
                );
            }
        }
    }

    #[test]
    fn buffered_filter_clamps_at_recording_edges() {
        let recording = Recording::from_matrix("edge", 1, vec![1.0f32; 300]);
        let window = recording.channel_slice(1, 0, 50).unwrap();

        // start < buffer, end + buffer > samples; both get clamped
        let filtered = apply_filter_with_buffer(
            &window,
            &recording,
            1,
            0,
            50,
            &config(FilterKind::HighPass),
            100,
        );
        assert_eq!(filtered.len(), 50);
    }
}
