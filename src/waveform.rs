//! Mirror-drive waveform synthesis for unidirectional raster scans.
//!
//! Each scan line is a linear voltage ramp on the fast (X) axis from
//! `-amplitude` to `+amplitude`, optionally extended past the turning points
//! by an overshoot margin, followed by a cubic Hermite flyback that returns
//! the mirror to the start of the next line without a first-derivative
//! discontinuity. The slow (Y) axis holds one voltage per line and steps once
//! per line. Both channels are synthesized together, interleaved per output
//! sample, so the pair can be loaded into the output task in one write.

use std::path::Path;

use log::debug;

use crate::error::{ScanError, ScanResult};

/// Spatial description of one frame of the raster.
#[derive(Debug, Clone, Copy)]
pub struct ScanGeometry {
    /// Peak drive voltage; the fast axis ramps from `-amplitude` to `+amplitude`.
    pub amplitude: f64,
    /// Pixels per line in the forward sweep.
    pub x_pixels: usize,
    /// Lines per frame.
    pub y_pixels: usize,
    /// Constant voltage added to every slow-axis sample.
    pub y_offset: f64,
    /// Extend the ramp past the turning points before flyback begins.
    pub overshoot: bool,
}

/// Detector input and mirror output sampling rates.
#[derive(Debug, Clone, Copy)]
pub struct RateConfig {
    /// Detector sampling rate in Hz.
    pub input_rate: f64,
    /// Mirror drive update rate in Hz.
    pub output_rate: f64,
}

impl RateConfig {
    /// Number of detector samples contributing to each pixel.
    ///
    /// Fails unless the input rate is a positive integer multiple of the
    /// output rate, since each pixel must bin a whole number of samples.
    pub fn bin_factor(&self) -> ScanResult<usize> {
        if self.input_rate <= 0.0 || self.output_rate <= 0.0 {
            return Err(ScanError::Configuration(format!(
                "sample rates must be positive, got input {} Hz / output {} Hz",
                self.input_rate, self.output_rate
            )));
        }
        let input = self.input_rate as u64;
        let output = self.output_rate as u64;
        if output == 0 || input % output != 0 {
            return Err(ScanError::Configuration(format!(
                "input rate ({} Hz) must be a positive integer multiple of output rate ({} Hz)",
                self.input_rate, self.output_rate
            )));
        }
        Ok((input / output) as usize)
    }
}

/// Derived per-line and per-frame sample counts.
///
/// All pixel counts are per channel; sample counts refer to the detector
/// input stream, pixel counts to the mirror output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTiming {
    /// Detector samples binned into each pixel.
    pub bin_factor: usize,
    /// Ramp extension on each side of the forward sweep, in pixels.
    pub overshoot_pixels: usize,
    /// Length of the Hermite flyback segment, in pixels.
    pub back_pixels: usize,
    /// Non-imaging pixels per line: both overshoot segments plus flyback.
    pub flyback_pixels: usize,
    /// Total drive updates per line, including overshoot and flyback.
    pub pixels_per_line: usize,
    /// Total drive updates per frame.
    pub pixels_per_scan: usize,
    /// Imaging pixels per frame.
    pub pixels_per_frame: usize,
    /// Detector samples per line, per channel.
    pub samples_per_line: usize,
    /// Detector samples per frame, per channel.
    pub samples_per_scan: usize,
}

impl ScanTiming {
    /// Derive the per-line and per-frame counts from geometry and rates.
    pub fn derive(geometry: &ScanGeometry, rates: &RateConfig) -> ScanResult<Self> {
        if geometry.amplitude <= 0.0 {
            return Err(ScanError::Configuration(format!(
                "amplitude must be positive, got {}",
                geometry.amplitude
            )));
        }
        if geometry.x_pixels == 0 || geometry.y_pixels == 0 {
            return Err(ScanError::Configuration(
                "x_pixels and y_pixels must be non-zero".to_string(),
            ));
        }
        let bin_factor = rates.bin_factor()?;
        let forward_velocity = forward_velocity(geometry);
        let overshoot_pixels = if geometry.overshoot {
            (0.125 * geometry.amplitude / forward_velocity).floor() as usize
        } else {
            0
        };
        // One millisecond of flyback, but never less than a single pixel.
        let back_pixels = ((rates.output_rate / 1000.0).floor() as usize).max(1);
        let flyback_pixels = 2 * overshoot_pixels + back_pixels;
        let pixels_per_line = geometry.x_pixels + flyback_pixels;
        let pixels_per_scan = pixels_per_line * geometry.y_pixels;
        let samples_per_line = pixels_per_line * bin_factor;
        let samples_per_scan = samples_per_line * geometry.y_pixels;
        Ok(Self {
            bin_factor,
            overshoot_pixels,
            back_pixels,
            flyback_pixels,
            pixels_per_line,
            pixels_per_scan,
            pixels_per_frame: geometry.x_pixels * geometry.y_pixels,
            samples_per_line,
            samples_per_scan,
        })
    }
}

/// A complete frame of interleaved X/Y mirror drive voltages.
#[derive(Debug, Clone)]
pub struct ScanWaveform {
    timing: ScanTiming,
    samples: Vec<f64>,
}

impl ScanWaveform {
    /// Synthesize the drive waveform for one frame.
    pub fn generate(geometry: &ScanGeometry, rates: &RateConfig) -> ScanResult<Self> {
        let timing = ScanTiming::derive(geometry, rates)?;
        let amp = geometry.amplitude;
        let v = forward_velocity(geometry);
        let ov = timing.overshoot_pixels;

        // Flyback connects the end of the (possibly overshot) ramp to the
        // start of the next line's ramp, matching the ramp slope at both ends.
        let ramp_end = -amp + v * (geometry.x_pixels + ov) as f64;
        let ramp_start = -amp - v * ov as f64;
        let flyback = hermite_blend(timing.back_pixels, ramp_end, ramp_start, v, v);

        let mut samples = Vec::with_capacity(timing.pixels_per_scan * 2);
        for line in 0..geometry.y_pixels {
            let y = -amp + v * line as f64 + geometry.y_offset;
            for i in 0..geometry.x_pixels + ov {
                samples.push(-amp + v * i as f64);
                samples.push(y);
            }
            for &x in &flyback {
                samples.push(x);
                samples.push(y);
            }
            for i in 0..ov {
                samples.push(-amp - v * (ov - i) as f64);
                samples.push(y);
            }
        }
        debug_assert_eq!(samples.len(), timing.pixels_per_scan * 2);
        debug!(
            "generated scan waveform: {} pixels/line ({} forward, {} overshoot, {} flyback), {} lines",
            timing.pixels_per_line, geometry.x_pixels, ov, timing.back_pixels, geometry.y_pixels
        );
        Ok(Self { timing, samples })
    }

    /// Derived sample counts for this waveform.
    pub fn timing(&self) -> &ScanTiming {
        &self.timing
    }

    /// Interleaved `[x, y]` drive voltages for one frame.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Drive voltages of the first output sample, used to park the mirrors.
    pub fn start_position(&self) -> (f64, f64) {
        (self.samples[0], self.samples[1])
    }

    /// Dump the waveform to a CSV file for offline inspection.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> ScanResult<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        writer.write_record(["index", "x_volts", "y_volts"])?;
        for (i, pair) in self.samples.chunks_exact(2).enumerate() {
            writer.write_record([i.to_string(), pair[0].to_string(), pair[1].to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn forward_velocity(geometry: &ScanGeometry) -> f64 {
    2.0 * geometry.amplitude / geometry.x_pixels as f64
}

/// Cubic Hermite blend between two linear tracks.
///
/// The outgoing track advances from `y1` with slope `slope1`; the incoming
/// track arrives at `y2` with slope `slope2` one step after the segment ends.
/// The blend starts exactly on the outgoing track and lands one slope-step
/// short of `y2`, so adjacent segments join with matching first derivatives.
fn hermite_blend(steps: usize, y1: f64, y2: f64, slope1: f64, slope2: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(steps);
    let start_y2 = y2 - slope2 * steps as f64;
    for i in 0..steps {
        let s = i as f64 / steps as f64;
        let h1 = 2.0 * s * s * s - 3.0 * s * s + 1.0;
        let h2 = -2.0 * s * s * s + 3.0 * s * s;
        let outgoing = y1 + slope1 * i as f64;
        let incoming = start_y2 + slope2 * i as f64;
        out.push(h1 * outgoing + h2 * incoming);
    }
    out
}
