//! Demultiplexing and binning of the raw detector stream.
//!
//! The input task delivers samples interleaved across both detector channels
//! at `bin_factor` times the pixel rate. This stage splits the stream per
//! channel, averages each group of `bin_factor` samples into one pixel, and
//! drops the flyback portion of every line. Reads rarely align with line
//! boundaries, so a residual tail is carried between calls.

use crate::device::INPUT_CHANNELS;
use crate::waveform::ScanTiming;

/// Streaming demultiplexer and binner. Feed raw reads with [`decode`];
/// completed lines are exposed through [`row`].
///
/// [`decode`]: SampleBinner::decode
/// [`row`]: SampleBinner::row
#[derive(Debug)]
pub struct SampleBinner {
    x_pixels: usize,
    bin_factor: usize,
    pixels_per_line: usize,
    samples_per_line: usize,
    buffer: Vec<f64>,
    discard: usize,
    rows: [Vec<f32>; 2],
}

impl SampleBinner {
    /// Create a binner for the given frame timing.
    pub fn new(timing: &ScanTiming, x_pixels: usize) -> Self {
        Self {
            x_pixels,
            bin_factor: timing.bin_factor,
            pixels_per_line: timing.pixels_per_line,
            samples_per_line: timing.samples_per_line,
            buffer: Vec::new(),
            discard: 0,
            rows: [Vec::new(), Vec::new()],
        }
    }

    /// Clear buffered samples and arm the phase-lag discard for a new
    /// acquisition.
    pub fn reset(&mut self, sample_shift: usize) {
        self.buffer.clear();
        self.discard = sample_shift;
        self.rows[0].clear();
        self.rows[1].clear();
    }

    /// Number of interleaved samples currently carried as residual.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Consume one interleaved read and bin every complete line it yields.
    ///
    /// Returns the number of complete lines decoded. The results of the
    /// previous call are discarded.
    pub fn decode(&mut self, new_samples: &[f64]) -> usize {
        debug_assert_eq!(new_samples.len() % INPUT_CHANNELS, 0);
        let mut fresh = new_samples;
        if self.discard > 0 {
            let dropped = self.discard.min(fresh.len() / INPUT_CHANNELS);
            fresh = &fresh[dropped * INPUT_CHANNELS..];
            self.discard -= dropped;
        }
        self.buffer.extend_from_slice(fresh);

        let line_stride = self.samples_per_line * INPUT_CHANNELS;
        let lines = self.buffer.len() / line_stride;
        self.rows[0].clear();
        self.rows[1].clear();
        for line in 0..lines {
            let base = line * line_stride;
            for pixel in 0..self.x_pixels {
                let start = base + pixel * self.bin_factor * INPUT_CHANNELS;
                let mut sum0 = 0.0;
                let mut sum1 = 0.0;
                for sample in 0..self.bin_factor {
                    let idx = start + sample * INPUT_CHANNELS;
                    sum0 += self.buffer[idx];
                    sum1 += self.buffer[idx + 1];
                }
                self.rows[0].push((sum0 / self.bin_factor as f64) as f32);
                self.rows[1].push((sum1 / self.bin_factor as f64) as f32);
            }
            // Pixels past x_pixels are overshoot and flyback; skip them.
            debug_assert!(self.x_pixels <= self.pixels_per_line);
        }

        // Carry the partial line to the front for the next call.
        let consumed = lines * line_stride;
        self.buffer.copy_within(consumed.., 0);
        self.buffer.truncate(self.buffer.len() - consumed);
        lines
    }

    /// Both channels of a line decoded by the last [`decode`] call.
    ///
    /// [`decode`]: SampleBinner::decode
    pub fn row(&self, line: usize) -> (&[f32], &[f32]) {
        let start = line * self.x_pixels;
        let end = start + self.x_pixels;
        (&self.rows[0][start..end], &self.rows[1][start..end])
    }
}
