//! Frame assembly and running averaging.
//!
//! Binned lines are merged into one frame buffer per detector channel. The
//! first repetition of a frame overwrites whatever the buffers held; later
//! repetitions fold into a running mean, so the buffers always contain the
//! average of the repetitions seen so far and no per-repetition copies are
//! kept.

/// Raised when a merged line completes a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCompletion {
    /// Zero-based index of the repetition that just finished.
    pub repetition: u32,
    /// True when the configured number of repetitions has been averaged.
    pub average_complete: bool,
}

/// Two-channel frame buffer with incremental averaging.
#[derive(Debug)]
pub struct FrameAccumulator {
    x_pixels: usize,
    y_pixels: usize,
    frames_to_average: u32,
    line: usize,
    repetition: u32,
    frames: [Vec<f32>; 2],
}

impl FrameAccumulator {
    /// Create an accumulator for `x_pixels` by `y_pixels` frames, averaging
    /// `frames_to_average` repetitions into each finalized image.
    pub fn new(x_pixels: usize, y_pixels: usize, frames_to_average: u32) -> Self {
        let len = x_pixels * y_pixels;
        Self {
            x_pixels,
            y_pixels,
            frames_to_average: frames_to_average.max(1),
            line: 0,
            repetition: 0,
            frames: [vec![0.0; len], vec![0.0; len]],
        }
    }

    /// Rewind to the top of a fresh average. Pixel data is left in place;
    /// the first merged line of the next repetition overwrites it.
    pub fn reset(&mut self) {
        self.line = 0;
        self.repetition = 0;
    }

    /// Merge one binned line into both channel buffers.
    ///
    /// Returns a completion record when this line was the last of a frame.
    pub fn merge_row(&mut self, ch0: &[f32], ch1: &[f32]) -> Option<FrameCompletion> {
        debug_assert_eq!(ch0.len(), self.x_pixels);
        debug_assert_eq!(ch1.len(), self.x_pixels);
        let offset = self.line * self.x_pixels;
        if self.repetition == 0 {
            self.frames[0][offset..offset + self.x_pixels].copy_from_slice(ch0);
            self.frames[1][offset..offset + self.x_pixels].copy_from_slice(ch1);
        } else {
            let r = self.repetition as f32;
            for (i, (&a, &b)) in ch0.iter().zip(ch1).enumerate() {
                let old0 = self.frames[0][offset + i];
                let old1 = self.frames[1][offset + i];
                self.frames[0][offset + i] = (old0 * r + a) / (r + 1.0);
                self.frames[1][offset + i] = (old1 * r + b) / (r + 1.0);
            }
        }

        self.line += 1;
        if self.line < self.y_pixels {
            return None;
        }
        self.line = 0;
        let finished = self.repetition;
        self.repetition += 1;
        let average_complete = self.repetition == self.frames_to_average;
        if average_complete {
            self.repetition = 0;
        }
        Some(FrameCompletion {
            repetition: finished,
            average_complete,
        })
    }

    /// Zero-based index of the line the next merge will write.
    pub fn current_line(&self) -> usize {
        self.line
    }

    /// Pixel buffer of one detector channel, row-major.
    pub fn channel(&self, channel: usize) -> &[f32] {
        &self.frames[channel]
    }
}
