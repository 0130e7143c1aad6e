//! Live-view hand-off shared between the acquisition thread and a renderer.
//!
//! The acquisition thread publishes each completed frame into the inactive
//! slot of a two-slot buffer and then flips an atomic index, so a renderer
//! polling [`FrameHandoff::with_active`] always sees a fully written frame
//! and never blocks the publisher for longer than one slot copy.
//!
//! Display parameters are plain atomics and may be changed from any thread
//! while a scan is running.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use log::warn;

use crate::config::DisplaySettings;

/// Double-buffered frame hand-off.
#[derive(Debug)]
pub struct FrameHandoff {
    slots: [Mutex<Vec<f32>>; 2],
    active: AtomicUsize,
}

impl FrameHandoff {
    /// Create a hand-off with both slots zero-filled at `len` pixels.
    pub fn new(len: usize) -> Self {
        Self {
            slots: [Mutex::new(vec![0.0; len]), Mutex::new(vec![0.0; len])],
            active: AtomicUsize::new(0),
        }
    }

    /// Publish a frame: copy it into the inactive slot, then flip.
    pub fn update(&self, frame: &[f32]) {
        let back = self.active.load(Ordering::Acquire) ^ 1;
        match self.slots[back].lock() {
            Ok(mut slot) => {
                slot.clear();
                slot.extend_from_slice(frame);
                self.active.store(back, Ordering::Release);
            }
            Err(_) => warn!("display slot mutex poisoned; frame dropped"),
        }
    }

    /// Index of the slot currently holding the newest frame.
    pub fn active_slot(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Run `f` against the newest published frame.
    pub fn with_active<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Option<R> {
        let index = self.active.load(Ordering::Acquire);
        self.slots[index].lock().ok().map(|slot| f(&slot))
    }
}

/// An `f32` stored as its bit pattern in an `AtomicU32`.
#[derive(Debug)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Renderer-facing display parameters, adjustable while scanning.
#[derive(Debug)]
pub struct DisplayParams {
    channel: AtomicUsize,
    intensity_min: AtomicF32,
    intensity_max: AtomicF32,
    centre_cross: AtomicBool,
    scan_line_overlay: AtomicBool,
    scan_line: AtomicUsize,
}

impl DisplayParams {
    fn new(settings: &DisplaySettings) -> Self {
        Self {
            channel: AtomicUsize::new(settings.channel),
            intensity_min: AtomicF32::new(settings.intensity_min),
            intensity_max: AtomicF32::new(settings.intensity_max),
            centre_cross: AtomicBool::new(settings.centre_cross),
            scan_line_overlay: AtomicBool::new(settings.scan_line_overlay),
            scan_line: AtomicUsize::new(0),
        }
    }

    /// Detector channel shown in the live view.
    pub fn channel(&self) -> usize {
        self.channel.load(Ordering::Relaxed)
    }

    /// Intensity mapping bounds as `(min, max)`.
    pub fn intensity_range(&self) -> (f32, f32) {
        (self.intensity_min.load(), self.intensity_max.load())
    }

    /// Whether to draw the centre crosshair.
    pub fn centre_cross(&self) -> bool {
        self.centre_cross.load(Ordering::Relaxed)
    }

    /// Whether to highlight the line currently being acquired.
    pub fn scan_line_overlay(&self) -> bool {
        self.scan_line_overlay.load(Ordering::Relaxed)
    }

    /// Line most recently written by the acquisition thread.
    pub fn scan_line(&self) -> usize {
        self.scan_line.load(Ordering::Relaxed)
    }

    /// Replace every display parameter at once.
    pub fn set(&self, channel: usize, min: f32, max: f32, centre_cross: bool, overlay: bool) {
        self.channel.store(channel.min(1), Ordering::Relaxed);
        self.intensity_min.store(min);
        self.intensity_max.store(max);
        self.centre_cross.store(centre_cross, Ordering::Relaxed);
        self.scan_line_overlay.store(overlay, Ordering::Relaxed);
    }

    pub(crate) fn set_scan_line(&self, line: usize) {
        self.scan_line.store(line, Ordering::Relaxed);
    }
}

/// Everything a renderer needs: the frame hand-off, the display parameters,
/// the frame dimensions, and a shutdown flag.
#[derive(Debug)]
pub struct DisplayLink {
    handoff: FrameHandoff,
    params: DisplayParams,
    width: usize,
    height: usize,
    closed: AtomicBool,
}

impl DisplayLink {
    /// Create a link for `width` by `height` frames.
    pub fn new(width: usize, height: usize, settings: &DisplaySettings) -> Self {
        Self {
            handoff: FrameHandoff::new(width * height),
            params: DisplayParams::new(settings),
            width,
            height,
            closed: AtomicBool::new(false),
        }
    }

    /// The double-buffered frame hand-off.
    pub fn handoff(&self) -> &FrameHandoff {
        &self.handoff
    }

    /// The adjustable display parameters.
    pub fn params(&self) -> &DisplayParams {
        &self.params
    }

    /// Frame width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Tell the renderer to shut down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// True once the scanner has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DisplaySettings {
        DisplaySettings {
            channel: 0,
            intensity_min: 0.0,
            intensity_max: 1.0,
            centre_cross: false,
            scan_line_overlay: false,
        }
    }

    #[test]
    fn test_update_flips_to_the_written_slot() {
        let handoff = FrameHandoff::new(4);
        assert_eq!(handoff.active_slot(), 0);
        handoff.update(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(handoff.active_slot(), 1);
        let seen = handoff.with_active(|frame| frame.to_vec()).unwrap();
        assert_eq!(seen, vec![1.0, 2.0, 3.0, 4.0]);

        handoff.update(&[5.0; 4]);
        assert_eq!(handoff.active_slot(), 0);
        let seen = handoff.with_active(|frame| frame.to_vec()).unwrap();
        assert_eq!(seen, vec![5.0; 4]);
    }

    #[test]
    fn test_params_round_trip() {
        let params = DisplayParams::new(&settings());
        params.set(1, -0.5, 2.0, true, true);
        assert_eq!(params.channel(), 1);
        assert_eq!(params.intensity_range(), (-0.5, 2.0));
        assert!(params.centre_cross());
        assert!(params.scan_line_overlay());
    }

    #[test]
    fn test_out_of_range_channel_is_clamped() {
        let params = DisplayParams::new(&settings());
        params.set(7, 0.0, 1.0, false, false);
        assert_eq!(params.channel(), 1);
    }

    #[test]
    fn test_close_is_visible_across_the_link() {
        let link = DisplayLink::new(2, 2, &settings());
        assert!(!link.is_closed());
        link.close();
        assert!(link.is_closed());
    }
}
