//! Hardware collaborator interface for analog and digital I/O.
//!
//! The scanner core drives three hardware tasks over this trait: a clocked
//! analog output task for the mirror waveform, a clocked analog input task
//! for the detector stream, and an unclocked digital output task for the
//! shutter line. Implementations wrap a vendor driver; the crate ships a
//! scripted [`mock::MockDevice`] for tests and bench work without hardware.

use std::time::Duration;

use thiserror::Error;

use crate::error::{ScanError, ScanResult};

pub mod mock;

/// Number of detector input channels acquired per sample clock tick.
pub const INPUT_CHANNELS: usize = 2;

/// Opaque identifier for a created hardware task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u32);

/// Sample clock edge selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEdge {
    /// Sample on the rising edge.
    Rising,
    /// Sample on the falling edge.
    Falling,
}

/// Sample clock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// Acquire or generate until the task is stopped.
    Continuous,
    /// Acquire or generate a fixed number of samples.
    Finite,
}

/// Memory layout of multi-channel sample buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleGrouping {
    /// All samples of channel 0, then all samples of channel 1.
    ByChannel,
    /// Channels interleaved per sample clock tick.
    ByScanNumber,
}

/// Voltage limits for an analog channel.
#[derive(Debug, Clone, Copy)]
pub struct VoltageRange {
    /// Minimum voltage.
    pub min: f64,
    /// Maximum voltage.
    pub max: f64,
}

/// A failed hardware call, carrying the raw driver status code.
#[derive(Debug, Clone, Copy, Error)]
#[error("device returned status {status}")]
pub struct DeviceFailure {
    /// Raw status code reported by the driver.
    pub status: i32,
}

/// Result alias for raw hardware calls.
pub type DeviceResult<T> = std::result::Result<T, DeviceFailure>;

/// Blocking analog/digital I/O device.
///
/// Calls are made from the acquisition thread, so implementations must be
/// `Send`. `read_analog` blocks until at least one sample is available or the
/// timeout elapses; it returns the number of samples read per channel,
/// with `buf` filled according to the requested grouping.
pub trait AnalogIoDevice: Send {
    /// Create a named task.
    fn create_task(&mut self, name: &str) -> DeviceResult<TaskHandle>;

    /// Add all detector input channels to `task`.
    fn create_analog_input_channel(
        &mut self,
        task: TaskHandle,
        range: VoltageRange,
    ) -> DeviceResult<()>;

    /// Add both mirror drive output channels to `task`.
    fn create_analog_output_channel(
        &mut self,
        task: TaskHandle,
        range: VoltageRange,
    ) -> DeviceResult<()>;

    /// Add the shutter digital output line to `task`.
    fn create_digital_output_channel(&mut self, task: TaskHandle) -> DeviceResult<()>;

    /// Configure the sample clock and driver-side buffer of `task`.
    fn configure_sample_clock(
        &mut self,
        task: TaskHandle,
        rate_hz: f64,
        edge: ClockEdge,
        mode: SampleMode,
        buffer_size: usize,
    ) -> DeviceResult<()>;

    /// Arm `task` to start on the start trigger of `source`.
    fn configure_start_trigger(&mut self, task: TaskHandle, source: TaskHandle)
        -> DeviceResult<()>;

    /// Start (or arm, if triggered) `task`.
    fn start_task(&mut self, task: TaskHandle) -> DeviceResult<()>;

    /// Stop `task`, leaving its configuration intact.
    fn stop_task(&mut self, task: TaskHandle) -> DeviceResult<()>;

    /// Release all resources held by `task`.
    fn clear_task(&mut self, task: TaskHandle) -> DeviceResult<()>;

    /// Load `samples_per_channel` analog samples per channel into `task`.
    fn write_analog(
        &mut self,
        task: TaskHandle,
        data: &[f64],
        samples_per_channel: usize,
        grouping: SampleGrouping,
    ) -> DeviceResult<()>;

    /// Read up to `max_samples` samples per channel (or as many as fit in
    /// `buf` when `None`), blocking at most `timeout`. Returns the number of
    /// samples read per channel.
    fn read_analog(
        &mut self,
        task: TaskHandle,
        max_samples: Option<usize>,
        timeout: Duration,
        grouping: SampleGrouping,
        buf: &mut [f64],
    ) -> DeviceResult<usize>;

    /// Write one byte to the digital output lines of `task`.
    fn write_digital(&mut self, task: TaskHandle, byte: u8) -> DeviceResult<()>;
}

/// Attaches the name of the failing call to a raw device error.
pub(crate) trait DeviceCallExt<T> {
    fn call_context(self, call: &'static str) -> ScanResult<T>;
}

impl<T> DeviceCallExt<T> for DeviceResult<T> {
    fn call_context(self, call: &'static str) -> ScanResult<T> {
        self.map_err(|failure| ScanError::Device {
            call,
            status: failure.status,
        })
    }
}
