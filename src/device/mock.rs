//! A scripted in-memory device for tests and hardware-free development.
//!
//! `MockDevice` replays queued detector sample chunks and records every call
//! made against it. The struct is a cheap clone over shared state, so a test
//! can keep one clone for inspection while the scanner owns the other.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::trace;

use super::{
    AnalogIoDevice, ClockEdge, DeviceFailure, DeviceResult, SampleGrouping, SampleMode,
    TaskHandle, VoltageRange,
};

#[derive(Default)]
struct MockState {
    next_task: u32,
    task_names: Vec<String>,
    calls: Vec<String>,
    reads: VecDeque<Vec<f64>>,
    digital_writes: Vec<u8>,
    analog_write_lens: Vec<usize>,
    first_waveform: Option<Vec<f64>>,
    running: Vec<TaskHandle>,
    cleared: Vec<TaskHandle>,
    fail_on: Option<(&'static str, i32)>,
}

impl MockState {
    fn record(&mut self, call: &str) -> DeviceResult<()> {
        self.calls.push(call.to_string());
        if let Some((method, status)) = self.fail_on {
            if call == method {
                self.fail_on = None;
                return Err(DeviceFailure { status });
            }
        }
        Ok(())
    }
}

/// Scripted device double. See the module docs.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// Create a device with no queued reads.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an interleaved detector sample chunk to be returned by one read.
    pub fn push_read(&self, chunk: Vec<f64>) {
        self.lock().reads.push_back(chunk);
    }

    /// Make the next invocation of `method` fail with `status`.
    pub fn fail_on(&self, method: &'static str, status: i32) {
        self.lock().fail_on = Some((method, status));
    }

    /// Names of every call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Every byte written to the digital output task, in order.
    pub fn digital_writes(&self) -> Vec<u8> {
        self.lock().digital_writes.clone()
    }

    /// Lengths of every analog write, in order.
    pub fn analog_write_lens(&self) -> Vec<usize> {
        self.lock().analog_write_lens.clone()
    }

    /// The first full waveform loaded into the output task, if any.
    pub fn first_waveform(&self) -> Option<Vec<f64>> {
        self.lock().first_waveform.clone()
    }

    /// Tasks that have been cleared.
    pub fn cleared_tasks(&self) -> Vec<TaskHandle> {
        self.lock().cleared.clone()
    }

    /// Number of tasks created so far.
    pub fn task_count(&self) -> usize {
        self.lock().task_names.len()
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl AnalogIoDevice for MockDevice {
    fn create_task(&mut self, name: &str) -> DeviceResult<TaskHandle> {
        let mut state = self.lock();
        state.record("create_task")?;
        let handle = TaskHandle(state.next_task);
        state.next_task += 1;
        state.task_names.push(name.to_string());
        trace!("mock: created task '{name}' as {handle:?}");
        Ok(handle)
    }

    fn create_analog_input_channel(
        &mut self,
        _task: TaskHandle,
        _range: VoltageRange,
    ) -> DeviceResult<()> {
        self.lock().record("create_analog_input_channel")
    }

    fn create_analog_output_channel(
        &mut self,
        _task: TaskHandle,
        _range: VoltageRange,
    ) -> DeviceResult<()> {
        self.lock().record("create_analog_output_channel")
    }

    fn create_digital_output_channel(&mut self, _task: TaskHandle) -> DeviceResult<()> {
        self.lock().record("create_digital_output_channel")
    }

    fn configure_sample_clock(
        &mut self,
        _task: TaskHandle,
        _rate_hz: f64,
        _edge: ClockEdge,
        _mode: SampleMode,
        _buffer_size: usize,
    ) -> DeviceResult<()> {
        self.lock().record("configure_sample_clock")
    }

    fn configure_start_trigger(
        &mut self,
        _task: TaskHandle,
        _source: TaskHandle,
    ) -> DeviceResult<()> {
        self.lock().record("configure_start_trigger")
    }

    fn start_task(&mut self, task: TaskHandle) -> DeviceResult<()> {
        let mut state = self.lock();
        state.record("start_task")?;
        state.running.push(task);
        Ok(())
    }

    fn stop_task(&mut self, task: TaskHandle) -> DeviceResult<()> {
        let mut state = self.lock();
        state.record("stop_task")?;
        state.running.retain(|&t| t != task);
        Ok(())
    }

    fn clear_task(&mut self, task: TaskHandle) -> DeviceResult<()> {
        let mut state = self.lock();
        state.record("clear_task")?;
        state.running.retain(|&t| t != task);
        state.cleared.push(task);
        Ok(())
    }

    fn write_analog(
        &mut self,
        _task: TaskHandle,
        data: &[f64],
        samples_per_channel: usize,
        _grouping: SampleGrouping,
    ) -> DeviceResult<()> {
        let mut state = self.lock();
        state.record("write_analog")?;
        state.analog_write_lens.push(data.len());
        // The first multi-sample write is the full scan waveform.
        if samples_per_channel > 2 && state.first_waveform.is_none() {
            state.first_waveform = Some(data.to_vec());
        }
        Ok(())
    }

    fn read_analog(
        &mut self,
        _task: TaskHandle,
        max_samples: Option<usize>,
        timeout: Duration,
        _grouping: SampleGrouping,
        buf: &mut [f64],
    ) -> DeviceResult<usize> {
        let chunk = {
            let mut state = self.lock();
            state.record("read_analog")?;
            state.reads.pop_front()
        };
        match chunk {
            Some(chunk) => {
                let capacity = match max_samples {
                    Some(n) => (n * super::INPUT_CHANNELS).min(buf.len()),
                    None => buf.len(),
                };
                let take = chunk.len().min(capacity);
                buf[..take].copy_from_slice(&chunk[..take]);
                Ok(take / super::INPUT_CHANNELS)
            }
            None => {
                // Nothing scripted; behave like a quiet detector.
                thread::sleep(timeout.min(Duration::from_millis(5)));
                Ok(0)
            }
        }
    }

    fn write_digital(&mut self, _task: TaskHandle, byte: u8) -> DeviceResult<()> {
        let mut state = self.lock();
        state.record("write_digital")?;
        state.digital_writes.push(byte);
        Ok(())
    }
}
