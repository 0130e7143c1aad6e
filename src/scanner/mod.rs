//! Scanner controller and acquisition thread.
//!
//! [`Scanner::new`] configures the hardware tasks, spawns the acquisition
//! thread, and returns a handle. The thread owns the device and the image
//! store outright and runs a small state machine:
//!
//! - **Resetting**: park the mirrors at the scan origin, load the frame
//!   waveform, and arm the output task on the input task's start trigger.
//! - **WaitingForStart**: poll the command channel until `start()` arrives.
//! - **Scanning**: open the shutter, start the clocked input task (which
//!   also releases the armed output task), and stream detector samples
//!   through binning, frame averaging, display hand-off, and saving.
//!
//! Commands travel over a bounded channel; dropping the last sender doubles
//! as the close signal, so the thread can never outlive its handle. A device
//! failure tears the hardware down, parks the thread, and is surfaced to the
//! caller by [`Scanner::close`].

pub mod binner;
pub mod frame;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use log::{debug, error, info, warn};

use crate::config::{Settings, StorageSettings};
use crate::device::{
    AnalogIoDevice, ClockEdge, DeviceCallExt, SampleGrouping, SampleMode, TaskHandle,
    VoltageRange, INPUT_CHANNELS,
};
use crate::display::DisplayLink;
use crate::error::{ScanError, ScanResult};
use crate::storage::{ImageHandle, ImageStore};
use crate::waveform::{RateConfig, ScanGeometry, ScanTiming, ScanWaveform};

use self::binner::SampleBinner;
use self::frame::FrameAccumulator;

/// Command channel poll interval while waiting for a start.
const START_POLL: Duration = Duration::from_millis(32);
/// Pause between scan loop iterations, letting samples accumulate.
const SCAN_LOOP_PAUSE: Duration = Duration::from_millis(16);
/// Upper bound on a single blocking detector read.
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const COMMAND_QUEUE_DEPTH: usize = 10;
const EVENT_QUEUE_DEPTH: usize = 64;

/// Drive voltage limits for the mirror and detector channels.
const ANALOG_RANGE: VoltageRange = VoltageRange {
    min: -10.0,
    max: 10.0,
};

/// Lifecycle state of the acquisition thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    /// Thread not running (before spawn or after close/fault).
    Idle,
    /// Parking mirrors and arming the output task.
    Resetting,
    /// Armed; polling for a start command.
    WaitingForStart,
    /// Actively acquiring and processing detector samples.
    Scanning,
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ScannerState::Idle as u8))
    }

    fn load(&self) -> ScannerState {
        match self.0.load(Ordering::Acquire) {
            1 => ScannerState::Resetting,
            2 => ScannerState::WaitingForStart,
            3 => ScannerState::Scanning,
            _ => ScannerState::Idle,
        }
    }

    fn store(&self, state: ScannerState) {
        let value = match state {
            ScannerState::Idle => 0,
            ScannerState::Resetting => 1,
            ScannerState::WaitingForStart => 2,
            ScannerState::Scanning => 3,
        };
        self.0.store(value, Ordering::Release);
    }
}

enum ScanCommand {
    Start,
    Stop,
    ConfigureSaving {
        path_prefix: String,
        images_to_save: u32,
    },
    Close,
}

/// Notifications emitted by the acquisition thread. The event queue is
/// lossy; consumers that fall behind miss events rather than stall the scan.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// The acquisition thread changed state.
    StateChanged(ScannerState),
    /// A frame repetition finished merging.
    FrameCompleted {
        /// Zero-based repetition index within the current average.
        repetition: u32,
        /// True when this repetition completed the average.
        average_complete: bool,
    },
    /// An averaged frame was written to the image store.
    AverageSaved {
        /// Zero-based page index within the output files.
        page: u32,
        /// Wall-clock time of the write.
        timestamp: DateTime<Utc>,
    },
    /// The configured number of images has been persisted and the files
    /// finalized.
    SavingComplete,
    /// A hardware call failed; the thread is shutting down.
    Fault {
        /// Name of the failing call.
        call: &'static str,
        /// Raw driver status code.
        status: i32,
    },
}

/// Handle to a running scanner. Dropping the handle closes the scanner.
pub struct Scanner {
    cmd_tx: Option<Sender<ScanCommand>>,
    thread: Option<JoinHandle<ScanResult<()>>>,
    state: Arc<StateCell>,
    display: Arc<DisplayLink>,
    event_rx: Receiver<ScanEvent>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner").finish_non_exhaustive()
    }
}

impl Scanner {
    /// Validate `settings`, configure the hardware tasks on `device`, and
    /// spawn the acquisition thread.
    pub fn new(
        settings: &Settings,
        mut device: Box<dyn AnalogIoDevice>,
        store: Box<dyn ImageStore>,
    ) -> ScanResult<Self> {
        settings.validate()?;
        let scan = &settings.scan;
        let geometry = ScanGeometry {
            amplitude: scan.amplitude,
            x_pixels: scan.x_pixels,
            y_pixels: scan.y_pixels,
            y_offset: scan.y_offset,
            overshoot: scan.overshoot,
        };
        let rates = RateConfig {
            input_rate: scan.input_rate,
            output_rate: scan.output_rate,
        };
        let waveform = ScanWaveform::generate(&geometry, &rates)?;
        let timing = *waveform.timing();

        // A failed setup call must not leave earlier tasks running.
        let mut created = Vec::new();
        let tasks = match setup_tasks(device.as_mut(), &rates, &timing, &mut created) {
            Ok(tasks) => tasks,
            Err(err) => {
                error!("scanner setup failed: {err}");
                for task in created {
                    if let Err(stop_err) = device.stop_task(task) {
                        debug!("stopping task during setup teardown: {stop_err}");
                    }
                    if let Err(clear_err) = device.clear_task(task) {
                        warn!("clearing task during setup teardown failed: {clear_err}");
                    }
                }
                return Err(err);
            }
        };

        let state = Arc::new(StateCell::new());
        let display = Arc::new(DisplayLink::new(
            scan.x_pixels,
            scan.y_pixels,
            &settings.display,
        ));
        let (cmd_tx, cmd_rx) = bounded(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = bounded(EVENT_QUEUE_DEPTH);

        let worker = Worker {
            device,
            store,
            tasks,
            waveform,
            timing,
            sample_shift: scan.sample_shift,
            binner: SampleBinner::new(&timing, scan.x_pixels),
            accum: FrameAccumulator::new(scan.x_pixels, scan.y_pixels, scan.frames_to_average),
            saving: SavingPlan::new(&settings.storage),
            // One second of interleaved detector samples per read.
            read_buf: vec![0.0; scan.input_rate as usize * INPUT_CHANNELS],
            display: Arc::clone(&display),
            state: Arc::clone(&state),
            cmd_rx,
            event_tx,
        };
        let thread = thread::Builder::new()
            .name("scan-acquisition".to_string())
            .spawn(move || worker.run())?;

        info!(
            "scanner ready: {}x{} pixels, {} Hz in / {} Hz out, averaging {}",
            scan.x_pixels, scan.y_pixels, scan.input_rate, scan.output_rate, scan.frames_to_average
        );
        Ok(Self {
            cmd_tx: Some(cmd_tx),
            thread: Some(thread),
            state,
            display,
            event_rx,
        })
    }

    /// Begin a scan. Takes effect once the thread reaches `WaitingForStart`.
    pub fn start(&self) -> ScanResult<()> {
        self.send(ScanCommand::Start)
    }

    /// End the current scan; the thread re-arms and waits for the next start.
    pub fn stop(&self) -> ScanResult<()> {
        self.send(ScanCommand::Stop)
    }

    /// Set the persistence plan. Applied between scans; ignored while a scan
    /// is running.
    pub fn configure_saving(
        &self,
        path_prefix: impl Into<String>,
        images_to_save: u32,
    ) -> ScanResult<()> {
        self.send(ScanCommand::ConfigureSaving {
            path_prefix: path_prefix.into(),
            images_to_save,
        })
    }

    /// Adjust the live-view parameters. Safe at any time, including while
    /// scanning.
    pub fn configure_display(
        &self,
        channel: usize,
        intensity_min: f32,
        intensity_max: f32,
        centre_cross: bool,
        scan_line_overlay: bool,
    ) {
        self.display.params().set(
            channel,
            intensity_min,
            intensity_max,
            centre_cross,
            scan_line_overlay,
        );
    }

    /// Current state of the acquisition thread.
    pub fn state(&self) -> ScannerState {
        self.state.load()
    }

    /// True while the thread is in the scan loop.
    pub fn is_scanning(&self) -> bool {
        self.state() == ScannerState::Scanning
    }

    /// Shared link for a renderer: frame hand-off plus display parameters.
    pub fn display(&self) -> Arc<DisplayLink> {
        Arc::clone(&self.display)
    }

    /// A receiver for acquisition notifications. Clones share the queue.
    pub fn events(&self) -> Receiver<ScanEvent> {
        self.event_rx.clone()
    }

    /// Shut the scanner down and join the acquisition thread.
    ///
    /// Returns the error that stopped the thread, if a hardware call failed
    /// earlier. Closing an already-closed scanner is a no-op.
    pub fn close(&mut self) -> ScanResult<()> {
        let Some(cmd_tx) = self.cmd_tx.take() else {
            return Ok(());
        };
        if cmd_tx.send(ScanCommand::Close).is_err() {
            debug!("acquisition thread already gone at close");
        }
        // Disconnecting the channel doubles as the close signal.
        drop(cmd_tx);
        self.display.close();
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| ScanError::ThreadPanicked)?,
            None => Ok(()),
        }
    }

    fn send(&self, command: ScanCommand) -> ScanResult<()> {
        let cmd_tx = self.cmd_tx.as_ref().ok_or(ScanError::AlreadyClosed)?;
        cmd_tx.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => ScanError::ControlQueueFull,
            TrySendError::Disconnected(_) => ScanError::ControllerGone,
        })
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if self.cmd_tx.is_some() {
            if let Err(err) = self.close() {
                error!("scanner close during drop failed: {err}");
            }
        }
    }
}

struct Tasks {
    shutter: TaskHandle,
    input: TaskHandle,
    output: TaskHandle,
}

/// Create and configure the shutter, input, and output tasks, recording each
/// created handle in `created` so a failed call can be unwound by the caller.
fn setup_tasks(
    device: &mut dyn AnalogIoDevice,
    rates: &RateConfig,
    timing: &ScanTiming,
    created: &mut Vec<TaskHandle>,
) -> ScanResult<Tasks> {
    let shutter = device.create_task("shutter").call_context("DO task create")?;
    created.push(shutter);
    device
        .create_digital_output_channel(shutter)
        .call_context("DO channel create")?;
    device.start_task(shutter).call_context("DO task start")?;

    let input = device
        .create_task("detector input")
        .call_context("AI task create")?;
    created.push(input);
    device
        .create_analog_input_channel(input, ANALOG_RANGE)
        .call_context("AI channel create")?;
    device
        .configure_sample_clock(
            input,
            rates.input_rate,
            ClockEdge::Rising,
            SampleMode::Continuous,
            timing.samples_per_scan,
        )
        .call_context("AI clock config")?;

    let output = device
        .create_task("mirror output")
        .call_context("AO task create")?;
    created.push(output);
    device
        .create_analog_output_channel(output, ANALOG_RANGE)
        .call_context("AO channel create")?;
    device
        .configure_sample_clock(
            output,
            rates.output_rate,
            ClockEdge::Rising,
            SampleMode::Continuous,
            timing.pixels_per_scan,
        )
        .call_context("AO clock config")?;
    device
        .configure_start_trigger(output, input)
        .call_context("AO trigger config")?;

    Ok(Tasks {
        shutter,
        input,
        output,
    })
}

struct SavingPlan {
    prefix: String,
    images_to_save: u32,
    pages_written: u32,
    handles: Option<[ImageHandle; INPUT_CHANNELS]>,
    complete: bool,
}

impl SavingPlan {
    fn new(storage: &StorageSettings) -> Self {
        Self {
            prefix: storage.save_path_prefix.clone(),
            images_to_save: storage.images_to_save,
            pages_written: 0,
            handles: None,
            complete: storage.images_to_save == 0,
        }
    }

    fn active(&self) -> bool {
        !self.complete
    }
}

enum Flow {
    Start,
    Close,
}

enum GroupExit {
    Stopped,
    Close,
}

struct Worker {
    device: Box<dyn AnalogIoDevice>,
    store: Box<dyn ImageStore>,
    tasks: Tasks,
    waveform: ScanWaveform,
    timing: ScanTiming,
    sample_shift: usize,
    binner: SampleBinner,
    accum: FrameAccumulator,
    saving: SavingPlan,
    read_buf: Vec<f64>,
    display: Arc<DisplayLink>,
    state: Arc<StateCell>,
    cmd_rx: Receiver<ScanCommand>,
    event_tx: Sender<ScanEvent>,
}

impl Worker {
    fn run(mut self) -> ScanResult<()> {
        let result = self.acquisition_loop();
        if let Err(ref err) = result {
            error!("acquisition thread stopping on error: {err}");
            if let ScanError::Device { call, status } = *err {
                self.emit(ScanEvent::Fault { call, status });
            }
        }
        self.teardown();
        self.set_state(ScannerState::Idle);
        result
    }

    fn acquisition_loop(&mut self) -> ScanResult<()> {
        loop {
            self.set_state(ScannerState::Resetting);
            self.reset_mirrors()?;
            self.set_state(ScannerState::WaitingForStart);
            match self.wait_for_start() {
                Flow::Close => return Ok(()),
                Flow::Start => {}
            }
            self.set_state(ScannerState::Scanning);
            match self.scan_group()? {
                GroupExit::Close => return Ok(()),
                GroupExit::Stopped => {}
            }
        }
    }

    /// Park the mirrors at the scan origin, load the frame waveform, and
    /// leave the output task armed on the input task's start trigger.
    fn reset_mirrors(&mut self) -> ScanResult<()> {
        let (x0, y0) = self.waveform.start_position();
        // Two updates per channel so the driver flushes the new position.
        self.device
            .write_analog(
                self.tasks.output,
                &[x0, x0, y0, y0],
                2,
                SampleGrouping::ByChannel,
            )
            .call_context("AO reset write")?;
        self.device
            .start_task(self.tasks.output)
            .call_context("AO task start")?;
        self.device
            .start_task(self.tasks.input)
            .call_context("AI task start")?;
        self.device
            .stop_task(self.tasks.output)
            .call_context("AO task stop")?;
        self.device
            .stop_task(self.tasks.input)
            .call_context("AI task stop")?;
        self.device
            .write_analog(
                self.tasks.output,
                self.waveform.samples(),
                self.timing.pixels_per_scan,
                SampleGrouping::ByScanNumber,
            )
            .call_context("AO waveform load")?;
        self.device
            .start_task(self.tasks.output)
            .call_context("AO task arm")?;
        debug!("mirrors parked at ({x0:.3} V, {y0:.3} V); output armed");
        Ok(())
    }

    fn wait_for_start(&mut self) -> Flow {
        loop {
            match self.cmd_rx.recv_timeout(START_POLL) {
                Ok(ScanCommand::Start) => return Flow::Start,
                Ok(ScanCommand::Stop) => {}
                Ok(ScanCommand::ConfigureSaving {
                    path_prefix,
                    images_to_save,
                }) => self.configure_saving(path_prefix, images_to_save),
                Ok(ScanCommand::Close) | Err(RecvTimeoutError::Disconnected) => {
                    return Flow::Close
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn scan_group(&mut self) -> ScanResult<GroupExit> {
        self.binner.reset(self.sample_shift);
        self.accum.reset();
        let mut first = true;
        loop {
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(ScanCommand::Stop) => {
                        self.stop_hardware()?;
                        return Ok(GroupExit::Stopped);
                    }
                    Ok(ScanCommand::Close) | Err(TryRecvError::Disconnected) => {
                        return Ok(GroupExit::Close)
                    }
                    Ok(ScanCommand::Start) => {}
                    Ok(ScanCommand::ConfigureSaving { .. }) => {
                        warn!("saving cannot be reconfigured while scanning; ignored");
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }
            if first {
                self.set_shutter(true)?;
                // Starting the clocked input also releases the armed output.
                self.device
                    .start_task(self.tasks.input)
                    .call_context("AI task start")?;
                info!("scan started");
                first = false;
            }
            let read = self
                .device
                .read_analog(
                    self.tasks.input,
                    None,
                    READ_TIMEOUT,
                    SampleGrouping::ByScanNumber,
                    &mut self.read_buf,
                )
                .call_context("AI task read")?;
            if read > 0 {
                let lines = self.binner.decode(&self.read_buf[..read * INPUT_CHANNELS]);
                let mut halt_after_save = false;
                for line in 0..lines {
                    let completion = {
                        let (ch0, ch1) = self.binner.row(line);
                        self.accum.merge_row(ch0, ch1)
                    };
                    self.display.params().set_scan_line(self.accum.current_line());
                    if let Some(done) = completion {
                        self.publish_frame();
                        self.emit(ScanEvent::FrameCompleted {
                            repetition: done.repetition,
                            average_complete: done.average_complete,
                        });
                        if done.average_complete && self.saving.active() {
                            self.save_average()?;
                            halt_after_save = true;
                            // Lines decoded past a saved average belong to the
                            // next scan group; discard them with the residual.
                            break;
                        }
                    }
                }
                if halt_after_save {
                    self.stop_hardware()?;
                    info!("scan halted after saved average");
                    return Ok(GroupExit::Stopped);
                }
            }
            thread::sleep(SCAN_LOOP_PAUSE);
        }
    }

    /// Close the shutter and stop both clocked tasks, keeping them
    /// configured for the next arm.
    fn stop_hardware(&mut self) -> ScanResult<()> {
        self.set_shutter(false)?;
        self.device
            .stop_task(self.tasks.output)
            .call_context("AO task stop")?;
        self.device
            .stop_task(self.tasks.input)
            .call_context("AI task stop")?;
        info!("scan stopped");
        Ok(())
    }

    fn set_shutter(&mut self, open: bool) -> ScanResult<()> {
        self.device
            .write_digital(self.tasks.shutter, u8::from(open))
            .call_context("shutter write")
    }

    fn publish_frame(&self) {
        let channel = self.display.params().channel().min(INPUT_CHANNELS - 1);
        self.display.handoff().update(self.accum.channel(channel));
    }

    fn save_average(&mut self) -> ScanResult<()> {
        let total = self.saving.images_to_save;
        let handles = match self.saving.handles {
            Some(handles) => handles,
            None => {
                let mut handles = [ImageHandle(0); INPUT_CHANNELS];
                for (channel, slot) in handles.iter_mut().enumerate() {
                    let path = format!("{}_{}.tif", self.saving.prefix, channel);
                    *slot = self.store.open_multi_page(&path)?;
                }
                self.saving.handles = Some(handles);
                handles
            }
        };
        let page = self.saving.pages_written;
        for (channel, &handle) in handles.iter().enumerate() {
            self.store
                .write_page(handle, self.accum.channel(channel), page, total)?;
        }
        self.saving.pages_written += 1;
        self.emit(ScanEvent::AverageSaved {
            page,
            timestamp: Utc::now(),
        });
        info!("saved averaged frame {}/{total}", page + 1);
        if self.saving.pages_written == total {
            for handle in handles {
                self.store.close(handle)?;
            }
            self.saving.handles = None;
            self.saving.complete = true;
            self.emit(ScanEvent::SavingComplete);
            info!("image saving complete ({total} pages per channel)");
        }
        Ok(())
    }

    fn configure_saving(&mut self, path_prefix: String, images_to_save: u32) {
        if let Some(handles) = self.saving.handles.take() {
            for handle in handles {
                if let Err(err) = self.store.close(handle) {
                    warn!("closing image file during reconfiguration failed: {err}");
                }
            }
        }
        info!("saving configured: prefix '{path_prefix}', {images_to_save} images per channel");
        self.saving = SavingPlan {
            prefix: path_prefix,
            images_to_save,
            pages_written: 0,
            handles: None,
            complete: images_to_save == 0,
        };
    }

    /// Best-effort hardware and file teardown; failures are logged, not
    /// propagated, so the first error to occur is the one the caller sees.
    fn teardown(&mut self) {
        if let Err(err) = self.set_shutter(false) {
            warn!("shutter close during teardown failed: {err}");
        }
        if let Some(handles) = self.saving.handles.take() {
            for handle in handles {
                if let Err(err) = self.store.close(handle) {
                    warn!("image store close during teardown failed: {err}");
                }
            }
        }
        for (name, task) in [
            ("shutter", self.tasks.shutter),
            ("mirror output", self.tasks.output),
            ("detector input", self.tasks.input),
        ] {
            if let Err(err) = self.device.stop_task(task) {
                debug!("stopping {name} task during teardown: {err}");
            }
            if let Err(err) = self.device.clear_task(task) {
                warn!("clearing {name} task during teardown failed: {err}");
            }
        }
        self.display.close();
        info!("scanner closed");
    }

    fn set_state(&self, state: ScannerState) {
        self.state.store(state);
        self.emit(ScanEvent::StateChanged(state));
        debug!("scanner state: {state:?}");
    }

    fn emit(&self, event: ScanEvent) {
        // A full queue drops the event; a slow consumer must not stall the scan.
        let _ = self.event_tx.try_send(event);
    }
}
