//! End-to-end tests of the scan pipeline against the scripted mock device.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use scan_daq::config::Settings;
use scan_daq::device::mock::MockDevice;
use scan_daq::error::ScanError;
use scan_daq::scanner::{ScanEvent, Scanner, ScannerState};
use scan_daq::storage::MemoryImageStore;
use scan_daq::waveform::{RateConfig, ScanGeometry, ScanTiming};

const WAIT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A small, fast geometry: 16x16 pixels, bin factor 10, 10 flyback pixels.
fn base_settings() -> Settings {
    let mut settings = Settings::new(None).expect("default settings");
    settings.scan.amplitude = 1.0;
    settings.scan.y_offset = 0.0;
    settings.scan.input_rate = 100_000.0;
    settings.scan.output_rate = 10_000.0;
    settings.scan.x_pixels = 16;
    settings.scan.y_pixels = 16;
    settings.scan.frames_to_average = 1;
    settings.scan.sample_shift = 0;
    settings.scan.overshoot = false;
    settings.storage.images_to_save = 0;
    settings
}

fn derive_timing(settings: &Settings) -> ScanTiming {
    let geometry = ScanGeometry {
        amplitude: settings.scan.amplitude,
        x_pixels: settings.scan.x_pixels,
        y_pixels: settings.scan.y_pixels,
        y_offset: settings.scan.y_offset,
        overshoot: settings.scan.overshoot,
    };
    let rates = RateConfig {
        input_rate: settings.scan.input_rate,
        output_rate: settings.scan.output_rate,
    };
    ScanTiming::derive(&geometry, &rates).expect("valid timing")
}

/// One frame of interleaved detector samples: `value` on channel 0,
/// `-value` on channel 1.
fn frame_chunk(settings: &Settings, value: f64) -> Vec<f64> {
    let timing = derive_timing(settings);
    let mut chunk = Vec::with_capacity(timing.samples_per_scan * 2);
    for _ in 0..timing.samples_per_scan {
        chunk.push(value);
        chunk.push(-value);
    }
    chunk
}

fn wait_for_state(scanner: &Scanner, want: ScannerState) {
    let deadline = Instant::now() + WAIT;
    while scanner.state() != want {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {want:?}, currently {:?}",
            scanner.state()
        );
        thread::sleep(Duration::from_millis(2));
    }
}

fn wait_for_event<F>(events: &Receiver<ScanEvent>, mut pred: F) -> ScanEvent
where
    F: FnMut(&ScanEvent) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return event,
            Ok(_) => {}
            Err(err) => panic!("timed out waiting for event: {err}"),
        }
    }
}

#[test]
fn constant_signal_fills_every_forward_pixel() {
    init_logging();
    // The reference geometry: 100x100 pixels at 1 MHz in / 100 kHz out.
    let mut settings = base_settings();
    settings.scan.input_rate = 1_000_000.0;
    settings.scan.output_rate = 100_000.0;
    settings.scan.x_pixels = 100;
    settings.scan.y_pixels = 100;
    let timing = derive_timing(&settings);
    assert_eq!(timing.samples_per_scan, 200_000);

    let mock = MockDevice::new();
    mock.push_read(frame_chunk(&settings, 0.5));
    let store = MemoryImageStore::new();
    let mut scanner =
        Scanner::new(&settings, Box::new(mock.clone()), Box::new(store)).expect("scanner");
    let events = scanner.events();

    wait_for_state(&scanner, ScannerState::WaitingForStart);
    scanner.start().expect("start");
    wait_for_event(&events, |ev| {
        matches!(
            ev,
            ScanEvent::FrameCompleted {
                average_complete: true,
                ..
            }
        )
    });

    let display = scanner.display();
    let frame = display
        .handoff()
        .with_active(|frame| frame.to_vec())
        .expect("published frame");
    assert_eq!(frame.len(), 10_000);
    assert!(frame.iter().all(|&pixel| (pixel - 0.5).abs() < 1e-6));

    scanner.stop().expect("stop");
    scanner.close().expect("close");

    // The shutter opened for the scan and ended closed.
    let writes = mock.digital_writes();
    assert_eq!(writes.first(), Some(&1));
    assert_eq!(writes.last(), Some(&0));
}

#[test]
fn reset_parks_mirrors_and_arms_output_on_input_trigger() {
    init_logging();
    let settings = base_settings();
    let timing = derive_timing(&settings);
    let mock = MockDevice::new();
    let mut scanner = Scanner::new(
        &settings,
        Box::new(mock.clone()),
        Box::new(MemoryImageStore::new()),
    )
    .expect("scanner");

    wait_for_state(&scanner, ScannerState::WaitingForStart);
    scanner.close().expect("close");

    let calls = mock.calls();
    let trigger = calls
        .iter()
        .position(|c| c == "configure_start_trigger")
        .expect("output armed on input trigger");
    // Park (write + start + stop both tasks), then load and re-arm.
    assert_eq!(
        &calls[trigger + 1..trigger + 8],
        [
            "write_analog",
            "start_task",
            "start_task",
            "stop_task",
            "stop_task",
            "write_analog",
            "start_task",
        ]
    );

    // The full frame waveform was loaded, interleaved across both axes.
    let waveform = mock.first_waveform().expect("waveform loaded");
    assert_eq!(waveform.len(), timing.pixels_per_scan * 2);
    // Both tasks plus the shutter line are released on close.
    assert_eq!(mock.cleared_tasks().len(), 3);
}

#[test]
fn stop_before_any_sample_leaves_buffers_untouched() {
    init_logging();
    let settings = base_settings();
    let mock = MockDevice::new(); // nothing scripted: reads return 0 samples
    let mut scanner = Scanner::new(
        &settings,
        Box::new(mock),
        Box::new(MemoryImageStore::new()),
    )
    .expect("scanner");

    wait_for_state(&scanner, ScannerState::WaitingForStart);
    scanner.start().expect("start");
    wait_for_state(&scanner, ScannerState::Scanning);
    assert!(scanner.is_scanning());
    scanner.stop().expect("stop");
    wait_for_state(&scanner, ScannerState::WaitingForStart);
    assert!(!scanner.is_scanning());

    let display = scanner.display();
    let frame = display
        .handoff()
        .with_active(|frame| frame.to_vec())
        .expect("frame");
    assert!(frame.iter().all(|&pixel| pixel == 0.0));

    scanner.close().expect("close");
}

#[test]
fn averages_are_saved_then_files_close() {
    init_logging();
    let mut settings = base_settings();
    settings.scan.frames_to_average = 4;
    settings.storage.images_to_save = 3;
    settings.storage.save_path_prefix = "stack".to_string();

    let mock = MockDevice::new();
    // Three scan groups, each delivering four frames in a single read.
    for group in 0..3_u32 {
        let timing = derive_timing(&settings);
        let mut chunk = Vec::with_capacity(4 * timing.samples_per_scan * 2);
        for repetition in 0..4_u32 {
            let value = f64::from(group * 4 + repetition + 1);
            chunk.extend(frame_chunk(&settings, value));
        }
        mock.push_read(chunk);
    }

    let store = MemoryImageStore::new();
    let mut scanner = Scanner::new(
        &settings,
        Box::new(mock.clone()),
        Box::new(store.clone()),
    )
    .expect("scanner");
    let events = scanner.events();

    for group in 0..3_u32 {
        wait_for_state(&scanner, ScannerState::WaitingForStart);
        scanner.start().expect("start");
        wait_for_event(&events, |ev| {
            matches!(ev, ScanEvent::AverageSaved { page, .. } if *page == group)
        });
        // Each saved average halts its scan; the thread re-arms.
        wait_for_state(&scanner, ScannerState::WaitingForStart);
    }
    wait_for_event(&events, |ev| matches!(ev, ScanEvent::SavingComplete));

    for channel in 0..2 {
        let path = format!("stack_{channel}.tif");
        let pages = store.pages(&path).expect("file opened");
        assert_eq!(pages.len(), 3);
        assert_eq!(store.total_pages(&path), Some(3));
        assert_eq!(store.is_closed(&path), Some(true));
        for (group, page) in pages.iter().enumerate() {
            // Mean of the four per-repetition constants.
            let expected = (group as f32) * 4.0 + 2.5;
            let expected = if channel == 0 { expected } else { -expected };
            assert!(
                page.iter().all(|&pixel| (pixel - expected).abs() < 1e-4),
                "channel {channel} page {group} expected {expected}"
            );
        }
    }

    // With saving complete, a further average no longer halts the scan.
    mock.push_read({
        let mut chunk = Vec::new();
        for _ in 0..4 {
            chunk.extend(frame_chunk(&settings, 9.0));
        }
        chunk
    });
    wait_for_state(&scanner, ScannerState::WaitingForStart);
    scanner.start().expect("start");
    wait_for_event(&events, |ev| {
        matches!(
            ev,
            ScanEvent::FrameCompleted {
                average_complete: true,
                ..
            }
        )
    });
    thread::sleep(Duration::from_millis(100));
    assert!(scanner.is_scanning());
    assert_eq!(store.pages("stack_0.tif").map(|p| p.len()), Some(3));
    scanner.stop().expect("stop");

    scanner.close().expect("close");
}

#[test]
fn read_spanning_two_averages_saves_one_page_per_start() {
    init_logging();
    let mut settings = base_settings();
    settings.scan.frames_to_average = 1;
    settings.storage.images_to_save = 2;
    settings.storage.save_path_prefix = "pair".to_string();

    let mock = MockDevice::new();
    // One read holding two complete frames; only the first may be persisted.
    let mut chunk = frame_chunk(&settings, 1.0);
    chunk.extend(frame_chunk(&settings, 3.0));
    mock.push_read(chunk);

    let store = MemoryImageStore::new();
    let mut scanner = Scanner::new(
        &settings,
        Box::new(mock.clone()),
        Box::new(store.clone()),
    )
    .expect("scanner");
    let events = scanner.events();

    wait_for_state(&scanner, ScannerState::WaitingForStart);
    scanner.start().expect("start");
    wait_for_event(&events, |ev| {
        matches!(ev, ScanEvent::AverageSaved { page, .. } if *page == 0)
    });
    wait_for_state(&scanner, ScannerState::WaitingForStart);

    let pages = store.pages("pair_0.tif").expect("file opened");
    assert_eq!(pages.len(), 1, "one Start must persist exactly one page");
    assert!(pages[0].iter().all(|&pixel| (pixel - 1.0).abs() < 1e-6));

    // The second frame was discarded with the group; the next start saves
    // freshly acquired data.
    mock.push_read(frame_chunk(&settings, 5.0));
    scanner.start().expect("start");
    wait_for_event(&events, |ev| {
        matches!(ev, ScanEvent::AverageSaved { page, .. } if *page == 1)
    });
    wait_for_state(&scanner, ScannerState::WaitingForStart);

    let pages = store.pages("pair_0.tif").expect("file opened");
    assert_eq!(pages.len(), 2);
    assert!(pages[1].iter().all(|&pixel| (pixel - 5.0).abs() < 1e-6));
    assert_eq!(store.is_closed("pair_0.tif"), Some(true));

    scanner.close().expect("close");
}

#[test]
fn setup_failure_clears_created_tasks() {
    init_logging();
    let settings = base_settings();
    let mock = MockDevice::new();
    mock.fail_on("configure_sample_clock", -200077);

    let err = Scanner::new(
        &settings,
        Box::new(mock.clone()),
        Box::new(MemoryImageStore::new()),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ScanError::Device {
            call: "AI clock config",
            status: -200077,
        }
    ));

    // The shutter and input tasks already existed; both must be released.
    assert_eq!(mock.task_count(), 2);
    assert_eq!(mock.cleared_tasks().len(), 2);
}

#[test]
fn read_failure_tears_down_and_surfaces_at_close() {
    init_logging();
    let settings = base_settings();
    let mock = MockDevice::new();
    mock.fail_on("read_analog", -200279);
    let mut scanner = Scanner::new(
        &settings,
        Box::new(mock.clone()),
        Box::new(MemoryImageStore::new()),
    )
    .expect("scanner");

    wait_for_state(&scanner, ScannerState::WaitingForStart);
    scanner.start().expect("start");
    wait_for_state(&scanner, ScannerState::Idle);

    // Teardown closed the shutter and released every task.
    assert_eq!(mock.digital_writes().last(), Some(&0));
    assert_eq!(mock.cleared_tasks().len(), 3);

    match scanner.close() {
        Err(ScanError::Device { call, status }) => {
            assert_eq!(call, "AI task read");
            assert_eq!(status, -200279);
        }
        other => panic!("expected device error from close, got {other:?}"),
    }

    // Commands after close are rejected.
    assert!(matches!(scanner.start(), Err(ScanError::AlreadyClosed)));
}

#[test]
fn display_parameters_can_change_while_scanning() {
    init_logging();
    let settings = base_settings();
    let mut scanner = Scanner::new(
        &settings,
        Box::new(MockDevice::new()),
        Box::new(MemoryImageStore::new()),
    )
    .expect("scanner");

    wait_for_state(&scanner, ScannerState::WaitingForStart);
    scanner.start().expect("start");
    wait_for_state(&scanner, ScannerState::Scanning);

    scanner.configure_display(1, -0.25, 2.0, true, true);
    let display = scanner.display();
    assert_eq!(display.params().channel(), 1);
    assert_eq!(display.params().intensity_range(), (-0.25, 2.0));
    assert!(display.params().centre_cross());
    assert!(display.params().scan_line_overlay());
    assert_eq!(display.width(), 16);
    assert_eq!(display.height(), 16);

    scanner.stop().expect("stop");
    scanner.close().expect("close");
    assert!(display.is_closed());
}
