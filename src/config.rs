//! Application settings, loaded from defaults, an optional TOML file, and the
//! environment (prefix `SCAN`, e.g. `SCAN_SCAN__X_PIXELS=256`).

use serde::Deserialize;

use crate::error::{ScanError, ScanResult};

/// Top-level runtime settings for the scanner core.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Scan geometry and timing.
    pub scan: ScanSettings,
    /// Live-view display parameters.
    pub display: DisplaySettings,
    /// Image persistence parameters.
    pub storage: StorageSettings,
}

/// Mirror drive geometry and acquisition timing.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanSettings {
    /// Peak mirror drive voltage; the fast axis ramps from `-amplitude` to `+amplitude`.
    pub amplitude: f64,
    /// Constant voltage added to every slow-axis sample.
    pub y_offset: f64,
    /// Detector sampling rate in Hz. Must be a positive integer multiple of `output_rate`.
    pub input_rate: f64,
    /// Mirror drive update rate in Hz.
    pub output_rate: f64,
    /// Pixels per line in the forward (imaging) sweep.
    pub x_pixels: usize,
    /// Lines per frame.
    pub y_pixels: usize,
    /// Number of frames averaged into each finalized image.
    pub frames_to_average: u32,
    /// Detector samples discarded at acquisition start to compensate for
    /// the fixed phase lag between mirror drive and detector stream.
    pub sample_shift: usize,
    /// Extend the linear ramp past `+amplitude` before flyback begins.
    pub overshoot: bool,
}

/// Live-view display parameters. These can be changed while scanning.
#[derive(Debug, Clone, Deserialize)]
pub struct DisplaySettings {
    /// Detector channel shown in the live view (0 or 1).
    pub channel: usize,
    /// Lower bound of the intensity mapping.
    pub intensity_min: f32,
    /// Upper bound of the intensity mapping.
    pub intensity_max: f32,
    /// Draw a crosshair at the frame centre.
    pub centre_cross: bool,
    /// Highlight the line currently being acquired.
    pub scan_line_overlay: bool,
}

/// Image persistence parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Number of averaged frames to persist per channel. Zero disables saving.
    pub images_to_save: u32,
    /// Path prefix for the per-channel output files.
    pub save_path_prefix: String,
}

impl Settings {
    /// Load settings from defaults, an optional configuration file, and the environment.
    ///
    /// Later sources override earlier ones. The merged settings are validated
    /// before being returned.
    pub fn new(config_path: Option<&str>) -> ScanResult<Self> {
        let mut builder = config::Config::builder()
            .set_default("scan.amplitude", 1.0)?
            .set_default("scan.y_offset", 0.0)?
            .set_default("scan.input_rate", 1_000_000.0)?
            .set_default("scan.output_rate", 100_000.0)?
            .set_default("scan.x_pixels", 512)?
            .set_default("scan.y_pixels", 512)?
            .set_default("scan.frames_to_average", 1)?
            .set_default("scan.sample_shift", 0)?
            .set_default("scan.overshoot", false)?
            .set_default("display.channel", 0)?
            .set_default("display.intensity_min", 0.0)?
            .set_default("display.intensity_max", 1.0)?
            .set_default("display.centre_cross", false)?
            .set_default("display.scan_line_overlay", false)?
            .set_default("storage.images_to_save", 0)?
            .set_default("storage.save_path_prefix", "scan")?;

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("SCAN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check semantic constraints that parsing alone cannot enforce.
    pub fn validate(&self) -> ScanResult<()> {
        let scan = &self.scan;
        if scan.amplitude <= 0.0 {
            return Err(ScanError::Configuration(format!(
                "amplitude must be positive, got {}",
                scan.amplitude
            )));
        }
        if scan.x_pixels == 0 || scan.y_pixels == 0 {
            return Err(ScanError::Configuration(
                "x_pixels and y_pixels must be non-zero".to_string(),
            ));
        }
        if scan.input_rate <= 0.0 || scan.output_rate <= 0.0 {
            return Err(ScanError::Configuration(format!(
                "sample rates must be positive, got input {} Hz / output {} Hz",
                scan.input_rate, scan.output_rate
            )));
        }
        let input = scan.input_rate as u64;
        let output = scan.output_rate as u64;
        if output == 0 || input % output != 0 {
            return Err(ScanError::Configuration(format!(
                "input rate ({} Hz) must be a positive integer multiple of output rate ({} Hz)",
                scan.input_rate, scan.output_rate
            )));
        }
        if scan.frames_to_average == 0 {
            return Err(ScanError::Configuration(
                "frames_to_average must be at least 1".to_string(),
            ));
        }
        if self.display.channel > 1 {
            return Err(ScanError::Configuration(format!(
                "display channel must be 0 or 1, got {}",
                self.display.channel
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.scan.x_pixels, 512);
        assert_eq!(settings.scan.frames_to_average, 1);
        assert_eq!(settings.storage.images_to_save, 0);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanner.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[scan]\nx_pixels = 256\ny_pixels = 128\n\n[storage]\nimages_to_save = 4"
        )
        .unwrap();

        let settings = Settings::new(path.to_str()).unwrap();
        assert_eq!(settings.scan.x_pixels, 256);
        assert_eq!(settings.scan.y_pixels, 128);
        assert_eq!(settings.storage.images_to_save, 4);
        // Untouched sections keep their defaults.
        assert_eq!(settings.display.channel, 0);
    }

    #[test]
    fn test_environment_overrides_defaults() {
        // Tests run in parallel; y_offset is asserted by no other test.
        std::env::set_var("SCAN_SCAN__Y_OFFSET", "0.5");
        let settings = Settings::new(None);
        std::env::remove_var("SCAN_SCAN__Y_OFFSET");
        let settings = settings.unwrap();
        assert!((settings.scan.y_offset - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_non_integer_rate_ratio_is_rejected() {
        let mut settings = Settings::new(None).unwrap();
        settings.scan.input_rate = 250_000.0;
        settings.scan.output_rate = 100_000.0;
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, crate::error::ScanError::Configuration(_)));
    }

    #[test]
    fn test_zero_frames_to_average_is_rejected() {
        let mut settings = Settings::new(None).unwrap();
        settings.scan.frames_to_average = 0;
        assert!(settings.validate().is_err());
    }
}
