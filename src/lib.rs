//! Core library for the scan_daq application.
//!
//! This library contains the acquisition and control core for a
//! raster-scanning two-photon microscope: mirror waveform synthesis, the
//! scanning state machine and acquisition thread, sample binning and frame
//! averaging, the live-view hand-off, and the hardware and image-store
//! collaborator traits.

pub mod config;
pub mod device;
pub mod display;
pub mod error;
pub mod scanner;
pub mod storage;
pub mod waveform;
