//! Image persistence collaborator interface.
//!
//! Finalized averages are written as pages of a multi-page 32-bit float
//! image, one file per detector channel. The scanner treats the store as a
//! black box behind [`ImageStore`]; the crate ships [`MemoryImageStore`] for
//! tests, and a TIFF-backed store can be slotted in without touching the
//! acquisition code.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::info;

/// Opaque identifier for an open multi-page image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u32);

/// Multi-page 32-bit float image store.
///
/// Calls are made from the acquisition thread, so implementations must be
/// `Send`.
pub trait ImageStore: Send {
    /// Open (or create) a multi-page image file at `path`.
    fn open_multi_page(&mut self, path: &str) -> Result<ImageHandle>;

    /// Append one page of row-major pixels. `page_index` is zero-based;
    /// `total_pages` is the number of pages the finished file will hold.
    fn write_page(
        &mut self,
        handle: ImageHandle,
        pixels: &[f32],
        page_index: u32,
        total_pages: u32,
    ) -> Result<()>;

    /// Finalize and close the file.
    fn close(&mut self, handle: ImageHandle) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredFile {
    path: String,
    opened_at: DateTime<Utc>,
    total_pages: u32,
    pages: Vec<Vec<f32>>,
    closed: bool,
}

#[derive(Default)]
struct MemoryStoreState {
    next_handle: u32,
    files: HashMap<ImageHandle, StoredFile>,
}

/// In-memory store double. A cheap clone over shared state, so a test can
/// keep one clone for inspection while the scanner owns the other.
#[derive(Clone, Default)]
pub struct MemoryImageStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryImageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths of every file opened so far.
    pub fn paths(&self) -> Vec<String> {
        self.lock().files.values().map(|f| f.path.clone()).collect()
    }

    /// Pages written to the file at `path`, if it was opened.
    pub fn pages(&self, path: &str) -> Option<Vec<Vec<f32>>> {
        self.lock()
            .files
            .values()
            .find(|f| f.path == path)
            .map(|f| f.pages.clone())
    }

    /// Whether the file at `path` has been finalized.
    pub fn is_closed(&self, path: &str) -> Option<bool> {
        self.lock()
            .files
            .values()
            .find(|f| f.path == path)
            .map(|f| f.closed)
    }

    /// Declared total page count of the file at `path`.
    pub fn total_pages(&self, path: &str) -> Option<u32> {
        self.lock()
            .files
            .values()
            .find(|f| f.path == path)
            .map(|f| f.total_pages)
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreState> {
        self.state.lock().unwrap()
    }
}

impl ImageStore for MemoryImageStore {
    fn open_multi_page(&mut self, path: &str) -> Result<ImageHandle> {
        let mut state = self.lock();
        let handle = ImageHandle(state.next_handle);
        state.next_handle += 1;
        state.files.insert(
            handle,
            StoredFile {
                path: path.to_string(),
                opened_at: Utc::now(),
                total_pages: 0,
                pages: Vec::new(),
                closed: false,
            },
        );
        info!("memory store: opened '{path}'");
        Ok(handle)
    }

    fn write_page(
        &mut self,
        handle: ImageHandle,
        pixels: &[f32],
        page_index: u32,
        total_pages: u32,
    ) -> Result<()> {
        let mut state = self.lock();
        let file = state
            .files
            .get_mut(&handle)
            .with_context(|| format!("unknown image handle {handle:?}"))?;
        if file.closed {
            return Err(anyhow!("image file '{}' already closed", file.path));
        }
        if page_index as usize != file.pages.len() {
            return Err(anyhow!(
                "page {page_index} written out of order to '{}' (expected {})",
                file.path,
                file.pages.len()
            ));
        }
        file.total_pages = total_pages;
        file.pages.push(pixels.to_vec());
        Ok(())
    }

    fn close(&mut self, handle: ImageHandle) -> Result<()> {
        let mut state = self.lock();
        let file = state
            .files
            .get_mut(&handle)
            .with_context(|| format!("unknown image handle {handle:?}"))?;
        file.closed = true;
        info!(
            "memory store: closed '{}' with {} pages (opened {})",
            file.path,
            file.pages.len(),
            file.opened_at
        );
        Ok(())
    }
}
