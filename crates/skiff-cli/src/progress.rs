//! Transfer progress display with progress bars.

use indicatif::{ProgressBar, ProgressStyle};
use skiff_core::{Reader, Status, Writer};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Transfer progress tracker
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Create a new progress tracker
    #[must_use]
    pub fn new(total_bytes: u64, name: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);

        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }

        bar.set_message(format!("Transferring: {name}"));

        Self { bar }
    }

    /// Update progress
    pub fn update(&self, transferred_bytes: u64) {
        self.bar.set_position(transferred_bytes);
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// Position of a stream, shared with the display
#[derive(Debug, Clone, Default)]
pub struct Position(Arc<AtomicU64>);

impl Position {
    /// Current byte position
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self, position: u64) {
        self.0.store(position, Ordering::Relaxed);
    }

    fn advance(&self, bytes: usize) {
        self.0.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Reader reporting its position
pub struct TrackedReader<R> {
    inner: R,
    position: Position,
}

impl<R: Reader> TrackedReader<R> {
    /// Wrap `inner`
    pub fn new(inner: R, position: Position) -> Self {
        Self { inner, position }
    }
}

impl<R: Reader> Reader for TrackedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        let n = self.inner.read(buf)?;
        self.position.advance(n);
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        self.inner.seek(offset)?;
        self.position.set(offset);
        Ok(())
    }

    fn size_bytes(&self) -> Option<u64> {
        self.inner.size_bytes()
    }
}

/// Writer reporting its position
pub struct TrackedWriter<W> {
    inner: W,
    position: Position,
}

impl<W: Writer> TrackedWriter<W> {
    /// Wrap `inner`, which is positioned at `start`
    pub fn new(inner: W, position: Position, start: u64) -> Self {
        position.set(start);
        Self { inner, position }
    }
}

impl<W: Writer> Writer for TrackedWriter<W> {
    fn write(&mut self, data: &[u8]) -> Result<(), Status> {
        self.inner.write(data)?;
        self.position.advance(data.len());
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        self.inner.seek(offset)?;
        self.position.set(offset);
        Ok(())
    }

    fn write_limit(&self) -> Option<u64> {
        self.inner.write_limit()
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();

    if millis < 1000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        let secs = duration.as_secs();
        format!("{}m {}s", secs / 60, secs % 60)
    }
}
