//! Sliding-window live playlist.

use std::collections::VecDeque;
use std::fmt::Write;
use std::path::{Path, PathBuf};

use th_core::Result;

use crate::atomic::write_atomic;

/// File name of the playlist inside a session directory.
pub const PLAYLIST_NAME: &str = "index.m3u8";

/// One segment as listed in the playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    pub name: String,
    pub duration: f64,
    /// Preceded by `#EXT-X-DISCONTINUITY`.
    pub discontinuity: bool,
}

/// Keeps the last `window` segments and rewrites `index.m3u8` on every
/// append. Segment files that fall out of the window are deleted.
#[derive(Debug)]
pub struct PlaylistWriter {
    dir: PathBuf,
    path: PathBuf,
    window: usize,
    target_duration: f64,
    entries: VecDeque<SegmentEntry>,
    media_sequence: u64,
    discontinuity_sequence: u64,
}

impl PlaylistWriter {
    pub fn new(dir: impl Into<PathBuf>, window: usize, target_duration: f64) -> Self {
        let dir = dir.into();
        Self {
            path: dir.join(PLAYLIST_NAME),
            dir,
            window,
            target_duration,
            entries: VecDeque::with_capacity(window + 1),
            media_sequence: 0,
            discontinuity_sequence: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn media_sequence(&self) -> u64 {
        self.media_sequence
    }

    pub fn entries(&self) -> impl Iterator<Item = &SegmentEntry> {
        self.entries.iter()
    }

    /// `#EXT-X-TARGETDURATION` value: the configured duration rounded up,
    /// or the longest listed segment rounded up if that is larger.
    pub fn target_duration(&self) -> u64 {
        let longest = self
            .entries
            .iter()
            .map(|e| e.duration)
            .fold(self.target_duration, f64::max);
        longest.ceil().max(1.0) as u64
    }

    /// Add a segment, evict past the window, and rewrite the playlist file.
    pub fn append(&mut self, entry: SegmentEntry) -> Result<()> {
        self.entries.push_back(entry);

        while self.entries.len() > self.window {
            let Some(evicted) = self.entries.pop_front() else {
                break;
            };
            self.media_sequence += 1;
            if evicted.discontinuity {
                self.discontinuity_sequence += 1;
            }
            self.remove_segment_file(&evicted.name);
        }

        write_atomic(&self.path, self.render().as_bytes())
    }

    fn remove_segment_file(&self, name: &str) {
        let path = self.dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::trace!(segment = name, "Evicted segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to delete {}: {e}", path.display()),
        }
    }

    /// Playlist text for the current window.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "#EXTM3U");
        let _ = writeln!(out, "#EXT-X-VERSION:3");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", self.target_duration());
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence);
        if self.discontinuity_sequence > 0 {
            let _ = writeln!(
                out,
                "#EXT-X-DISCONTINUITY-SEQUENCE:{}",
                self.discontinuity_sequence
            );
        }

        for entry in &self.entries {
            if entry.discontinuity {
                let _ = writeln!(out, "#EXT-X-DISCONTINUITY");
            }
            let _ = writeln!(out, "#EXTINF:{:.3},", entry.duration);
            let _ = writeln!(out, "{}", entry.name);
        }

        out
    }
}
