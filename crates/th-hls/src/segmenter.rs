//! Transport stream segmenter.
//!
//! Packets are passed through verbatim into the current segment buffer. The
//! video PTS clock decides when a segment is complete. The cut either lands
//! at the end of the buffer (duration-only) or just before the packet that
//! started an IDR access unit (keyframe-aligned).

use std::path::{Path, PathBuf};

use th_core::config::HlsConfig;
use th_core::Result;
use th_ts::{pts_delta, PACKET_SIZE, PTS_CLOCK_HZ};

use crate::atomic::write_atomic;
use crate::playlist::{PlaylistWriter, SegmentEntry};

/// A final partial segment shorter than this is discarded on shutdown.
pub const MIN_FINAL_SEGMENT_SECS: f64 = 0.5;

/// Without an IDR for this many target durations, cut anyway.
const KEYFRAME_WAIT_FACTOR: u64 = 3;

/// Forward jumps beyond this are treated as a discontinuity.
const MAX_FORWARD_JUMP: u64 = 60 * PTS_CLOCK_HZ;

/// Backward steps up to this are frame reordering, not a discontinuity.
const REORDER_TOLERANCE: u64 = PTS_CLOCK_HZ;

/// Bytes kept while no video clock has started (no program yet, audio-only,
/// or video without PTS). Older packets are discarded.
pub const MAX_PREROLL_BYTES: usize = 2 * 1024 * 1024;

/// Hard ceiling for one segment. Reaching it forces a cut.
pub const MAX_SEGMENT_BYTES: usize = 64 * 1024 * 1024;

/// File name for the segment with the given 1-based index.
pub fn segment_name(index: u64) -> String {
    format!("segment{index:05}.ts")
}

/// A segment that was written and listed.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    pub index: u64,
    pub name: String,
    pub duration: f64,
    pub bytes: usize,
    pub discontinuity: bool,
    /// Cut on an IDR, so the segment starts with a keyframe.
    pub keyframe_start: bool,
}

/// Why the current segment is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cut {
    /// At the end of the buffered bytes.
    End,
    /// Before the packet that started the most recent video unit.
    UnitStart,
}

#[derive(Debug)]
pub struct Segmenter {
    dir: PathBuf,
    target_ticks: u64,
    keyframe_aligned: bool,
    align: bool,
    playlist: PlaylistWriter,
    buf: Vec<u8>,
    start_pts: Option<u64>,
    last_pts: u64,
    unit_start: Option<usize>,
    pending_keyframe: bool,
    starts_with_keyframe: bool,
    next_discontinuity: bool,
    next_index: u64,
    closed: bool,
    preroll_limit: usize,
    segment_limit: usize,
    discarded: u64,
}

impl Segmenter {
    pub fn new(dir: impl Into<PathBuf>, config: &HlsConfig) -> Self {
        let dir = dir.into();
        let target = if config.target_duration_secs > 0.0 {
            config.target_duration_secs
        } else {
            HlsConfig::default().target_duration_secs
        };
        Self {
            playlist: PlaylistWriter::new(&dir, config.window_size, target),
            dir,
            target_ticks: (target * PTS_CLOCK_HZ as f64).round() as u64,
            keyframe_aligned: config.keyframe_aligned,
            align: false,
            buf: Vec::new(),
            start_pts: None,
            last_pts: 0,
            unit_start: None,
            pending_keyframe: false,
            starts_with_keyframe: false,
            next_discontinuity: false,
            next_index: 1,
            closed: false,
            preroll_limit: MAX_PREROLL_BYTES,
            segment_limit: MAX_SEGMENT_BYTES,
            discarded: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn playlist(&self) -> &PlaylistWriter {
        &self.playlist
    }

    /// Bytes in the current, unfinished segment.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes thrown away because no segment could take them.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Whether an IDR has been seen since the current segment began.
    pub fn pending_keyframe(&self) -> bool {
        self.pending_keyframe
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Enable keyframe-aligned cuts for the selected video codec. Only has an
    /// effect when alignment is configured.
    pub fn set_keyframes_available(&mut self, available: bool) {
        self.align = self.keyframe_aligned && available;
        self.unit_start = None;
    }

    /// Append one raw transport packet to the current segment.
    ///
    /// Before the video clock starts only the most recent pre-roll is kept.
    /// A segment that outgrows the byte ceiling is cut on the spot.
    pub fn push_packet(&mut self, raw: &[u8]) -> Result<Option<SegmentInfo>> {
        if self.closed {
            return Ok(None);
        }
        self.buf.extend_from_slice(raw);

        match self.start_pts {
            None if self.buf.len() > self.preroll_limit => {
                self.discard_front(self.buf.len() - self.preroll_limit / 2);
                tracing::debug!(discarded = self.discarded, "No video clock yet; trimmed pre-roll");
                Ok(None)
            }
            Some(start) if self.buf.len() > self.segment_limit => {
                let elapsed = pts_delta(start, self.last_pts);
                tracing::warn!(
                    bytes = self.buf.len(),
                    elapsed,
                    "Segment exceeded the size limit"
                );
                if elapsed > 0 {
                    let last = self.last_pts;
                    return self.rotate(Cut::End, elapsed, last, false);
                }
                // Nothing to time the bytes against; drop them and wait for
                // the clock to restart.
                self.discard_front(self.buf.len());
                self.start_pts = None;
                self.next_discontinuity = true;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Drop at least `count` bytes, in whole packets, from the front.
    fn discard_front(&mut self, count: usize) {
        let count = count
            .div_ceil(PACKET_SIZE)
            .saturating_mul(PACKET_SIZE)
            .min(self.buf.len());
        self.buf.drain(..count);
        self.unit_start = self.unit_start.and_then(|o| o.checked_sub(count));
        self.discarded += count as u64;
    }

    /// The next packet pushed starts a new video unit.
    pub fn mark_video_unit_start(&mut self) {
        self.unit_start = Some(self.buf.len());
    }

    /// A video unit that began at the last marked start has completed.
    ///
    /// Returns the segment this closed, if any. A write error has already
    /// dropped the segment; the segmenter stays usable.
    pub fn on_video_unit(&mut self, pts: Option<u64>, keyframe: bool) -> Result<Option<SegmentInfo>> {
        if self.closed {
            return Ok(None);
        }
        if keyframe {
            self.pending_keyframe = true;
        }
        let Some(pts) = pts else {
            return Ok(None);
        };

        let Some(start) = self.start_pts else {
            self.start_pts = Some(pts);
            self.last_pts = pts;
            self.starts_with_keyframe = keyframe;
            self.pending_keyframe = false;
            return Ok(None);
        };

        let forward = pts_delta(self.last_pts, pts);
        if forward > MAX_FORWARD_JUMP {
            if pts_delta(pts, self.last_pts) <= REORDER_TOLERANCE {
                // Reordered frame; the clock has already been past this.
                return Ok(None);
            }
            tracing::warn!(
                last_pts = self.last_pts,
                pts,
                "PTS discontinuity; closing segment"
            );
            let elapsed = pts_delta(start, self.last_pts);
            let cut = if self.unit_start.is_some() {
                Cut::UnitStart
            } else {
                Cut::End
            };
            let closed = self.rotate(cut, elapsed, pts, keyframe);
            self.next_discontinuity = true;
            return closed;
        }

        self.last_pts = pts;
        let elapsed = pts_delta(start, pts);

        if self.align {
            if keyframe && elapsed >= self.target_ticks && self.unit_start.is_some() {
                return self.rotate(Cut::UnitStart, elapsed, pts, true);
            }
            if elapsed >= self.target_ticks * KEYFRAME_WAIT_FACTOR {
                tracing::debug!(elapsed, "No keyframe in time; cutting on duration");
                return self.rotate(Cut::End, elapsed, pts, false);
            }
            return Ok(None);
        }

        if elapsed >= self.target_ticks {
            return self.rotate(Cut::End, elapsed, pts, false);
        }
        Ok(None)
    }

    /// Flush the last partial segment if it holds enough content, then stop
    /// accepting data. Idempotent.
    pub fn finish(&mut self) -> Result<Option<SegmentInfo>> {
        if self.closed {
            return Ok(None);
        }

        let result = match self.start_pts {
            Some(start) if !self.buf.is_empty() => {
                let elapsed = pts_delta(start, self.last_pts);
                if ticks_to_secs(elapsed) >= MIN_FINAL_SEGMENT_SECS {
                    let last = self.last_pts;
                    self.rotate(Cut::End, elapsed, last, false)
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        };

        self.closed = true;
        self.buf = Vec::new();
        result
    }

    fn rotate(
        &mut self,
        cut: Cut,
        elapsed: u64,
        new_start: u64,
        new_starts_with_keyframe: bool,
    ) -> Result<Option<SegmentInfo>> {
        let at = match cut {
            Cut::End => self.buf.len(),
            Cut::UnitStart => self.unit_start.unwrap_or(self.buf.len()),
        };

        let bytes: Vec<u8> = self.buf.drain(..at).collect();
        self.unit_start = self.unit_start.and_then(|o| o.checked_sub(at));
        let discontinuity = std::mem::take(&mut self.next_discontinuity);
        let keyframe_start = self.starts_with_keyframe;
        self.start_pts = Some(new_start);
        self.last_pts = new_start;
        self.starts_with_keyframe = new_starts_with_keyframe;
        self.pending_keyframe = false;

        if bytes.is_empty() {
            if discontinuity {
                self.next_discontinuity = true;
            }
            return Ok(None);
        }

        let index = self.next_index;
        self.next_index += 1;
        let info = SegmentInfo {
            index,
            name: segment_name(index),
            duration: ticks_to_secs(elapsed),
            bytes: bytes.len(),
            discontinuity,
            keyframe_start,
        };

        if let Err(e) = write_atomic(&self.dir.join(&info.name), &bytes) {
            tracing::error!(segment = %info.name, "Failed to write segment: {e}");
            return Err(e);
        }

        self.playlist.append(SegmentEntry {
            name: info.name.clone(),
            duration: info.duration,
            discontinuity,
        })?;

        tracing::debug!(
            segment = %info.name,
            duration = info.duration,
            bytes = info.bytes,
            keyframe_start,
            "Segment written"
        );
        Ok(Some(info))
    }
}

fn ticks_to_secs(ticks: u64) -> f64 {
    ticks as f64 / PTS_CLOCK_HZ as f64
}
