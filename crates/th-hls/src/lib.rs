//! Segment files and live playlists.
//!
//! The [`Segmenter`] owns a [`PlaylistWriter`] for the same directory and
//! drives it after each completed segment.

pub mod atomic;
pub mod playlist;
pub mod segmenter;

pub use playlist::{PlaylistWriter, SegmentEntry, PLAYLIST_NAME};
pub use segmenter::{
    segment_name, SegmentInfo, Segmenter, MAX_PREROLL_BYTES, MAX_SEGMENT_BYTES, MIN_FINAL_SEGMENT_SECS,
};
