//! MPEG transport stream parsing for tunehls.
//!
//! Everything here is synchronous and allocation-light: bytes go into a
//! [`PacketSync`], packets go into a [`Demuxer`], and events come out. No
//! parser returns an error for malformed input; corruption is logged and
//! skipped.

pub mod demux;
pub mod nal;
pub mod packet;
pub mod pes;
pub mod program;
pub mod psi;

pub use demux::{DemuxEvent, Demuxer};
pub use nal::KeyframeDetector;
pub use packet::{PacketSync, SyncStats, TsPacket, PACKET_SIZE, SYNC_BYTE};
pub use pes::{decode_pts, pts_delta, PesAssembler, PesUnit, PTS_CLOCK_HZ, PTS_MODULO};
pub use program::{ProgramMap, ProgramSelection, ProgramState};
