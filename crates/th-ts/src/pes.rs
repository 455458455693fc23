//! PES reassembly and presentation timestamp extraction.

use std::collections::HashMap;

use crate::packet::TsPacket;

/// A PES buffer larger than this is flushed without waiting for the next
/// unit start.
pub const MAX_PES_SIZE: usize = 1024 * 1024;

/// Ticks per second of the PTS clock.
pub const PTS_CLOCK_HZ: u64 = 90_000;

/// PTS values are 33 bits wide.
pub const PTS_MODULO: u64 = 1 << 33;

const PES_HEADER_FIXED: usize = 9;

/// One reassembled PES packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesUnit {
    pub pid: u16,
    pub pts: Option<u64>,
    /// Elementary stream bytes after the PES header.
    pub payload: Vec<u8>,
    /// Emitted because the size cap was hit rather than a unit start.
    pub forced: bool,
}

#[derive(Debug, Default)]
struct PidBuffer {
    data: Vec<u8>,
    /// False for a continuation started after a forced flush.
    has_header: bool,
}

/// Per-PID PES reassembly.
///
/// A unit is complete when the next unit start arrives on the same PID. The
/// caller decides which PIDs to feed.
#[derive(Debug, Default)]
pub struct PesAssembler {
    buffers: HashMap<u16, PidBuffer>,
}

impl PesAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all partial units.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Feed one packet; completed units are pushed onto `out`.
    pub fn push(&mut self, packet: &TsPacket, out: &mut Vec<PesUnit>) {
        let pid = packet.pid();
        let payload = packet.payload();

        if packet.payload_unit_start() {
            if let Some(prev) = self.buffers.remove(&pid) {
                if !prev.data.is_empty() {
                    out.push(finish_unit(pid, prev, false));
                }
            }
            self.buffers.insert(
                pid,
                PidBuffer {
                    data: payload.to_vec(),
                    has_header: true,
                },
            );
        } else {
            // Continuations before the first unit start are unusable.
            let Some(buf) = self.buffers.get_mut(&pid) else {
                return;
            };
            buf.data.extend_from_slice(payload);
        }

        if let Some(buf) = self.buffers.get_mut(&pid) {
            if buf.data.len() > MAX_PES_SIZE {
                tracing::warn!(pid, len = buf.data.len(), "PES exceeded size cap; flushing");
                let full = std::mem::take(buf);
                out.push(finish_unit(pid, full, true));
            }
        }
    }

    /// Complete every pending unit, e.g. at end of stream.
    pub fn flush(&mut self, out: &mut Vec<PesUnit>) {
        let mut pids: Vec<u16> = self.buffers.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            if let Some(buf) = self.buffers.remove(&pid) {
                if !buf.data.is_empty() {
                    out.push(finish_unit(pid, buf, false));
                }
            }
        }
    }
}

fn finish_unit(pid: u16, buf: PidBuffer, forced: bool) -> PesUnit {
    if !buf.has_header {
        return PesUnit {
            pid,
            pts: None,
            payload: buf.data,
            forced,
        };
    }
    let (pts, payload) = parse_pes(&buf.data);
    PesUnit {
        pid,
        pts,
        payload: payload.to_vec(),
        forced,
    }
}

/// Split a PES packet into its PTS (if flagged) and elementary stream bytes.
///
/// Data without a `00 00 01` prefix or too short for the fixed header yields
/// no PTS and no payload.
pub fn parse_pes(data: &[u8]) -> (Option<u64>, &[u8]) {
    if data.len() < PES_HEADER_FIXED || data[..3] != [0, 0, 1] {
        return (None, &[]);
    }

    let pts_flag = data[7] & 0x80 != 0;
    let header_data_length = usize::from(data[8]);

    let pts = if pts_flag {
        data.get(PES_HEADER_FIXED..PES_HEADER_FIXED + 5)
            .and_then(|b| <&[u8; 5]>::try_from(b).ok())
            .map(decode_pts)
    } else {
        None
    };

    let start = (PES_HEADER_FIXED + header_data_length).min(data.len());
    (pts, &data[start..])
}

/// Decode the 33-bit timestamp from its 5-byte PES encoding.
///
/// Marker bits are not checked.
pub fn decode_pts(b: &[u8; 5]) -> u64 {
    (u64::from(b[0] >> 1) & 0x07) << 30
        | u64::from(b[1]) << 22
        | (u64::from(b[2]) >> 1) << 15
        | u64::from(b[3]) << 7
        | u64::from(b[4]) >> 1
}

/// Encode a timestamp with the `0010` prefix and marker bits set.
pub fn encode_pts(pts: u64) -> [u8; 5] {
    let pts = pts % PTS_MODULO;
    [
        0x21 | (((pts >> 30) as u8 & 0x07) << 1),
        (pts >> 22) as u8,
        ((pts >> 14) as u8 & 0xFE) | 0x01,
        (pts >> 7) as u8,
        ((pts << 1) as u8) | 0x01,
    ]
}

/// Forward distance from `from` to `to` on the wrapping 33-bit clock.
pub fn pts_delta(from: u64, to: u64) -> u64 {
    to.wrapping_sub(from) % PTS_MODULO
}
