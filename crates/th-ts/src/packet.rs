//! Transport packet parsing and byte-stream synchronization.
//!
//! [`PacketSync`] turns arbitrarily chunked bytes into a sequence of
//! [`TsPacket`]s. A sync byte is only trusted when another sync byte follows
//! exactly one packet later, which rejects 0x47 values inside payload data.

use bytes::{Buf, Bytes, BytesMut};

/// Transport packet size in bytes.
pub const PACKET_SIZE: usize = 188;

/// First byte of every transport packet.
pub const SYNC_BYTE: u8 = 0x47;

/// Largest valid packet identifier (13 bits).
pub const MAX_PID: u16 = 0x1FFF;

/// PID carrying the Program Association Table.
pub const PAT_PID: u16 = 0x0000;

/// A single 188-byte transport packet.
///
/// The raw bytes are kept verbatim so the packet can be written unchanged
/// into an output segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsPacket {
    pid: u16,
    payload_unit_start: bool,
    has_adaptation: bool,
    has_payload: bool,
    continuity_counter: u8,
    payload_offset: usize,
    adaptation_overrun: bool,
    raw: Bytes,
}

impl TsPacket {
    /// Parse a packet from exactly [`PACKET_SIZE`] bytes starting with the
    /// sync byte. Returns `None` for anything else.
    ///
    /// An adaptation field whose declared length runs past the end of the
    /// packet yields a packet with an empty payload rather than an error, so
    /// continuity tracking downstream still sees it.
    pub fn parse(raw: Bytes) -> Option<Self> {
        if raw.len() != PACKET_SIZE || raw[0] != SYNC_BYTE {
            return None;
        }

        let payload_unit_start = raw[1] & 0x40 != 0;
        let pid = (u16::from(raw[1] & 0x1F) << 8) | u16::from(raw[2]);
        let has_adaptation = raw[3] & 0x20 != 0;
        let has_payload = raw[3] & 0x10 != 0;
        let continuity_counter = raw[3] & 0x0F;

        let mut payload_offset = 4;
        let mut adaptation_overrun = false;
        if has_adaptation {
            payload_offset = 5 + usize::from(raw[4]);
            if payload_offset > PACKET_SIZE {
                payload_offset = PACKET_SIZE;
                adaptation_overrun = true;
            }
        }
        if !has_payload {
            payload_offset = PACKET_SIZE;
        }

        Some(Self {
            pid,
            payload_unit_start,
            has_adaptation,
            has_payload,
            continuity_counter,
            payload_offset,
            adaptation_overrun,
            raw,
        })
    }

    /// 13-bit packet identifier.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Payload unit start indicator.
    pub fn payload_unit_start(&self) -> bool {
        self.payload_unit_start
    }

    pub fn has_adaptation(&self) -> bool {
        self.has_adaptation
    }

    pub fn has_payload(&self) -> bool {
        self.has_payload
    }

    /// 4-bit continuity counter.
    pub fn continuity_counter(&self) -> u8 {
        self.continuity_counter
    }

    /// True when the adaptation field length pointed past the packet end.
    pub fn adaptation_overrun(&self) -> bool {
        self.adaptation_overrun
    }

    /// Payload bytes after the header and adaptation field. May be empty.
    pub fn payload(&self) -> &[u8] {
        &self.raw[self.payload_offset..]
    }

    /// The full 188 raw bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Counters kept by [`PacketSync`] for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Packets emitted.
    pub packets: u64,
    /// Bytes thrown away while searching for sync.
    pub dropped_bytes: u64,
    /// Number of times sync had to be re-acquired.
    pub resyncs: u64,
    /// Packets whose adaptation field overran the packet.
    pub adaptation_overruns: u64,
}

/// Byte-stream to packet synchronizer.
///
/// Feed it chunks with [`push`](Self::push); it calls back once per complete
/// packet and keeps any incomplete tail for the next call. It is a plain
/// single-owner value, so one chunk is always fully processed and trimmed
/// before the next one can be pushed.
#[derive(Debug, Default)]
pub struct PacketSync {
    buf: BytesMut,
    synced: bool,
    stats: SyncStats,
}

impl PacketSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Bytes currently held back waiting for more data.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append a chunk and emit every packet that passes the double-sync check.
    pub fn push<F>(&mut self, chunk: &[u8], mut on_packet: F)
    where
        F: FnMut(TsPacket),
    {
        self.buf.extend_from_slice(chunk);

        loop {
            // A packet is only accepted once the byte after it is visible.
            if self.buf.len() <= PACKET_SIZE {
                break;
            }

            if self.buf[0] == SYNC_BYTE && self.buf[PACKET_SIZE] == SYNC_BYTE {
                self.synced = true;
                self.emit_front(&mut on_packet);
                continue;
            }

            match find_sync(&self.buf) {
                Some(offset) => self.discard(offset),
                None => {
                    // Keep just enough to complete a double-sync next time.
                    let keep = PACKET_SIZE;
                    let drop = self.buf.len() - keep;
                    self.discard(drop);
                    break;
                }
            }
        }
    }

    /// Emit a trailing packet that can no longer be double-checked because
    /// the stream has ended. Anything else left over is discarded.
    pub fn finish<F>(&mut self, mut on_packet: F)
    where
        F: FnMut(TsPacket),
    {
        if self.buf.len() >= PACKET_SIZE && self.buf[0] == SYNC_BYTE && self.synced {
            self.emit_front(&mut on_packet);
        }
        if !self.buf.is_empty() {
            self.stats.dropped_bytes += self.buf.len() as u64;
            self.buf.clear();
        }
    }

    fn emit_front<F>(&mut self, on_packet: &mut F)
    where
        F: FnMut(TsPacket),
    {
        let raw = self.buf.split_to(PACKET_SIZE).freeze();
        if let Some(packet) = TsPacket::parse(raw) {
            if packet.adaptation_overrun() {
                self.stats.adaptation_overruns += 1;
                tracing::warn!(
                    pid = packet.pid(),
                    "Adaptation field overruns packet; emitting with empty payload"
                );
            }
            self.stats.packets += 1;
            on_packet(packet);
        }
    }

    fn discard(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        if self.synced {
            self.synced = false;
            self.stats.resyncs += 1;
            tracing::warn!(dropped = count, "Lost transport stream sync; rescanning");
        }
        self.stats.dropped_bytes += count as u64;
        self.buf.advance(count);
    }
}

/// Offset of the first byte that starts a double-synced packet.
fn find_sync(buf: &[u8]) -> Option<usize> {
    if buf.len() <= PACKET_SIZE {
        return None;
    }
    (0..buf.len() - PACKET_SIZE)
        .find(|&i| buf[i] == SYNC_BYTE && buf[i + PACKET_SIZE] == SYNC_BYTE)
}
