//! PSI section reassembly and PAT/PMT table parsing.
//!
//! One [`SectionAssembler`] exists per table kind. Sections may span packets
//! and several sections may share a packet; the assembler copes with both and
//! resynchronizes on garbage instead of failing.

use crate::packet::TsPacket;

pub const TABLE_ID_PAT: u8 = 0x00;
pub const TABLE_ID_PMT: u8 = 0x02;

/// Fixed PAT header bytes through `last_section_number`.
pub const PAT_MIN_SECTION: usize = 8;
/// As above, plus PCR PID and program info length for a PMT.
pub const PMT_MIN_SECTION: usize = 12;

const MAX_SECTION_LENGTH: usize = 1021;
const MAX_BUFFER: usize = 8192;
const MAX_RESYNC_DROPS: u32 = 32;
/// A maximal section spans at most 6 packets, so 8 appends that never
/// complete a section mean the buffer holds garbage.
const MAX_STALLED_APPENDS: u32 = 8;
const STUFFING: u8 = 0xFF;
const CRC_LEN: usize = 4;

/// Reassembles complete sections of one table id from transport packets.
#[derive(Debug)]
pub struct SectionAssembler {
    table_id: u8,
    min_section: usize,
    buf: Vec<u8>,
    last_cc: Option<u8>,
    resync_drops: u32,
    stalled_appends: u32,
}

impl SectionAssembler {
    pub fn new(table_id: u8, min_section: usize) -> Self {
        Self {
            table_id,
            min_section,
            buf: Vec::new(),
            last_cc: None,
            resync_drops: 0,
            stalled_appends: 0,
        }
    }

    pub fn pat() -> Self {
        Self::new(TABLE_ID_PAT, PAT_MIN_SECTION)
    }

    pub fn pmt() -> Self {
        Self::new(TABLE_ID_PMT, PMT_MIN_SECTION)
    }

    /// Bytes currently waiting for the rest of a section.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Forget all state, including the continuity counter.
    pub fn reset(&mut self) {
        self.clear();
        self.last_cc = None;
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.resync_drops = 0;
        self.stalled_appends = 0;
    }

    /// Feed one packet of this table's PID. Every section completed by it is
    /// pushed onto `out`, each exactly `3 + section_length` bytes long.
    pub fn push(&mut self, packet: &TsPacket, out: &mut Vec<Vec<u8>>) {
        if !packet.has_payload() {
            return;
        }

        let cc = packet.continuity_counter();
        if let Some(prev) = self.last_cc {
            if cc != (prev + 1) & 0x0F {
                if !self.buf.is_empty() {
                    tracing::warn!(
                        table_id = self.table_id,
                        expected = (prev + 1) & 0x0F,
                        got = cc,
                        "Continuity break in PSI; dropping partial section"
                    );
                }
                self.clear();
            }
        }
        self.last_cc = Some(cc);

        let payload = packet.payload();
        if payload.is_empty() {
            return;
        }

        let before = out.len();

        if packet.payload_unit_start() {
            let pointer = usize::from(payload[0]);
            let Some(rest) = payload.get(1 + pointer..) else {
                tracing::warn!(
                    table_id = self.table_id,
                    pointer,
                    "Pointer field runs past payload; resetting"
                );
                self.clear();
                return;
            };
            // Bytes before the pointer target finish whatever was pending.
            if !self.buf.is_empty() && pointer > 0 {
                self.buf.extend_from_slice(&payload[1..1 + pointer]);
                self.drain_sections(out);
            }
            self.clear();
            self.buf.extend_from_slice(rest);
        } else if self.buf.is_empty() {
            // Continuation of a section whose start we never saw.
            return;
        } else {
            self.buf.extend_from_slice(payload);
        }

        self.drain_sections(out);

        if out.len() > before || self.buf.is_empty() {
            self.stalled_appends = 0;
        } else {
            self.stalled_appends += 1;
            if self.stalled_appends > MAX_STALLED_APPENDS {
                tracing::warn!(
                    table_id = self.table_id,
                    pending = self.buf.len(),
                    "PSI section never completed; resetting"
                );
                self.clear();
            }
        }
    }

    fn drain_sections(&mut self, out: &mut Vec<Vec<u8>>) {
        loop {
            if self.buf.len() > MAX_BUFFER {
                tracing::warn!(
                    table_id = self.table_id,
                    len = self.buf.len(),
                    "PSI buffer exceeded cap; resetting"
                );
                self.clear();
                return;
            }

            let stuffing = self.buf.iter().take_while(|&&b| b == STUFFING).count();
            if stuffing > 0 {
                self.buf.drain(..stuffing);
            }

            if self.buf.len() < 3 {
                return;
            }

            if self.buf[0] != self.table_id {
                if !self.drop_one("unexpected table id") {
                    return;
                }
                continue;
            }

            let section_length = (usize::from(self.buf[1] & 0x0F) << 8) | usize::from(self.buf[2]);
            if section_length == 0 || section_length > MAX_SECTION_LENGTH {
                if !self.drop_one("bad section length") {
                    return;
                }
                continue;
            }

            let total = 3 + section_length;
            if total < self.min_section {
                if !self.drop_one("section shorter than fixed header") {
                    return;
                }
                continue;
            }

            if self.buf.len() < total {
                return;
            }

            let section: Vec<u8> = self.buf.drain(..total).collect();
            self.resync_drops = 0;
            out.push(section);
        }
    }

    /// Drop the first buffered byte. Returns false when the resync cap was hit
    /// and the whole buffer was discarded instead.
    fn drop_one(&mut self, reason: &'static str) -> bool {
        self.resync_drops += 1;
        if self.resync_drops > MAX_RESYNC_DROPS {
            tracing::warn!(
                table_id = self.table_id,
                reason,
                "PSI resync limit reached; clearing buffer"
            );
            self.clear();
            return false;
        }
        tracing::trace!(table_id = self.table_id, reason, "PSI resync");
        self.buf.remove(0);
        true
    }
}

/// Length of the whole section as declared by its header.
fn declared_len(section: &[u8]) -> Option<usize> {
    if section.len() < 3 {
        return None;
    }
    let len = 3 + ((usize::from(section[1] & 0x0F) << 8) | usize::from(section[2]));
    (len <= section.len()).then_some(len)
}

/// First program in a PAT section with a non-zero program number, as
/// `(program_number, pmt_pid)`. Program 0 is the network PID and is skipped.
pub fn first_program(section: &[u8]) -> Option<(u16, u16)> {
    if section.first() != Some(&TABLE_ID_PAT) {
        return None;
    }
    let total = declared_len(section)?;
    if total < PAT_MIN_SECTION {
        return None;
    }
    let end = total - CRC_LEN;

    section
        .get(PAT_MIN_SECTION..end)?
        .chunks_exact(4)
        .map(|e| {
            let program = u16::from_be_bytes([e[0], e[1]]);
            let pid = (u16::from(e[2] & 0x1F) << 8) | u16::from(e[3]);
            (program, pid)
        })
        .find(|&(program, _)| program != 0)
}

/// One elementary stream entry from a PMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub pid: u16,
}

/// Elementary stream entries of a PMT section, in table order.
pub fn pmt_streams(section: &[u8]) -> Vec<PmtStream> {
    let mut streams = Vec::new();
    if section.first() != Some(&TABLE_ID_PMT) {
        return streams;
    }
    let Some(total) = declared_len(section) else {
        return streams;
    };
    if total < PMT_MIN_SECTION {
        return streams;
    }

    let program_info_length = (usize::from(section[10] & 0x0F) << 8) | usize::from(section[11]);
    let end = total - CRC_LEN;
    let mut i = PMT_MIN_SECTION + program_info_length;

    while i + 5 <= end {
        let stream_type = section[i];
        let pid = (u16::from(section[i + 1] & 0x1F) << 8) | u16::from(section[i + 2]);
        let es_info_length =
            (usize::from(section[i + 3] & 0x0F) << 8) | usize::from(section[i + 4]);
        streams.push(PmtStream { stream_type, pid });
        i += 5 + es_info_length;
    }

    streams
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::packet::{PACKET_SIZE, SYNC_BYTE};
    use bytes::Bytes;

    /// PAT section with one program entry (CRC bytes are not checked).
    pub(crate) fn pat_section(program: u16, pmt_pid: u16) -> Vec<u8> {
        let mut s = vec![TABLE_ID_PAT, 0xB0, 13, 0x00, 0x01, 0xC1, 0x00, 0x00];
        s.extend(program.to_be_bytes());
        s.push(0xE0 | ((pmt_pid >> 8) as u8 & 0x1F));
        s.push(pmt_pid as u8);
        s.extend([0xDE, 0xAD, 0xBE, 0xEF]);
        s
    }

    /// PMT section listing `(stream_type, pid)` entries with no descriptors.
    pub(crate) fn pmt_section(streams: &[(u8, u16)]) -> Vec<u8> {
        let section_length = 9 + streams.len() * 5 + 4;
        let mut s = vec![
            TABLE_ID_PMT,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            section_length as u8,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0xE1,
            0x00,
            0xF0,
            0x00,
        ];
        for &(stream_type, pid) in streams {
            s.push(stream_type);
            s.push(0xE0 | ((pid >> 8) as u8 & 0x1F));
            s.push(pid as u8);
            s.extend([0xF0, 0x00]);
        }
        s.extend([0x01, 0x02, 0x03, 0x04]);
        s
    }

    pub(crate) fn psi_packet(pid: u16, cc: u8, pusi: bool, payload: &[u8]) -> TsPacket {
        let mut p = vec![STUFFING; PACKET_SIZE];
        p[0] = SYNC_BYTE;
        p[1] = ((pid >> 8) as u8 & 0x1F) | if pusi { 0x40 } else { 0 };
        p[2] = pid as u8;
        p[3] = 0x10 | (cc & 0x0F);
        p[4..4 + payload.len()].copy_from_slice(payload);
        TsPacket::parse(Bytes::from(p)).unwrap()
    }

    fn with_pointer(pointer: u8, body: &[u8]) -> Vec<u8> {
        let mut v = vec![pointer];
        v.extend_from_slice(body);
        v
    }

    #[test]
    fn single_packet_section() {
        let section = pat_section(1, 0x20);
        let mut asm = SectionAssembler::pat();
        let mut out = Vec::new();
        asm.push(&psi_packet(0, 0, true, &with_pointer(0, &section)), &mut out);
        assert_eq!(out, vec![section.clone()]);
        assert_eq!(first_program(&out[0]), Some((1, 0x20)));
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn section_split_across_packets_matches_unsplit() {
        let streams: Vec<(u8, u16)> = (0..40).map(|i| (0x1B, 0x100 + i)).collect();
        let section = pmt_section(&streams);
        assert!(section.len() > 184);

        let mut unsplit_out = Vec::new();
        let mut asm = SectionAssembler::pmt();
        let mut big = with_pointer(0, &section);
        big.truncate(184);
        asm.push(&psi_packet(0x20, 0, true, &big), &mut unsplit_out);
        asm.push(&psi_packet(0x20, 1, false, &section[183..]), &mut unsplit_out);
        assert_eq!(unsplit_out, vec![section.clone()]);

        // Second half delivered as the pointer bytes of a new unit start.
        let (head, tail) = section.split_at(183);
        let next = pmt_section(&[(0x02, 0x44)]);
        let mut second = vec![tail.len() as u8];
        second.extend_from_slice(tail);
        second.extend_from_slice(&next);

        let mut out = Vec::new();
        let mut asm = SectionAssembler::pmt();
        asm.push(&psi_packet(0x20, 0, true, &with_pointer(0, head)), &mut out);
        assert!(out.is_empty());
        asm.push(&psi_packet(0x20, 1, true, &second), &mut out);
        assert_eq!(out, vec![section, next]);
    }

    #[test]
    fn skips_pointer_bytes_without_pending_section() {
        let section = pat_section(3, 0x30);
        let mut payload = vec![4, 0xAA, 0xBB, 0xCC, 0xDD];
        payload.extend_from_slice(&section);
        let mut asm = SectionAssembler::pat();
        let mut out = Vec::new();
        asm.push(&psi_packet(0, 0, true, &payload), &mut out);
        assert_eq!(out, vec![section]);
    }

    #[test]
    fn continuity_break_drops_partial_section() {
        let streams: Vec<(u8, u16)> = (0..40).map(|i| (0x0F, 0x200 + i)).collect();
        let section = pmt_section(&streams);
        let mut first = with_pointer(0, &section);
        first.truncate(184);

        let mut asm = SectionAssembler::pmt();
        let mut out = Vec::new();
        asm.push(&psi_packet(0x20, 5, true, &first), &mut out);
        assert!(asm.pending() > 0);
        // cc 7 instead of 6.
        asm.push(&psi_packet(0x20, 7, false, &section[183..]), &mut out);
        assert!(out.is_empty());
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn wrong_table_id_resyncs_within_cap() {
        let section = pat_section(1, 0x20);
        let mut body = vec![0x42, 0x13];
        body.extend_from_slice(&section);
        let mut asm = SectionAssembler::pat();
        let mut out = Vec::new();
        asm.push(&psi_packet(0, 0, true, &with_pointer(0, &body)), &mut out);
        assert_eq!(out, vec![section]);
    }

    #[test]
    fn garbage_beyond_resync_cap_clears_buffer() {
        let mut body = vec![0x77; 64];
        body.extend_from_slice(&pat_section(1, 0x20));
        let mut asm = SectionAssembler::pat();
        let mut out = Vec::new();
        asm.push(&psi_packet(0, 0, true, &with_pointer(0, &body)), &mut out);
        assert!(out.is_empty());
        assert_eq!(asm.pending(), 0);

        // Recovers on the next well-formed unit.
        asm.push(
            &psi_packet(0, 1, true, &with_pointer(0, &pat_section(1, 0x20))),
            &mut out,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn bad_section_length_is_rejected() {
        let mut bad = pat_section(1, 0x20);
        bad[1] = 0xB0 | 0x0F;
        bad[2] = 0xFF;
        let mut asm = SectionAssembler::pat();
        let mut out = Vec::new();
        asm.push(&psi_packet(0, 0, true, &with_pointer(0, &bad)), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn continuation_without_start_is_ignored() {
        let mut asm = SectionAssembler::pat();
        let mut out = Vec::new();
        asm.push(&psi_packet(0, 0, false, &pat_section(1, 0x20)), &mut out);
        assert!(out.is_empty());
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn pat_skips_network_program() {
        let mut s = vec![TABLE_ID_PAT, 0xB0, 17, 0, 1, 0xC1, 0, 0];
        s.extend([0x00, 0x00, 0xE0, 0x10]);
        s.extend([0x00, 0x07, 0xE1, 0x00]);
        s.extend([0, 0, 0, 0]);
        assert_eq!(first_program(&s), Some((7, 0x100)));
    }

    #[test]
    fn pmt_streams_honor_descriptor_lengths() {
        let mut s = pmt_section(&[]);
        // program_info_length = 3
        s[11] = 3;
        s.truncate(12);
        s.extend([0x05, 0x01, 0xAA]);
        s.extend([0x1B, 0xE0, 0x65, 0xF0, 0x02, 0x0A, 0x0B]);
        s.extend([0x0F, 0xE0, 0x66, 0xF0, 0x00]);
        s.extend([0, 0, 0, 0]);
        let len = s.len() - 3;
        s[1] = 0xB0 | ((len >> 8) as u8);
        s[2] = len as u8;

        let streams = pmt_streams(&s);
        assert_eq!(
            streams,
            vec![
                PmtStream { stream_type: 0x1B, pid: 101 },
                PmtStream { stream_type: 0x0F, pid: 102 },
            ]
        );
    }
}
