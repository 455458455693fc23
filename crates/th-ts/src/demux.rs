//! Control and timing plane of the demuxer.
//!
//! [`Demuxer`] chains the program map, PES assembler and keyframe detector
//! and reports what it learns as [`DemuxEvent`]s. It never holds on to packet
//! bytes beyond the PES buffers, so the caller remains free to pass the raw
//! packets through unchanged.

use crate::nal::KeyframeDetector;
use crate::packet::TsPacket;
use crate::pes::{PesAssembler, PesUnit};
use crate::program::{ProgramMap, ProgramSelection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    /// A PMT selected a new set of elementary streams.
    ProgramReady(ProgramSelection),
    /// A video PES completed. `keyframe` is only ever set for H.264.
    VideoUnit { pts: Option<u64>, keyframe: bool },
    /// An audio PES completed.
    AudioUnit { pts: Option<u64> },
    /// The packet being pushed starts a new video PES. Emitted last for that
    /// packet, after any unit it completed.
    VideoUnitStart,
}

#[derive(Debug, Default)]
pub struct Demuxer {
    map: ProgramMap,
    pes: PesAssembler,
    keyframes: KeyframeDetector,
    selection: Option<ProgramSelection>,
    units: Vec<PesUnit>,
}

impl Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selection(&self) -> Option<ProgramSelection> {
        self.selection
    }

    pub fn program_map(&self) -> &ProgramMap {
        &self.map
    }

    /// Process one packet and append resulting events to `out`.
    pub fn push(&mut self, packet: &TsPacket, out: &mut Vec<DemuxEvent>) {
        if let Some(selection) = self.map.push(packet) {
            self.pes.clear();
            self.keyframes.reset();
            self.selection = Some(selection);
            out.push(DemuxEvent::ProgramReady(selection));
        }

        let Some(selection) = self.selection else {
            return;
        };
        let pid = packet.pid();
        if !selection.contains(pid) {
            return;
        }

        self.pes.push(packet, &mut self.units);
        self.drain_units(selection, out);

        if pid == selection.video_pid && packet.payload_unit_start() {
            out.push(DemuxEvent::VideoUnitStart);
        }
    }

    /// Complete pending PES units at end of stream.
    pub fn flush(&mut self, out: &mut Vec<DemuxEvent>) {
        if let Some(selection) = self.selection {
            self.pes.flush(&mut self.units);
            self.drain_units(selection, out);
        }
    }

    fn drain_units(&mut self, selection: ProgramSelection, out: &mut Vec<DemuxEvent>) {
        for unit in self.units.drain(..) {
            if unit.pid == selection.video_pid {
                let keyframe = selection.is_h264 && self.keyframes.push(&unit.payload) > 0;
                out.push(DemuxEvent::VideoUnit {
                    pts: unit.pts,
                    keyframe,
                });
            } else {
                out.push(DemuxEvent::AudioUnit { pts: unit.pts });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PACKET_SIZE, SYNC_BYTE};
    use crate::pes::encode_pts;
    use crate::psi::tests::{pat_section, pmt_section, psi_packet};
    use bytes::Bytes;

    fn pes_packet(pid: u16, cc: u8, pts: u64, es: &[u8]) -> TsPacket {
        let mut payload = vec![0, 0, 1, 0xE0, 0, 0, 0x80, 0x80, 5];
        payload.extend(encode_pts(pts));
        payload.extend_from_slice(es);
        let mut p = vec![0xFFu8; PACKET_SIZE];
        p[0] = SYNC_BYTE;
        p[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        p[2] = pid as u8;
        let pad = 184 - payload.len();
        p[3] = 0x30 | cc;
        p[4] = (pad - 1) as u8;
        p[5] = 0;
        p[4 + pad..].copy_from_slice(&payload);
        TsPacket::parse(Bytes::from(p)).unwrap()
    }

    fn ready(demux: &mut Demuxer, streams: &[(u8, u16)]) -> Vec<DemuxEvent> {
        let mut out = Vec::new();
        let mut pat = vec![0];
        pat.extend(pat_section(1, 0x20));
        let mut pmt = vec![0];
        pmt.extend(pmt_section(streams));
        demux.push(&psi_packet(0, 0, true, &pat), &mut out);
        demux.push(&psi_packet(0x20, 0, true, &pmt), &mut out);
        out
    }

    #[test]
    fn reports_program_and_units_in_order() {
        let mut demux = Demuxer::new();
        let out = ready(&mut demux, &[(0x1B, 101), (0x0F, 102)]);
        assert_eq!(
            out,
            vec![DemuxEvent::ProgramReady(ProgramSelection {
                video_pid: 101,
                audio_pid: Some(102),
                is_h264: true,
            })]
        );

        let idr = [0, 0, 0, 1, 0x65, 0x88];
        let slice = [0, 0, 0, 1, 0x41, 0x9A];
        let mut out = Vec::new();
        demux.push(&pes_packet(101, 0, 1000, &idr), &mut out);
        assert_eq!(out, vec![DemuxEvent::VideoUnitStart]);

        out.clear();
        demux.push(&pes_packet(102, 0, 1100, &[0xFF, 0xF1]), &mut out);
        demux.push(&pes_packet(101, 1, 4000, &slice), &mut out);
        assert_eq!(
            out,
            vec![
                DemuxEvent::VideoUnit {
                    pts: Some(1000),
                    keyframe: true
                },
                DemuxEvent::VideoUnitStart,
            ]
        );

        out.clear();
        demux.flush(&mut out);
        assert_eq!(
            out,
            vec![
                DemuxEvent::VideoUnit {
                    pts: Some(4000),
                    keyframe: false
                },
                DemuxEvent::AudioUnit { pts: Some(1100) },
            ]
        );
    }

    #[test]
    fn mpeg2_video_never_reports_keyframes() {
        let mut demux = Demuxer::new();
        ready(&mut demux, &[(0x02, 101)]);
        let mut out = Vec::new();
        demux.push(&pes_packet(101, 0, 0, &[0, 0, 1, 0x65]), &mut out);
        demux.flush(&mut out);
        assert_eq!(
            out.last(),
            Some(&DemuxEvent::VideoUnit {
                pts: Some(0),
                keyframe: false
            })
        );
    }

    #[test]
    fn ignores_streams_before_program_ready() {
        let mut demux = Demuxer::new();
        let mut out = Vec::new();
        demux.push(&pes_packet(101, 0, 0, &[0, 0, 1, 0x65]), &mut out);
        demux.flush(&mut out);
        assert!(out.is_empty());
    }
}
