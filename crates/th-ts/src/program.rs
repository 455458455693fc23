//! Program selection from the PAT and PMT.

use crate::packet::{TsPacket, PAT_PID};
use crate::psi::{first_program, pmt_streams, SectionAssembler};

pub const STREAM_TYPE_MPEG2_VIDEO: u8 = 0x02;
pub const STREAM_TYPE_MPEG_AUDIO: u8 = 0x03;
pub const STREAM_TYPE_AAC: u8 = 0x0F;
pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_AC3: u8 = 0x81;

/// Elementary streams chosen for segmenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSelection {
    pub video_pid: u16,
    pub audio_pid: Option<u16>,
    /// Video is H.264, so keyframes can be detected.
    pub is_h264: bool,
}

impl ProgramSelection {
    /// Whether packets on `pid` carry selected video or audio.
    pub fn contains(&self, pid: u16) -> bool {
        pid == self.video_pid || self.audio_pid == Some(pid)
    }
}

/// Where the program map is in its search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    SearchingPat,
    SearchingPmt { pmt_pid: u16 },
    Ready(ProgramSelection),
}

/// Tracks the PAT and PMT of the first program in a stream.
///
/// [`push`](Self::push) returns the selection whenever a PMT produces one
/// that differs from the current one, so callers see exactly one event per
/// distinct selection.
#[derive(Debug)]
pub struct ProgramMap {
    pat: SectionAssembler,
    pmt: SectionAssembler,
    pmt_pid: Option<u16>,
    selection: Option<ProgramSelection>,
    sections: Vec<Vec<u8>>,
}

impl Default for ProgramMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramMap {
    pub fn new() -> Self {
        Self {
            pat: SectionAssembler::pat(),
            pmt: SectionAssembler::pmt(),
            pmt_pid: None,
            selection: None,
            sections: Vec::new(),
        }
    }

    pub fn state(&self) -> ProgramState {
        match (self.selection, self.pmt_pid) {
            (Some(selection), _) => ProgramState::Ready(selection),
            (None, Some(pmt_pid)) => ProgramState::SearchingPmt { pmt_pid },
            (None, None) => ProgramState::SearchingPat,
        }
    }

    pub fn selection(&self) -> Option<ProgramSelection> {
        self.selection
    }

    pub fn pmt_pid(&self) -> Option<u16> {
        self.pmt_pid
    }

    /// Feed one packet. Packets on other PIDs are ignored cheaply.
    pub fn push(&mut self, packet: &TsPacket) -> Option<ProgramSelection> {
        let pid = packet.pid();
        if pid == PAT_PID {
            self.pat.push(packet, &mut self.sections);
            for section in std::mem::take(&mut self.sections) {
                self.on_pat(&section);
            }
            None
        } else if Some(pid) == self.pmt_pid {
            self.pmt.push(packet, &mut self.sections);
            let mut changed = None;
            for section in std::mem::take(&mut self.sections) {
                if let Some(selection) = self.on_pmt(&section) {
                    changed = Some(selection);
                }
            }
            changed
        } else {
            None
        }
    }

    fn on_pat(&mut self, section: &[u8]) {
        let Some((program, pmt_pid)) = first_program(section) else {
            return;
        };
        if self.pmt_pid == Some(pmt_pid) {
            return;
        }
        tracing::debug!(program, pmt_pid, "PAT selected program");
        self.pmt_pid = Some(pmt_pid);
        self.pmt.reset();
    }

    fn on_pmt(&mut self, section: &[u8]) -> Option<ProgramSelection> {
        let streams = pmt_streams(section);

        let video = streams
            .iter()
            .find(|s| matches!(s.stream_type, STREAM_TYPE_H264 | STREAM_TYPE_MPEG2_VIDEO))?;
        let audio = streams.iter().find(|s| {
            matches!(
                s.stream_type,
                STREAM_TYPE_AAC | STREAM_TYPE_MPEG_AUDIO | STREAM_TYPE_AC3
            )
        });

        let selection = ProgramSelection {
            video_pid: video.pid,
            audio_pid: audio.map(|a| a.pid),
            is_h264: video.stream_type == STREAM_TYPE_H264,
        };

        if self.selection == Some(selection) {
            return None;
        }

        tracing::info!(
            video_pid = selection.video_pid,
            audio_pid = ?selection.audio_pid,
            is_h264 = selection.is_h264,
            "Program ready"
        );
        self.selection = Some(selection);
        Some(selection)
    }
}
