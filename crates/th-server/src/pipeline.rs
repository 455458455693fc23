//! One channel's demux and segment pipeline.
//!
//! The reader task hands chunks to a single consumer task over a bounded
//! channel. The consumer owns every piece of parser and segmenter state, so
//! packets are processed strictly in order with no locking.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use th_core::config::{HlsConfig, SourceConfig};
use th_core::ChannelId;
use th_hls::{SegmentInfo, Segmenter, PLAYLIST_NAME};
use th_ts::{DemuxEvent, Demuxer, PacketSync, ProgramSelection, TsPacket};

use crate::reader::{spawn_reader, Source, SourceEvent};

/// Chunks buffered between the reader and the consumer.
const CHUNK_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Running,
    /// The source closed normally.
    Ended,
    /// The source could not be opened or read.
    Failed(String),
    /// Stopped by its owner.
    Stopped,
}

/// Counters published by the consumer after every chunk.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub state: PipelineState,
    pub bytes: u64,
    pub packets: u64,
    pub resyncs: u64,
    pub selection: Option<ProgramSelection>,
    pub keyframes: u64,
    pub segments: u64,
    pub failed_writes: u64,
    /// Bytes dropped because no video clock could place them in a segment.
    pub discarded_bytes: u64,
}

/// The synchronous part of a pipeline: bytes in, segment files out.
pub struct PipelineCore {
    sync: PacketSync,
    demux: Demuxer,
    segmenter: Segmenter,
    events: Vec<DemuxEvent>,
    stats: PipelineStats,
}

impl PipelineCore {
    pub fn new(dir: impl Into<PathBuf>, hls: &HlsConfig) -> Self {
        Self {
            sync: PacketSync::new(),
            demux: Demuxer::new(),
            segmenter: Segmenter::new(dir, hls),
            events: Vec::new(),
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    /// Feed one chunk of source bytes.
    pub fn process_chunk(&mut self, chunk: &[u8]) {
        self.stats.bytes += chunk.len() as u64;
        let Self {
            sync,
            demux,
            segmenter,
            events,
            stats,
        } = self;
        sync.push(chunk, |packet| {
            handle_packet(demux, segmenter, events, stats, &packet);
        });
        self.stats.resyncs = self.sync.stats().resyncs;
        self.stats.discarded_bytes = self.segmenter.discarded_bytes();
    }

    /// Drain what is left at end of stream and flush the last segment.
    pub fn finish(&mut self) {
        let Self {
            sync,
            demux,
            segmenter,
            events,
            stats,
        } = self;
        sync.finish(|packet| {
            handle_packet(demux, segmenter, events, stats, &packet);
        });

        demux.flush(events);
        for event in events.drain(..) {
            apply_event(segmenter, stats, event);
        }

        record_write(stats, segmenter.finish());
    }
}

fn handle_packet(
    demux: &mut Demuxer,
    segmenter: &mut Segmenter,
    events: &mut Vec<DemuxEvent>,
    stats: &mut PipelineStats,
    packet: &TsPacket,
) {
    stats.packets += 1;
    demux.push(packet, events);
    for event in events.drain(..) {
        apply_event(segmenter, stats, event);
    }
    record_write(stats, segmenter.push_packet(packet.raw()));
}

fn record_write(stats: &mut PipelineStats, result: th_core::Result<Option<SegmentInfo>>) {
    match result {
        Ok(Some(_)) => stats.segments += 1,
        Ok(None) => {}
        Err(_) => stats.failed_writes += 1,
    }
}

fn apply_event(segmenter: &mut Segmenter, stats: &mut PipelineStats, event: DemuxEvent) {
    match event {
        DemuxEvent::ProgramReady(selection) => {
            segmenter.set_keyframes_available(selection.is_h264);
            stats.selection = Some(selection);
        }
        DemuxEvent::VideoUnitStart => segmenter.mark_video_unit_start(),
        DemuxEvent::VideoUnit { pts, keyframe } => {
            if keyframe {
                stats.keyframes += 1;
            }
            record_write(stats, segmenter.on_video_unit(pts, keyframe));
        }
        DemuxEvent::AudioUnit { .. } => {}
    }
}

/// A running pipeline for one channel.
pub struct Pipeline {
    channel: ChannelId,
    dir: PathBuf,
    cancel: CancellationToken,
    stats: Arc<Mutex<PipelineStats>>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Pipeline {
    /// Spawn the reader and consumer tasks. Segments and the playlist are
    /// written into `dir`, which must already exist.
    pub fn start(
        channel: ChannelId,
        source: Source,
        dir: impl Into<PathBuf>,
        hls: &HlsConfig,
        source_config: &SourceConfig,
    ) -> Self {
        let dir = dir.into();
        let cancel = CancellationToken::new();
        let stats = Arc::new(Mutex::new(PipelineStats::default()));
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);

        tracing::info!(channel = %channel, source = %source.describe(), "Starting pipeline");

        let reader = spawn_reader(source, source_config.clone(), tx, cancel.clone());
        let core = PipelineCore::new(&dir, hls);
        let consumer = tokio::spawn(consume(
            channel.clone(),
            core,
            rx,
            cancel.clone(),
            stats.clone(),
        ));

        Self {
            channel,
            dir,
            cancel,
            stats,
            tasks: Mutex::new(Some((reader, consumer))),
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join(PLAYLIST_NAME)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().clone()
    }

    pub fn state(&self) -> PipelineState {
        self.stats.lock().state.clone()
    }

    /// Stop both tasks and wait for the final segment flush. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = self.tasks.lock().take();
        let Some((reader, consumer)) = tasks else {
            return;
        };
        if let Err(e) = consumer.await {
            tracing::error!(channel = %self.channel, "Pipeline consumer panicked: {e}");
        }
        let _ = reader.await;
        tracing::info!(channel = %self.channel, "Pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn consume(
    channel: ChannelId,
    mut core: PipelineCore,
    mut rx: mpsc::Receiver<SourceEvent>,
    cancel: CancellationToken,
    shared: Arc<Mutex<PipelineStats>>,
) {
    let state = loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PipelineState::Stopped,
            event = rx.recv() => event,
        };

        match event {
            Some(SourceEvent::Chunk(chunk)) => {
                core.process_chunk(&chunk);
                *shared.lock() = core.stats().clone();
            }
            Some(SourceEvent::Ended) | None => {
                tracing::info!(channel = %channel, "Source ended");
                break PipelineState::Ended;
            }
            Some(SourceEvent::Failed(e)) => {
                tracing::error!(channel = %channel, "Source failed: {e}");
                break PipelineState::Failed(e.to_string());
            }
        }
    };

    core.finish();
    let mut stats = core.stats().clone();
    stats.state = state;
    tracing::debug!(
        channel = %channel,
        packets = stats.packets,
        segments = stats.segments,
        failed_writes = stats.failed_writes,
        "Pipeline finished"
    );
    *shared.lock() = stats;
}
