//! Shared test harness for integration tests.
//!
//! Provides [`TsBuilder`] for synthesizing transport streams (PAT, PMT, PES
//! with PTS, H.264 Annex-B payloads) and [`TestServer`], which starts a
//! [`ProxyServer`] on a random loopback port with a resolver that counts
//! lookups.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use th_core::config::Config;
use th_core::{ChannelId, Error, Result};
use th_server::{ChannelResolver, ProxyServer, SessionManager};
use th_ts::pes::encode_pts;
use th_ts::PACKET_SIZE;

pub const PMT_PID: u16 = 0x20;
pub const VIDEO_PID: u16 = 0x100;
pub const AUDIO_PID: u16 = 0x101;

pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_MPEG2_VIDEO: u8 = 0x02;
pub const STREAM_TYPE_AAC: u8 = 0x0F;

/// 25 fps at 90 kHz.
pub const FRAME_TICKS: u64 = 3_600;

pub fn channel(s: &str) -> ChannelId {
    ChannelId::parse(s).unwrap()
}

// ---------------------------------------------------------------------------
// Transport stream synthesis
// ---------------------------------------------------------------------------

/// Builds a transport stream packet by packet with correct continuity
/// counters.
#[derive(Default)]
pub struct TsBuilder {
    out: Vec<u8>,
    cc: HashMap<u16, u8>,
}

impl TsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// One packet; payloads shorter than 184 bytes are padded with
    /// adaptation-field stuffing.
    pub fn packet(&mut self, pid: u16, pusi: bool, payload: &[u8]) -> &mut Self {
        assert!(payload.len() <= 184);
        let cc = self.cc.entry(pid).or_insert(0);
        let counter = *cc;
        *cc = (*cc + 1) & 0x0F;

        let mut p = vec![0xFFu8; PACKET_SIZE];
        p[0] = 0x47;
        p[1] = ((pid >> 8) as u8 & 0x1F) | if pusi { 0x40 } else { 0 };
        p[2] = pid as u8;
        let pad = 184 - payload.len();
        if pad == 0 {
            p[3] = 0x10 | counter;
        } else {
            p[3] = 0x30 | counter;
            p[4] = (pad - 1) as u8;
            if pad > 1 {
                p[5] = 0;
            }
        }
        p[4 + pad..].copy_from_slice(payload);
        self.out.extend(p);
        self
    }

    fn section(&mut self, pid: u16, section: &[u8]) -> &mut Self {
        let mut payload = vec![0];
        payload.extend_from_slice(section);
        self.packet(pid, true, &payload)
    }

    pub fn pat(&mut self, program: u16, pmt_pid: u16) -> &mut Self {
        let section = [
            0x00,
            0xB0,
            13,
            0,
            1,
            0xC1,
            0,
            0,
            (program >> 8) as u8,
            program as u8,
            0xE0 | (pmt_pid >> 8) as u8,
            pmt_pid as u8,
            0,
            0,
            0,
            0,
        ];
        self.section(0, &section)
    }

    pub fn pmt(&mut self, pmt_pid: u16, streams: &[(u8, u16)]) -> &mut Self {
        let pcr_pid = streams.first().map(|s| s.1).unwrap_or(0x1FFF);
        let section_length = 9 + 5 * streams.len() + 4;
        let mut section = vec![
            0x02,
            0xB0,
            section_length as u8,
            0,
            1,
            0xC1,
            0,
            0,
            0xE0 | (pcr_pid >> 8) as u8,
            pcr_pid as u8,
            0xF0,
            0,
        ];
        for &(stream_type, pid) in streams {
            section.extend([stream_type, 0xE0 | (pid >> 8) as u8, pid as u8, 0xF0, 0]);
        }
        section.extend([0, 0, 0, 0]);
        self.section(pmt_pid, &section)
    }

    /// PAT and PMT for an H.264 + AAC program.
    pub fn h264_program(&mut self) -> &mut Self {
        self.pat(1, PMT_PID).pmt(
            PMT_PID,
            &[(STREAM_TYPE_H264, VIDEO_PID), (STREAM_TYPE_AAC, AUDIO_PID)],
        )
    }

    /// One PES packet split across as many transport packets as needed.
    pub fn pes(&mut self, pid: u16, stream_id: u8, pts: Option<u64>, es: &[u8]) -> &mut Self {
        let mut data = vec![0, 0, 1, stream_id, 0, 0, 0x80];
        match pts {
            Some(pts) => {
                data.extend([0x80, 5]);
                data.extend(encode_pts(pts));
            }
            None => data.extend([0, 0]),
        }
        data.extend_from_slice(es);

        for (i, chunk) in data.chunks(184).enumerate() {
            self.packet(pid, i == 0, chunk);
        }
        self
    }

    /// An H.264 access unit: an IDR slice or a non-IDR slice plus filler.
    pub fn video_frame(&mut self, pts: u64, idr: bool, size: usize) -> &mut Self {
        let mut es = vec![0, 0, 0, 1, 0x09, 0xF0];
        es.extend([0, 0, 0, 1, if idr { 0x65 } else { 0x41 }, 0x88]);
        es.resize(es.len() + size, 0xAB);
        self.pes(VIDEO_PID, 0xE0, Some(pts), &es)
    }

    pub fn audio_frame(&mut self, pts: u64) -> &mut Self {
        self.pes(AUDIO_PID, 0xC0, Some(pts), &[0xFF, 0xF1, 0x50, 0x80, 0x02, 0x1F, 0xFC])
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn build(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

/// An H.264 + AAC stream of `frames` frames at 25 fps, one IDR every `gop`
/// frames starting at `first_pts`.
pub fn h264_stream(frames: u64, gop: u64, first_pts: u64) -> Vec<u8> {
    let mut ts = TsBuilder::new();
    ts.h264_program();
    for i in 0..frames {
        let pts = first_pts + i * FRAME_TICKS;
        ts.video_frame(pts, i % gop == 0, 400);
        if i % 2 == 0 {
            ts.audio_frame(pts);
        }
    }
    ts.build()
}

pub fn write_stream(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

// ---------------------------------------------------------------------------
// Resolver and server
// ---------------------------------------------------------------------------

/// Resolver backed by a mutable table that counts every lookup.
#[derive(Default)]
pub struct CountingResolver {
    channels: Mutex<HashMap<ChannelId, String>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn insert(&self, id: &str, url: impl Into<String>) {
        self.channels.lock().insert(channel(id), url.into());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelResolver for CountingResolver {
    async fn resolve(&self, id: &ChannelId) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.channels
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("channel", id))
    }
}

/// Config with a private work dir and short timings for tests.
pub fn test_config(work_dir: &Path) -> Config {
    let mut config = Config::default();
    config.session.work_dir = Some(work_dir.to_path_buf());
    config.session.playlist_wait_ms = 3_000;
    config.hls.target_duration_secs = 1.0;
    config.hls.window_size = 3;
    config
}

/// A proxy running on a random loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub sessions: Arc<SessionManager>,
    pub resolver: Arc<CountingResolver>,
    pub work_dir: tempfile::TempDir,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start(resolver: CountingResolver) -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let resolver = Arc::new(resolver);
        let config = test_config(work_dir.path());
        let sessions = Arc::new(SessionManager::new(resolver.clone(), &config));

        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), sessions.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));

        Self {
            addr,
            sessions,
            resolver,
            work_dir,
            cancel,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Send raw bytes and return the whole response as text.
    pub async fn raw(&self, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
        self.sessions.stop_all().await;
    }
}
