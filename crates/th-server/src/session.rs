//! Per-channel session tracking.
//!
//! A session owns one [`Pipeline`] and its private working directory. The
//! first request for a channel creates it; idle sessions are swept on a
//! timer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use th_core::config::{Config, HlsConfig, SessionConfig, SourceConfig};
use th_core::{ChannelId, Result};

use crate::pipeline::{Pipeline, PipelineState, PipelineStats};
use crate::reader::Source;
use crate::resolver::ChannelResolver;

/// How often `ensure` checks for the first playlist.
const PLAYLIST_POLL: Duration = Duration::from_millis(100);

/// One channel being repackaged.
pub struct Session {
    channel: ChannelId,
    source_url: String,
    dir: PathBuf,
    pipeline: Pipeline,
    created_at: DateTime<Utc>,
    last_access: Mutex<Instant>,
}

impl Session {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.pipeline.playlist_path()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    /// Stop the pipeline and delete the working directory.
    async fn shutdown(&self) {
        self.pipeline.stop().await;
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                channel = %self.channel,
                "Failed to remove {}: {e}",
                self.dir.display()
            ),
        }
        tracing::info!(
            channel = %self.channel,
            lifetime_secs = (Utc::now() - self.created_at).num_seconds(),
            "Session closed"
        );
    }
}

/// Result of [`SessionManager::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredPlaylist {
    pub path: PathBuf,
    /// The playlist file exists.
    pub ready: bool,
}

type SessionSlot = Arc<OnceCell<Arc<Session>>>;

/// Owns every session, keyed by channel.
///
/// Each map slot is a once-cell, so concurrent first requests for the same
/// channel share one construction.
pub struct SessionManager {
    sessions: DashMap<ChannelId, SessionSlot>,
    resolver: Arc<dyn ChannelResolver>,
    root: PathBuf,
    session: SessionConfig,
    hls: HlsConfig,
    source: SourceConfig,
}

impl SessionManager {
    pub fn new(resolver: Arc<dyn ChannelResolver>, config: &Config) -> Self {
        Self {
            sessions: DashMap::new(),
            resolver,
            root: config.session.work_dir(),
            session: config.session.clone(),
            hls: config.hls.clone(),
            source: config.source.clone(),
        }
    }

    /// Parent directory of all session directories.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get or start the session for `channel` and report its playlist.
    ///
    /// An existing session returns at once. A new one waits, bounded by the
    /// configured playlist wait, for the first playlist write. A session
    /// whose source failed is replaced.
    pub async fn ensure(&self, channel: &ChannelId) -> Result<EnsuredPlaylist> {
        let slot = self.slot(channel);
        if let Some(session) = slot.get() {
            if !matches!(session.pipeline.state(), PipelineState::Failed(_)) {
                session.touch();
                let path = session.playlist_path();
                let ready = tokio::fs::try_exists(&path).await.unwrap_or(false);
                return Ok(EnsuredPlaylist { path, ready });
            }
            tracing::info!(channel = %channel, "Replacing failed session");
            self.remove_if_same(channel, &slot).await;
        }

        let slot = self.slot(channel);
        let session = match slot.get_or_try_init(|| self.create(channel)).await {
            Ok(session) => session.clone(),
            Err(e) => {
                self.sessions
                    .remove_if(channel, |_, s| Arc::ptr_eq(s, &slot) && !s.initialized());
                return Err(e);
            }
        };

        // A stop that ran while the slot was still starting removed it from
        // the map without seeing the session; nobody else will clean it up.
        let still_listed = self
            .sessions
            .get(channel)
            .is_some_and(|s| Arc::ptr_eq(s.value(), &slot));
        let path = session.playlist_path();
        if !still_listed {
            tracing::info!(channel = %channel, "Session stopped while starting");
            session.shutdown().await;
            return Ok(EnsuredPlaylist { path, ready: false });
        }
        session.touch();

        let deadline = Instant::now() + self.session.playlist_wait();
        loop {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(EnsuredPlaylist { path, ready: true });
            }
            if Instant::now() >= deadline
                || matches!(session.pipeline.state(), PipelineState::Failed(_))
            {
                return Ok(EnsuredPlaylist { path, ready: false });
            }
            tokio::time::sleep(PLAYLIST_POLL).await;
        }
    }

    /// Path of a segment file in an existing session. Returns `None` for an
    /// unknown channel or a name that is not a plain `.ts` file name.
    pub fn segment_path(&self, channel: &ChannelId, file_name: &str) -> Option<PathBuf> {
        if !is_segment_file_name(file_name) {
            return None;
        }
        let session = self.get(channel)?;
        session.touch();
        Some(session.dir.join(file_name))
    }

    /// The running session for `channel`, if any. Does not refresh access.
    pub fn get(&self, channel: &ChannelId) -> Option<Arc<Session>> {
        self.sessions
            .get(channel)
            .and_then(|slot| slot.get().cloned())
    }

    /// Stop one session. Returns false if none existed.
    pub async fn stop(&self, channel: &ChannelId) -> bool {
        let Some((_, slot)) = self.sessions.remove(channel) else {
            return false;
        };
        match slot.get() {
            Some(session) => {
                session.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Stop every session.
    pub async fn stop_all(&self) {
        let channels: Vec<ChannelId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let stops = channels.iter().map(|channel| self.stop(channel));
        let stopped = futures::future::join_all(stops).await;
        let count = stopped.into_iter().filter(|s| *s).count();
        if count > 0 {
            tracing::info!(count, "Stopped all sessions");
        }
    }

    /// Stop sessions idle longer than the configured timeout.
    pub async fn sweep_idle(&self) -> usize {
        self.sweep_idle_after(self.session.idle_timeout()).await
    }

    /// Stop sessions idle longer than `idle`. Returns how many were stopped.
    pub async fn sweep_idle_after(&self, idle: Duration) -> usize {
        let mut expired = Vec::new();
        self.sessions.retain(|channel, slot| match slot.get() {
            Some(session) if session.idle_for() > idle => {
                tracing::info!(
                    channel = %channel,
                    idle_secs = session.idle_for().as_secs(),
                    "Idle session expired"
                );
                expired.push(session.clone());
                false
            }
            _ => true,
        });

        let count = expired.len();
        futures::future::join_all(expired.iter().map(|s| s.shutdown())).await;
        if count > 0 {
            tracing::debug!(removed = count, "Swept idle sessions");
        }
        count
    }

    /// Run [`sweep_idle`](Self::sweep_idle) on the configured interval until
    /// `cancel` fires.
    pub fn start_sweeper(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.session.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.sweep_idle().await;
                    }
                }
            }
        })
    }

    /// Number of channels with a live or starting session.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn slot(&self, channel: &ChannelId) -> SessionSlot {
        self.sessions.entry(channel.clone()).or_default().clone()
    }

    async fn remove_if_same(&self, channel: &ChannelId, slot: &SessionSlot) {
        let removed = self
            .sessions
            .remove_if(channel, |_, s| Arc::ptr_eq(s, slot));
        if let Some((_, slot)) = removed {
            if let Some(session) = slot.get() {
                session.shutdown().await;
            }
        }
    }

    async fn create(&self, channel: &ChannelId) -> Result<Arc<Session>> {
        let source_url = self.resolver.resolve(channel).await?;
        let source = Source::parse(&source_url)?;

        let dir = self
            .root
            .join(format!("{}-{}", channel, Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await?;

        let pipeline = Pipeline::start(channel.clone(), source, &dir, &self.hls, &self.source);
        tracing::info!(channel = %channel, dir = %dir.display(), "Session created");

        Ok(Arc::new(Session {
            channel: channel.clone(),
            source_url,
            dir,
            pipeline,
            created_at: Utc::now(),
            last_access: Mutex::new(Instant::now()),
        }))
    }
}

/// A bare `.ts` file name with no path components.
pub fn is_segment_file_name(name: &str) -> bool {
    name.len() > 3
        && name.len() <= 255
        && name.ends_with(".ts")
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && !name.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;

    fn id(s: &str) -> ChannelId {
        ChannelId::parse(s).unwrap()
    }

    fn manager(root: &Path, channels: &[(&str, String)]) -> SessionManager {
        let mut resolver = StaticResolver::new();
        for (channel, url) in channels {
            resolver.insert(id(channel), url.clone());
        }
        let mut config = Config::default();
        config.session.work_dir = Some(root.to_path_buf());
        config.session.playlist_wait_ms = 200;
        SessionManager::new(Arc::new(resolver), &config)
    }

    #[test]
    fn segment_file_names() {
        assert!(is_segment_file_name("segment00001.ts"));
        assert!(!is_segment_file_name(".ts"));
        assert!(!is_segment_file_name("../index.ts"));
        assert!(!is_segment_file_name("a/b.ts"));
        assert!(!is_segment_file_name("index.m3u8"));
        assert!(!is_segment_file_name(".hidden.ts"));
        assert!(!is_segment_file_name("seg%2F.ts"));
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found_and_leaves_no_slot() {
        let root = tempfile::tempdir().unwrap();
        let sessions = manager(root.path(), &[]);
        let err = sessions.ensure(&id("nope")).await.unwrap_err();
        assert_eq!(err.http_status(), 404);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn segment_path_requires_session() {
        let root = tempfile::tempdir().unwrap();
        let sessions = manager(root.path(), &[]);
        assert_eq!(sessions.segment_path(&id("chan"), "segment00001.ts"), None);
    }

    #[tokio::test]
    async fn failed_source_is_not_ready_and_stop_removes_dir() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("missing.ts").display().to_string();
        let sessions = manager(root.path(), &[("chan", missing)]);

        let ensured = sessions.ensure(&id("chan")).await.unwrap();
        assert!(!ensured.ready);

        let session = sessions.get(&id("chan")).unwrap();
        let dir = session.dir().to_path_buf();
        assert!(dir.starts_with(root.path()));
        assert!(dir.exists());
        assert!(sessions
            .segment_path(&id("chan"), "segment00001.ts")
            .unwrap()
            .starts_with(&dir));

        assert!(sessions.stop(&id("chan")).await);
        assert!(!dir.exists());
        assert!(!sessions.stop(&id("chan")).await);
    }

    #[tokio::test]
    async fn sweep_honors_idle_threshold() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("missing.ts").display().to_string();
        let sessions = manager(
            root.path(),
            &[("old", missing.clone()), ("fresh", missing)],
        );
        sessions.ensure(&id("old")).await.unwrap();
        sessions.ensure(&id("fresh")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        sessions.get(&id("fresh")).unwrap().touch();
        let old_dir = sessions.get(&id("old")).unwrap().dir().to_path_buf();

        let removed = sessions.sweep_idle_after(Duration::from_millis(200)).await;
        assert_eq!(removed, 1);
        assert!(sessions.get(&id("old")).is_none());
        assert!(sessions.get(&id("fresh")).is_some());
        assert!(!old_dir.exists());

        sessions.stop_all().await;
        assert!(sessions.is_empty());
    }
}
