//! Source byte streams.
//!
//! A reader task opens the source and forwards raw chunks over a bounded
//! channel to the pipeline's single consumer. HTTP(S) sources stream through
//! reqwest; `file://` URLs and bare paths read from disk.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use th_core::config::SourceConfig;
use th_core::{Error, Result};

/// Where a channel's transport stream comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Http(String),
    File(PathBuf),
}

impl Source {
    /// Classify a source URL. Unknown schemes are rejected.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(Error::Validation("source URL is empty".into()));
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(Source::Http(url.to_owned()));
        }
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(Source::File(PathBuf::from(path)));
        }
        if url.contains("://") {
            return Err(Error::Validation(format!("unsupported source scheme: {url}")));
        }
        Ok(Source::File(PathBuf::from(url)))
    }

    pub fn describe(&self) -> String {
        match self {
            Source::Http(url) => url.clone(),
            Source::File(path) => path.display().to_string(),
        }
    }
}

/// What the reader task reports to the consumer.
#[derive(Debug)]
pub enum SourceEvent {
    Chunk(Bytes),
    /// The source closed normally.
    Ended,
    /// Opening or reading failed; no more events follow.
    Failed(Error),
}

/// Open a source as a stream of byte chunks.
pub async fn open(source: &Source, config: &SourceConfig) -> Result<BoxStream<'static, Result<Bytes>>> {
    match source {
        Source::Http(url) => {
            let client = reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
                .user_agent(config.user_agent.clone())
                .build()
                .map_err(|e| Error::upstream(url, e))?;

            let response = client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| Error::upstream(url, e))?;

            tracing::debug!(url = %url, status = %response.status(), "Source connected");

            let url = url.clone();
            Ok(response
                .bytes_stream()
                .map(move |chunk| chunk.map_err(|e| Error::upstream(&url, e)))
                .boxed())
        }
        Source::File(path) => {
            let file = tokio::fs::File::open(path).await.map_err(|e| {
                Error::upstream(path.display().to_string(), e)
            })?;
            Ok(ReaderStream::new(file)
                .map(|chunk| chunk.map_err(Error::from))
                .boxed())
        }
    }
}

/// Spawn the task that reads `source` until it ends, fails, or `cancel`
/// fires. Events go to `tx`; a closed receiver also stops the task.
pub fn spawn_reader(
    source: Source,
    config: SourceConfig,
    tx: mpsc::Sender<SourceEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = open(&source, &config) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.send(SourceEvent::Failed(e)).await;
                return;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };

            let event = match next {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => SourceEvent::Chunk(chunk),
                Some(Err(e)) => SourceEvent::Failed(e),
                None => SourceEvent::Ended,
            };
            let last = !matches!(event, SourceEvent::Chunk(_));

            if tx.send(event).await.is_err() || last {
                return;
            }
        }
    })
}
