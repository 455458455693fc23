//! Channel id to source URL lookup.

use std::collections::HashMap;

use async_trait::async_trait;

use th_core::config::ChannelConfig;
use th_core::{ChannelId, Error, Result};

/// Resolves a channel to the URL of its transport stream.
///
/// The session manager only ever reads through this trait; catalogs,
/// tuner discovery and guide data live behind it.
#[async_trait]
pub trait ChannelResolver: Send + Sync {
    async fn resolve(&self, channel: &ChannelId) -> Result<String>;
}

/// A fixed channel table, typically from the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    channels: HashMap<ChannelId, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later duplicates replace earlier entries.
    pub fn from_config(channels: &[ChannelConfig]) -> Self {
        let mut resolver = Self::new();
        for channel in channels {
            resolver.insert(channel.id.clone(), channel.url.clone());
        }
        resolver
    }

    pub fn insert(&mut self, channel: ChannelId, url: impl Into<String>) {
        self.channels.insert(channel, url.into());
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl ChannelResolver for StaticResolver {
    async fn resolve(&self, channel: &ChannelId) -> Result<String> {
        self.channels
            .get(channel)
            .cloned()
            .ok_or_else(|| Error::not_found("channel", channel))
    }
}
