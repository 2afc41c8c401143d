//! Notification dispatch
//!
//! One send per (alert x channel). Channels are addressed by stable ID;
//! legacy rules that stored type strings still resolve, but to at most
//! one channel per type. Transport internals are opaque; only the
//! dispatch contract (sent / transient failure / permanent failure)
//! leaks out.

mod channels;

pub use channels::{ChannelConfig, ChannelTransport, HttpTransport};

#[cfg(test)]
pub(crate) use channels::test_support;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::database::{AlertInstance, ChannelRecord, ChannelRef};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Worth retrying with backoff.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Misconfigured channel; retrying cannot help.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

/// Rendered message, shared across channel types; per-type formatting
/// happens inside the transport.
#[derive(Debug, Clone, Serialize)]
pub struct AlertMessage {
    pub title: String,
    pub body: String,
    pub severity: String,
    pub entity: Option<String>,
    /// Mobile-action link carrying a one-time token, when applicable.
    pub action_url: Option<String>,
}

impl AlertMessage {
    pub fn from_alert(alert: &AlertInstance, action_url: Option<String>) -> Self {
        Self {
            title: format!("[{}] {}", alert.severity, alert.kind),
            body: alert.message.clone(),
            severity: alert.severity.clone(),
            entity: alert.entity_key.clone(),
            action_url,
        }
    }
}

/// Lookup maps built from the channel table.
///
/// The ID map holds every channel; the type map keeps only the first
/// channel of each type, which is all the legacy addressing scheme can
/// express.
pub struct ChannelIndex {
    by_id: HashMap<i64, ChannelRecord>,
    by_type: HashMap<String, i64>,
}

impl ChannelIndex {
    pub fn build(channels: Vec<ChannelRecord>) -> Self {
        let mut by_id = HashMap::new();
        let mut by_type = HashMap::new();
        for channel in channels {
            by_type.entry(channel.channel_type.clone()).or_insert(channel.id);
            by_id.insert(channel.id, channel);
        }
        Self { by_id, by_type }
    }

    pub fn resolve(&self, reference: &ChannelRef) -> Option<&ChannelRecord> {
        match reference {
            ChannelRef::Id(id) => self.by_id.get(id),
            ChannelRef::Type(channel_type) => self
                .by_type
                .get(channel_type)
                .and_then(|id| self.by_id.get(id)),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Dispatcher over a pluggable transport (HTTP in production, a recorder
/// in tests).
pub struct Dispatcher {
    transport: Arc<dyn ChannelTransport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self { transport }
    }

    pub fn http() -> Self {
        Self::new(Arc::new(HttpTransport::new()))
    }

    /// Send one message to one resolved channel.
    pub async fn send(
        &self,
        channel: &ChannelRecord,
        message: &AlertMessage,
    ) -> Result<(), DispatchError> {
        if !channel.enabled {
            debug!(channel = channel.id, "skipping disabled channel");
            return Ok(());
        }

        let config = ChannelConfig::parse(&channel.channel_type, &channel.config)
            .map_err(DispatchError::Permanent)?;

        self.transport.deliver(&config, message).await
    }

    /// Send to every channel a rule references. Returns per-channel
    /// outcomes; the caller folds them into the alert's retry state.
    pub async fn send_all(
        &self,
        index: &ChannelIndex,
        references: &[ChannelRef],
        message: &AlertMessage,
    ) -> Vec<(ChannelRef, Result<(), DispatchError>)> {
        let mut results = Vec::with_capacity(references.len());
        for reference in references {
            let result = match index.resolve(reference) {
                Some(channel) => self.send(channel, message).await,
                None => {
                    warn!(?reference, "rule references unknown channel");
                    Err(DispatchError::UnknownChannel(format!("{reference:?}")))
                }
            };
            results.push((reference.clone(), result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::channels::test_support::RecordingTransport;
    use serde_json::json;

    fn channel(id: i64, channel_type: &str, url: &str) -> ChannelRecord {
        ChannelRecord {
            id,
            name: format!("chan-{id}"),
            channel_type: channel_type.to_string(),
            config: json!({"webhook_url": url}),
            enabled: true,
        }
    }

    fn message() -> AlertMessage {
        AlertMessage {
            title: "[warning] container_stopped".into(),
            body: "web stopped".into(),
            severity: "warning".into(),
            entity: Some("h1:abc123def456".into()),
            action_url: None,
        }
    }

    #[test]
    fn test_id_index_preserves_duplicate_types() {
        let index = ChannelIndex::build(vec![
            channel(1, "discord", "A"),
            channel(2, "discord", "B"),
        ]);
        assert_eq!(index.len(), 2);
        assert_eq!(
            index.resolve(&ChannelRef::Id(2)).unwrap().config["webhook_url"],
            "B"
        );
    }

    #[test]
    fn test_type_index_collapses_to_one() {
        let index = ChannelIndex::build(vec![
            channel(1, "discord", "A"),
            channel(2, "discord", "B"),
        ]);
        // Legacy addressing yields exactly one channel per type.
        assert_eq!(
            index
                .resolve(&ChannelRef::Type("discord".into()))
                .unwrap()
                .id,
            1
        );
    }

    #[tokio::test]
    async fn test_multi_channel_sends_one_post_each() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(transport.clone());
        let index = ChannelIndex::build(vec![
            channel(1, "discord", "https://discord.example/A"),
            channel(2, "discord", "https://discord.example/B"),
        ]);

        let results = dispatcher
            .send_all(
                &index,
                &[ChannelRef::Id(1), ChannelRef::Id(2)],
                &message(),
            )
            .await;

        assert!(results.iter().all(|(_, r)| r.is_ok()));
        let delivered = transport.deliveries();
        assert_eq!(delivered.len(), 2);
        assert!(delivered.contains(&"https://discord.example/A".to_string()));
        assert!(delivered.contains(&"https://discord.example/B".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_channel_reported() {
        let dispatcher = Dispatcher::new(Arc::new(RecordingTransport::default()));
        let index = ChannelIndex::build(vec![]);

        let results = dispatcher
            .send_all(&index, &[ChannelRef::Id(42)], &message())
            .await;
        assert!(matches!(
            results[0].1,
            Err(DispatchError::UnknownChannel(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_channel_skipped() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(transport.clone());
        let mut disabled = channel(1, "discord", "https://discord.example/A");
        disabled.enabled = false;

        dispatcher.send(&disabled, &message()).await.unwrap();
        assert!(transport.deliveries().is_empty());
    }
}
