//! Channel config variants and the HTTP transport

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AlertMessage, DispatchError};

/// Typed view of a channel's opaque config blob, keyed by the channel
/// `type` column.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelConfig {
    Discord { webhook_url: String },
    Slack { webhook_url: String },
    Telegram { bot_token: String, chat_id: String },
    Pushover { token: String, user_key: String },
    Webhook { url: String },
}

impl ChannelConfig {
    pub fn parse(channel_type: &str, config: &Value) -> Result<Self, String> {
        let field = |name: &str| -> Result<String, String> {
            config
                .get(name)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| format!("channel config missing {name:?}"))
        };

        match channel_type {
            "discord" => Ok(ChannelConfig::Discord {
                webhook_url: field("webhook_url")?,
            }),
            "slack" => Ok(ChannelConfig::Slack {
                webhook_url: field("webhook_url")?,
            }),
            "telegram" => Ok(ChannelConfig::Telegram {
                bot_token: field("bot_token")?,
                chat_id: field("chat_id")?,
            }),
            "pushover" => Ok(ChannelConfig::Pushover {
                token: field("token")?,
                user_key: field("user_key")?,
            }),
            "webhook" => Ok(ChannelConfig::Webhook { url: field("url")? }),
            other => Err(format!("unknown channel type {other:?}")),
        }
    }

    /// Destination URL and request body for this channel type.
    pub fn render(&self, message: &AlertMessage) -> (String, Value) {
        match self {
            ChannelConfig::Discord { webhook_url } => {
                let mut content = format!("**{}**\n{}", message.title, message.body);
                if let Some(url) = &message.action_url {
                    content.push_str(&format!("\n{url}"));
                }
                (webhook_url.clone(), json!({ "content": content }))
            }
            ChannelConfig::Slack { webhook_url } => (
                webhook_url.clone(),
                json!({ "text": format!("*{}*\n{}", message.title, message.body) }),
            ),
            ChannelConfig::Telegram { bot_token, chat_id } => (
                format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
                json!({
                    "chat_id": chat_id,
                    "text": format!("{}\n{}", message.title, message.body),
                }),
            ),
            ChannelConfig::Pushover { token, user_key } => (
                "https://api.pushover.net/1/messages.json".to_string(),
                json!({
                    "token": token,
                    "user": user_key,
                    "title": message.title,
                    "message": message.body,
                    "url": message.action_url,
                }),
            ),
            ChannelConfig::Webhook { url } => (
                url.clone(),
                serde_json::to_value(message).unwrap_or(Value::Null),
            ),
        }
    }
}

/// Transport seam; tests record instead of POSTing.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn deliver(
        &self,
        config: &ChannelConfig,
        message: &AlertMessage,
    ) -> Result<(), DispatchError>;
}

/// Production transport: one POST per delivery.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .expect("reqwest client builds"),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelTransport for HttpTransport {
    async fn deliver(
        &self,
        config: &ChannelConfig,
        message: &AlertMessage,
    ) -> Result<(), DispatchError> {
        let (url, body) = config.render(message);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(DispatchError::Transient(format!("HTTP {status} from {url}")))
        } else {
            Err(DispatchError::Permanent(format!("HTTP {status} from {url}")))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Records destination URLs instead of delivering.
    #[derive(Default)]
    pub struct RecordingTransport {
        delivered: Mutex<Vec<String>>,
        pub fail_with: Mutex<Option<String>>,
    }

    impl RecordingTransport {
        pub fn deliveries(&self) -> Vec<String> {
            self.delivered.lock().clone()
        }
    }

    #[async_trait]
    impl ChannelTransport for RecordingTransport {
        async fn deliver(
            &self,
            config: &ChannelConfig,
            message: &AlertMessage,
        ) -> Result<(), DispatchError> {
            if let Some(kind) = self.fail_with.lock().clone() {
                return match kind.as_str() {
                    "permanent" => Err(DispatchError::Permanent("configured failure".into())),
                    _ => Err(DispatchError::Transient("configured failure".into())),
                };
            }
            let (url, _) = config.render(message);
            self.delivered.lock().push(url);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> AlertMessage {
        AlertMessage {
            title: "[critical] host_offline".into(),
            body: "host-one unreachable".into(),
            severity: "critical".into(),
            entity: None,
            action_url: Some("https://dockmon.example/a/t".into()),
        }
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let err = ChannelConfig::parse("discord", &json!({})).unwrap_err();
        assert!(err.contains("webhook_url"));

        let err = ChannelConfig::parse("telegram", &json!({"bot_token": "x"})).unwrap_err();
        assert!(err.contains("chat_id"));
    }

    #[test]
    fn test_parse_unknown_type() {
        assert!(ChannelConfig::parse("carrier-pigeon", &json!({})).is_err());
    }

    #[test]
    fn test_discord_render_includes_action_url() {
        let config =
            ChannelConfig::parse("discord", &json!({"webhook_url": "https://d/hook"})).unwrap();
        let (url, body) = config.render(&message());
        assert_eq!(url, "https://d/hook");
        let content = body["content"].as_str().unwrap();
        assert!(content.contains("host-one unreachable"));
        assert!(content.contains("https://dockmon.example/a/t"));
    }

    #[test]
    fn test_telegram_renders_api_url() {
        let config = ChannelConfig::parse(
            "telegram",
            &json!({"bot_token": "T", "chat_id": "42"}),
        )
        .unwrap();
        let (url, body) = config.render(&message());
        assert_eq!(url, "https://api.telegram.org/botT/sendMessage");
        assert_eq!(body["chat_id"], "42");
    }
}
