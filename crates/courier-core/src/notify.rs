//! Out-of-band campaign notifications
//!
//! Events are queued on a bounded channel and delivered by a background
//! relay. A full queue or a failed delivery is logged and dropped; the
//! dispatch path never waits on notifications.

use anyhow::Result;
use async_trait::async_trait;
use courier_common::config::TelegramConfig;
use courier_common::types::{Availability, CampaignId, ProfileId};
use courier_storage::CampaignCounters;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Campaign and profile events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    CampaignStarted {
        campaign_id: CampaignId,
        name: String,
        run: i32,
    },
    CampaignCompleted {
        campaign_id: CampaignId,
        name: String,
        counters: CampaignCounters,
    },
    CampaignError {
        campaign_id: CampaignId,
        name: String,
        reason: String,
    },
    Progress {
        campaign_id: CampaignId,
        name: String,
        percent: u8,
    },
    ProfileIssue {
        profile_id: ProfileId,
        availability: Availability,
    },
    LoginRequired {
        profile_id: ProfileId,
    },
}

impl Notification {
    /// Human-readable text for chat delivery
    pub fn render(&self) -> String {
        match self {
            Notification::CampaignStarted { name, run, .. } => {
                format!("Campaign \"{}\" started (run {})", name, run)
            }
            Notification::CampaignCompleted { name, counters, .. } => format!(
                "Campaign \"{}\" completed: {} sent, {} failed, {} skipped",
                name, counters.sent, counters.failed, counters.skipped
            ),
            Notification::CampaignError { name, reason, .. } => {
                format!("Campaign \"{}\" stopped: {}", name, reason)
            }
            Notification::Progress { name, percent, .. } => {
                format!("Campaign \"{}\" is {}% done", name, percent)
            }
            Notification::ProfileIssue {
                profile_id,
                availability,
            } => format!("Profile {} is {}", profile_id, availability),
            Notification::LoginRequired { profile_id } => {
                format!("Profile {} needs to log in again", profile_id)
            }
        }
    }
}

/// Fire-and-forget handle for emitting notifications
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::Sender<Notification>>,
}

impl Notifier {
    /// Notifier that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Notifier with a bounded queue, returning the receiving end for the relay
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    pub fn notify(&self, notification: Notification) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(notification) {
            warn!("Dropping notification: {}", e);
        }
    }
}

/// Delivery backend for notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Telegram Bot API sink
pub struct TelegramRelay {
    http_client: Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    chat_id: &'a str,
    text: String,
}

impl TelegramRelay {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let http_client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            http_client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
        })
    }
}

#[async_trait]
impl NotificationSink for TelegramRelay {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let response = self
            .http_client
            .post(url)
            .json(&SendMessageBody {
                chat_id: &self.chat_id,
                text: notification.render(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Telegram returned status {}",
                response.status()
            ));
        }
        Ok(())
    }
}

/// Drain the notification queue into `sink` until cancelled
pub fn spawn_relay(
    mut rx: mpsc::Receiver<Notification>,
    sink: Arc<dyn NotificationSink>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Notification relay started");
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(n) => n,
                    None => break,
                },
            };
            match sink.deliver(&notification).await {
                Ok(()) => debug!("Notification delivered"),
                Err(e) => warn!("Failed to deliver notification: {}", e),
            }
        }
        info!("Notification relay stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationSink for Recorder {
        async fn deliver(&self, notification: &Notification) -> Result<()> {
            self.seen.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    #[test]
    fn test_full_queue_drops() {
        let (notifier, mut rx) = Notifier::channel(1);
        let profile_id = Uuid::new_v4();
        notifier.notify(Notification::LoginRequired { profile_id });
        notifier.notify(Notification::LoginRequired { profile_id });
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // Disabled notifier is a no-op
        Notifier::disabled().notify(Notification::LoginRequired { profile_id });
    }

    #[test]
    fn test_render() {
        let text = Notification::Progress {
            campaign_id: Uuid::new_v4(),
            name: "spring".to_string(),
            percent: 75,
        }
        .render();
        assert_eq!(text, "Campaign \"spring\" is 75% done");
    }

    #[tokio::test]
    async fn test_relay_drains_queue() {
        let (notifier, rx) = Notifier::channel(8);
        let sink = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let handle = spawn_relay(rx, sink.clone(), cancel.clone());

        let profile_id = Uuid::new_v4();
        notifier.notify(Notification::ProfileIssue {
            profile_id,
            availability: Availability::Unhealthy,
        });
        drop(notifier);
        handle.await.unwrap();

        assert_eq!(sink.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_telegram_relay() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(serde_json::json!({ "chat_id": "-100" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let relay = TelegramRelay::new(&TelegramConfig {
            bot_token: "123:abc".to_string(),
            chat_id: "-100".to_string(),
            api_url: server.uri(),
        })
        .unwrap();

        relay
            .deliver(&Notification::LoginRequired {
                profile_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_telegram_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let relay = TelegramRelay::new(&TelegramConfig {
            bot_token: "t".to_string(),
            chat_id: "1".to_string(),
            api_url: server.uri(),
        })
        .unwrap();
        assert!(relay
            .deliver(&Notification::LoginRequired {
                profile_id: Uuid::new_v4(),
            })
            .await
            .is_err());
    }
}
