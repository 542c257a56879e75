//! Typed notification events, category filtering and transports.
//!
//! Transports (Pushover and a JSON webhook) are best effort: delivery
//! failures are logged and never affect the action that emitted the event.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Mutex;

use crate::config::Settings;

const DETECT_FLUSH_INTERVAL_SECONDS: i64 = 60;
const TRANSPORT_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Update,
    Restart,
    Recreate,
    Health,
    Startup,
    Detect,
    Prune,
}

impl EventCategory {
    pub const ALL: [EventCategory; 7] = [
        EventCategory::Update,
        EventCategory::Restart,
        EventCategory::Recreate,
        EventCategory::Health,
        EventCategory::Startup,
        EventCategory::Detect,
        EventCategory::Prune,
    ];
}

impl AsRef<str> for EventCategory {
    fn as_ref(&self) -> &str {
        match self {
            Self::Update => "update",
            Self::Restart => "restart",
            Self::Recreate => "recreate",
            Self::Health => "health",
            Self::Startup => "startup",
            Self::Detect => "detect",
            Self::Prune => "prune",
        }
    }
}

impl FromStr for EventCategory {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "update" => Ok(Self::Update),
            "restart" => Ok(Self::Restart),
            "recreate" => Ok(Self::Recreate),
            "health" | "health_check" => Ok(Self::Health),
            "startup" => Ok(Self::Startup),
            "detect" => Ok(Self::Detect),
            "prune" => Ok(Self::Prune),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub category: EventCategory,
    pub title: String,
    pub message: String,
}

/// Shortened display form of an image id or digest.
pub fn short_id(identifier: &str) -> &str {
    let tail = identifier.rsplit(':').next().unwrap_or(identifier);
    &tail[..tail.len().min(12)]
}

#[derive(Debug, Default)]
struct DetectBatch {
    names: Vec<String>,
    last_flush_ts: Option<i64>,
}

#[cfg_attr(test, allow(dead_code))]
struct PushoverTarget {
    token: String,
    user: String,
    api: String,
}

pub struct Notifier {
    enabled: HashSet<EventCategory>,
    hostname: String,
    pushover: Option<PushoverTarget>,
    webhook_url: Option<String>,
    client: reqwest::Client,
    detect: Mutex<DetectBatch>,
    #[cfg(test)]
    pub captured: Mutex<Vec<Event>>,
}

impl Notifier {
    pub fn new(settings: &Settings) -> Self {
        let pushover = match (&settings.pushover_token, &settings.pushover_user) {
            (Some(token), Some(user)) => Some(PushoverTarget {
                token: token.clone(),
                user: user.clone(),
                api: settings.pushover_api.clone(),
            }),
            _ => None,
        };
        Self {
            enabled: settings.notifications.clone(),
            hostname: settings.hostname.clone(),
            pushover,
            webhook_url: settings.webhook_url.clone(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(TRANSPORT_TIMEOUT_SECONDS))
                .build()
                .unwrap_or_default(),
            detect: Mutex::new(DetectBatch::default()),
            #[cfg(test)]
            captured: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self, category: EventCategory) -> bool {
        self.enabled.contains(&category)
    }

    /// Emit an event if its category is enabled. The title identifies the
    /// subject, the message carries details; the host name is appended so
    /// multi-host deployments stay tellable apart.
    pub async fn emit(&self, category: EventCategory, title: String, message: String) {
        if !self.is_enabled(category) {
            log::debug!("Notification {} suppressed: {title}", category.as_ref());
            return;
        }
        let event = Event {
            category,
            title: format!("{title} (guerite on {})", self.hostname),
            message,
        };
        log::info!("Notify [{}] {}: {}", category.as_ref(), event.title, event.message);
        #[cfg(test)]
        self.captured.lock().unwrap().push(event);
        #[cfg(not(test))]
        self.send(&event).await;
    }

    /// Queue a newly detected monitored container for the batched detect
    /// notification.
    pub fn push_detected(&self, name: &str) {
        let mut batch = self.detect.lock().expect("poisoned detect batch lock");
        batch.names.push(name.to_string());
    }

    /// Flush the detect batch, at most once per minute. Flushing an empty
    /// batch emits nothing.
    pub async fn flush_detect(&self, now_ts: i64) {
        let message = {
            let mut batch = self.detect.lock().expect("poisoned detect batch lock");
            if batch.names.is_empty() {
                return;
            }
            if let Some(last) = batch.last_flush_ts {
                if now_ts - last < DETECT_FLUSH_INTERVAL_SECONDS {
                    return;
                }
            }
            batch.last_flush_ts = Some(now_ts);
            let mut names = std::mem::take(&mut batch.names);
            names.sort();
            names.dedup();
            format!("Now monitoring: {}", names.join(", "))
        };
        self.emit(
            EventCategory::Detect,
            "New containers detected".to_string(),
            message,
        )
        .await;
    }

    #[cfg_attr(test, allow(dead_code))]
    async fn send(&self, event: &Event) {
        if let Some(pushover) = &self.pushover {
            let form = [
                ("token", pushover.token.as_str()),
                ("user", pushover.user.as_str()),
                ("title", event.title.as_str()),
                ("message", event.message.as_str()),
            ];
            match self.client.post(&pushover.api).form(&form).send().await {
                Ok(response) if !response.status().is_success() => {
                    log::warn!("Pushover returned {}", response.status());
                }
                Ok(_) => {}
                Err(e) => log::warn!("Failed to send Pushover notification: {e}"),
            }
        }
        if let Some(url) = &self.webhook_url {
            let payload = serde_json::json!({
                "title": event.title,
                "message": event.message,
            });
            match self.client.post(url).json(&payload).send().await {
                Ok(response) if !response.status().is_success() => {
                    log::warn!("Webhook returned {}", response.status());
                }
                Ok(_) => {}
                Err(e) => log::warn!("Failed to send webhook notification: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier_with(categories: &[EventCategory]) -> Notifier {
        let mut settings = crate::config::Settings::try_init().unwrap();
        settings.notifications = categories.iter().copied().collect();
        settings.hostname = "testhost".to_string();
        Notifier::new(&settings)
    }

    #[tokio::test]
    async fn test_emit_respects_category_filter() {
        let notifier = notifier_with(&[EventCategory::Update]);
        notifier
            .emit(EventCategory::Update, "web updated".into(), "ok".into())
            .await;
        notifier
            .emit(EventCategory::Restart, "web restarted".into(), "ok".into())
            .await;
        let captured = notifier.captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].category, EventCategory::Update);
        assert!(captured[0].title.contains("web updated"));
        assert!(captured[0].title.contains("testhost"));
    }

    #[tokio::test]
    async fn test_detect_batch_flushes_at_most_once_per_minute() {
        let notifier = notifier_with(&[EventCategory::Detect]);
        notifier.push_detected("web");
        notifier.push_detected("db");
        notifier.flush_detect(1000).await;
        assert_eq!(notifier.captured.lock().unwrap().len(), 1);

        // New names arrive within the same minute: held back.
        notifier.push_detected("cache");
        notifier.flush_detect(1030).await;
        assert_eq!(notifier.captured.lock().unwrap().len(), 1);

        // A minute later the held names go out in one batch.
        notifier.flush_detect(1060).await;
        let captured = notifier.captured.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert!(captured[1].message.contains("cache"));
    }

    #[tokio::test]
    async fn test_flush_of_empty_batch_emits_nothing() {
        let notifier = notifier_with(&[EventCategory::Detect]);
        notifier.flush_detect(1000).await;
        assert!(notifier.captured.lock().unwrap().is_empty());
    }

    #[test]
    fn test_short_id_strips_digest_prefix_and_truncates() {
        assert_eq!(short_id("sha256:0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
