//! Motion notifications.
//!
//! Dispatchers are best-effort: the worker pool logs their errors and moves on.

use std::fmt::Display;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rumqttc::v5::{mqttbytes::QoS, Client, MqttOptions};
use rumqttc::Transport;
use serde::Serialize;

use crate::config::MqttSettings;
use crate::supervisor::{interruptible_sleep, ReconnectPolicy};

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTTS_PORT: u16 = 8883;

fn mqtt_backoff() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay_secs: 1.0,
        max_delay_secs: 30.0,
        ..ReconnectPolicy::default()
    }
}

pub trait NotificationDispatcher: Send + Sync {
    /// `clip` is a short derivative video of the event, when one was made.
    fn notify(&self, camera_name: &str, timestamp: DateTime<Utc>, clip: Option<&Path>) -> Result<()>;
}

/// Writes alerts to the log only.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl NotificationDispatcher for LogNotifier {
    fn notify(&self, camera_name: &str, timestamp: DateTime<Utc>, clip: Option<&Path>) -> Result<()> {
        match clip {
            Some(path) => log::info!(
                "motion on {} at {} (clip {})",
                camera_name,
                timestamp.to_rfc3339(),
                path.display()
            ),
            None => log::info!("motion on {} at {}", camera_name, timestamp.to_rfc3339()),
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct MotionAlert<'a> {
    pub camera: &'a str,
    pub timestamp: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_path: Option<String>,
}

impl<'a> MotionAlert<'a> {
    pub fn new(camera: &'a str, timestamp: DateTime<Utc>, clip: Option<&Path>) -> Self {
        let local = timestamp.with_timezone(&chrono::Local);
        Self {
            camera,
            timestamp: timestamp.to_rfc3339(),
            message: format!(
                "Motion detected on {} at {}",
                camera,
                local.format("%Y-%m-%d %H:%M:%S")
            ),
            clip_path: clip.map(|p| p.display().to_string()),
        }
    }
}

/// Topic segment for a camera name: lowercase, MQTT wildcards and separators replaced.
pub fn topic_segment(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    if cleaned.is_empty() {
        "camera".to_string()
    } else {
        cleaned
    }
}

// ----------------------------------------------------------------------------
// MQTT
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
struct MqttEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

fn parse_broker(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    let default_port = if use_tls { DEFAULT_MQTTS_PORT } else { DEFAULT_MQTT_PORT };
    let (host, port) = match remainder.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().context("invalid MQTT port")?),
        None => (remainder, default_port),
    };
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

/// Publishes alert JSON to `<prefix>/<camera>/motion` and, when a clip is
/// attached, its bytes to `<prefix>/<camera>/clip`.
pub struct MqttNotifier {
    client: Client,
    topic_prefix: String,
    stopping: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttNotifier {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_broker(&settings.broker)?;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        let (client, mut connection) = Client::new(options, 10);
        let stopping = Arc::new(AtomicBool::new(false));
        let thread_stopping = stopping.clone();
        let handle = std::thread::Builder::new()
            .name("mqtt-notifier".to_string())
            .spawn(move || {
                drive_events(connection.iter(), &thread_stopping, &mqtt_backoff());
            })
            .context("spawn MQTT connection thread")?;
        log::info!(
            "mqtt notifier: {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            topic_prefix: settings.topic_prefix.trim_end_matches('/').to_string(),
            stopping,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn motion_topic(&self, camera_name: &str) -> String {
        format!("{}/{}/motion", self.topic_prefix, topic_segment(camera_name))
    }

    /// Stops the connection thread. Until then it reconnects after every error.
    pub fn disconnect(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        let handle = self
            .connection_handle
            .lock()
            .map_err(|_| anyhow!("mqtt handle lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl NotificationDispatcher for MqttNotifier {
    fn notify(&self, camera_name: &str, timestamp: DateTime<Utc>, clip: Option<&Path>) -> Result<()> {
        let alert = MotionAlert::new(camera_name, timestamp, clip);
        let payload = serde_json::to_vec(&alert)?;
        self.client
            .publish(self.motion_topic(camera_name), QoS::AtLeastOnce, false, payload)?;
        if let Some(path) = clip {
            let bytes = std::fs::read(path)
                .with_context(|| format!("read clip {}", path.display()))?;
            let topic = format!("{}/{}/clip", self.topic_prefix, topic_segment(camera_name));
            self.client.publish(topic, QoS::AtLeastOnce, false, bytes)?;
        }
        Ok(())
    }
}

/// Polls the MQTT event loop until `stopping` is set. Each poll after an
/// error makes rumqttc reconnect, so errors only pause the loop for a backoff
/// delay. Returns how many errors were seen.
fn drive_events<I, T, E>(events: I, stopping: &AtomicBool, backoff: &ReconnectPolicy) -> u32
where
    I: IntoIterator<Item = std::result::Result<T, E>>,
    E: Display,
{
    let mut failures = 0u32;
    let mut errors = 0u32;
    for event in events {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        match event {
            Ok(_) => failures = 0,
            Err(e) => {
                failures = failures.saturating_add(1);
                errors += 1;
                let delay = backoff.delay_for(failures);
                log::warn!("MQTT connection error: {} (retrying in {:?})", e, delay);
                if !interruptible_sleep(delay, stopping) {
                    break;
                }
            }
        }
    }
    errors
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Captures every notification, optionally failing each call.
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        pub calls: Arc<Mutex<Vec<(String, Option<PathBuf>)>>>,
        pub fail: bool,
    }

    impl NotificationDispatcher for RecordingNotifier {
        fn notify(&self, camera_name: &str, _timestamp: DateTime<Utc>, clip: Option<&Path>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((camera_name.to_string(), clip.map(Path::to_path_buf)));
            if self.fail {
                return Err(anyhow!("notifier offline"));
            }
            Ok(())
        }
    }
}
