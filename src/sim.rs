//! Simulated device
//!
//! Answers commands published on `{prefix}/{id}/cmd/{command}` the way a
//! device agent does, so the orchestrator can be exercised without hardware.
//!
//! | command  | reply                                   |
//! |----------|-----------------------------------------|
//! | `deploy` | `ok`, and the device takes the version  |
//! | `status` | `version=<current version>`             |
//! | `reboot` | `ok`                                    |
//! | other    | `error: unsupported command <name>`     |

use crate::error::Result;
use crate::steps::parse_fields;
use crate::transport::TransportChannel;
use fleet_shared::Message;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, warn};

pub struct SimulatedDevice {
    id: String,
    version: Mutex<String>,
    reply_delay: Duration,
    /// Swallow every command without replying
    silent: AtomicBool,
    failing_deploys: AtomicU32,
    received: AtomicU64,
}

impl SimulatedDevice {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: Mutex::new(version.into()),
            reply_delay: Duration::ZERO,
            silent: AtomicBool::new(false),
            failing_deploys: AtomicU32::new(0),
            received: AtomicU64::new(0),
        }
    }

    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Subscribe to this device's command topics and start answering
    pub async fn attach(
        self,
        channel: Arc<dyn TransportChannel>,
        prefix: &str,
    ) -> Result<Arc<Self>> {
        let device = Arc::new(self);
        let reply_topic = format!("{}/{}/reply", prefix, device.id);
        let pattern = format!("{}/{}/cmd/#", prefix, device.id);

        let weak_channel: Weak<dyn TransportChannel> = Arc::downgrade(&channel);
        let responder = device.clone();
        channel
            .subscribe(
                &pattern,
                Arc::new(move |message: Message| {
                    let device = responder.clone();
                    let channel = weak_channel.clone();
                    let reply_topic = reply_topic.clone();
                    tokio::spawn(async move {
                        device.respond(message, channel, reply_topic).await;
                    });
                }),
            )
            .await?;

        debug!("[SIM] {} listening on {}", device.id, pattern);
        Ok(device)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> String {
        self.version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Refuse the next `count` deploy commands
    pub fn fail_next_deploys(&self, count: u32) {
        self.failing_deploys.store(count, Ordering::SeqCst);
    }

    pub fn commands_received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    async fn respond(
        &self,
        message: Message,
        channel: Weak<dyn TransportChannel>,
        reply_topic: String,
    ) {
        self.received.fetch_add(1, Ordering::SeqCst);
        if self.silent.load(Ordering::SeqCst) {
            debug!("[SIM] {} ignoring {}", self.id, message.topic);
            return;
        }
        if !self.reply_delay.is_zero() {
            tokio::time::sleep(self.reply_delay).await;
        }

        let command = message.topic.rsplit('/').next().unwrap_or_default();
        let payload = self.execute(command, &message.text());

        let Some(channel) = channel.upgrade() else {
            return;
        };
        let reply = message.reply(reply_topic, payload).from_sender(self.id.clone());
        if let Err(e) = channel.publish(reply).await {
            warn!("[SIM] {} could not reply to {}: {}", self.id, command, e);
        }
    }

    fn execute(&self, command: &str, payload: &str) -> String {
        match command {
            "deploy" => {
                let refused = self
                    .failing_deploys
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if refused {
                    return "error: flash write failed".into();
                }
                let fields = parse_fields(payload);
                match fields.get("version") {
                    Some(version) => {
                        *self.version.lock().unwrap_or_else(PoisonError::into_inner) =
                            version.clone();
                        "ok".into()
                    }
                    None => "error: missing version".into(),
                }
            }
            "status" => format!("version={}", self.version()),
            "reboot" => "ok".into(),
            other => format!("error: unsupported command {}", other),
        }
    }
}
