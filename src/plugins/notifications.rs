//! `nots` plugin: display notifications forwarded from the paired phone,
//! optionally carrying a raw PNG icon sent as the next framed record.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::AppContext;
use crate::channel::Channel;
use crate::device::Device;
use crate::error::HandlerOutcome;
use crate::plugin::Plugin;
use crate::rpc::Request;

fn default_icon_path() -> PathBuf {
    PathBuf::from("/tmp/dc-icon.png")
}

fn default_cmd() -> String {
    "notify-send -i '{icon}' '{title}' '{text}'".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_icon_path")]
    pub icon_path: PathBuf,
    #[serde(default = "default_cmd")]
    pub cmd: String,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            icon_path: default_icon_path(),
            cmd: default_cmd(),
        }
    }
}

pub struct NotificationsPlugin {
    config: NotificationsConfig,
}

impl NotificationsPlugin {
    pub fn new(context: &AppContext, device: &Device) -> Self {
        Self {
            config: super::load_config(context, "nots", device),
        }
    }

    fn handle_notification(&self, channel: &mut Channel, request: &Request) -> HandlerOutcome {
        if request.params.get("event").and_then(Value::as_str) != Some("posted") {
            return HandlerOutcome::Continue(None);
        }
        let text = request.params.get("text").and_then(Value::as_str).unwrap_or("");
        let title = request.params.get("title").and_then(Value::as_str).unwrap_or("NULL");
        if request
            .params
            .get("packageIcon")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            match channel.read_frame() {
                Ok(Some(icon_data)) => {
                    if let Err(e) = std::fs::write(&self.config.icon_path, &icon_data) {
                        log::warn!("failed to write notification icon: {}", e);
                    }
                }
                Ok(None) => return HandlerOutcome::Kill("connection closed awaiting icon".to_string()),
                Err(e) => return HandlerOutcome::Kill(format!("transport break awaiting icon: {}", e)),
            }
        }
        let command = self
            .config
            .cmd
            .replace("{icon}", &self.config.icon_path.display().to_string())
            .replace("{title}", title)
            .replace("{text}", text);
        log::debug!("execute: \"{}\"", command);
        if let Err(e) = std::process::Command::new("sh").arg("-c").arg(&command).status() {
            log::warn!("notification command failed: {}", e);
        }
        HandlerOutcome::Continue(None)
    }
}

impl Plugin for NotificationsPlugin {
    fn mark(&self) -> &'static str {
        "nots"
    }

    fn handle(&mut self, channel: &mut Channel, request: &Request) -> HandlerOutcome {
        match request.method.as_str() {
            "notification" => self.handle_notification(channel, request),
            other => HandlerOutcome::Abort(format!("unknown method \"{}\"", other)),
        }
    }
}
