//! `open` plugin: receive-then-open a file, or open a URL, via configured
//! shell command templates (`xdg-open` by default).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::AppContext;
use crate::channel::Channel;
use crate::device::Device;
use crate::error::HandlerOutcome;
use crate::plugin::Plugin;
use crate::rpc::{Request, Response};
use crate::transfer;

fn default_file_download_directory() -> PathBuf {
    PathBuf::from("/tmp/dcnnt/to_open")
}

fn default_file_cmd() -> String {
    "xdg-open \"{path}\"".to_string()
}

fn default_link_cmd() -> String {
    "xdg-open \"{url}\"".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOpenConfig {
    #[serde(default = "default_file_download_directory")]
    pub download_directory: PathBuf,
    #[serde(default = "default_file_cmd")]
    pub default_cmd: String,
}

impl Default for FileOpenConfig {
    fn default() -> Self {
        Self {
            download_directory: default_file_download_directory(),
            default_cmd: default_file_cmd(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkOpenConfig {
    #[serde(default = "default_link_cmd")]
    pub default_cmd: String,
}

impl Default for LinkOpenConfig {
    fn default() -> Self {
        Self {
            default_cmd: default_link_cmd(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OpenerConfig {
    #[serde(default)]
    pub file: FileOpenConfig,
    #[serde(default)]
    pub link: LinkOpenConfig,
}

pub struct OpenerPlugin {
    file: FileOpenConfig,
    link: LinkOpenConfig,
}

impl OpenerPlugin {
    pub fn new(context: &AppContext, device: &Device) -> Self {
        let config: OpenerConfig = super::load_config(context, "open", device);
        std::fs::create_dir_all(&config.file.download_directory).ok();
        Self {
            file: config.file,
            link: config.link,
        }
    }

    fn handle_open_file(&self, channel: &mut Channel, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("open_file is not a notification".to_string());
        };
        match transfer::receive_to_path(channel, id, &request.params, &self.file.download_directory) {
            Ok(path) => {
                let command = self.file.default_cmd.replace("{path}", &path.display().to_string());
                log::debug!("execute: \"{}\"", command);
                if let Err(e) = std::process::Command::new("sh").arg("-c").arg(&command).status() {
                    log::warn!("open_file command failed: {}", e);
                }
                HandlerOutcome::Continue(None)
            }
            Err(outcome) => outcome,
        }
    }

    fn handle_open_link(&self, channel: &mut Channel, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("open_link is not a notification".to_string());
        };
        let Some(link) = request.params.get("link").and_then(Value::as_str) else {
            return HandlerOutcome::Kill("no \"link\" param in request".to_string());
        };
        if let Err(e) = channel.rpc_send(&Response::success(
            id,
            serde_json::json!({"code": 0, "message": "OK"}),
        )) {
            return HandlerOutcome::Kill(format!("failed to ack open_link: {}", e));
        }
        let command = self.link.default_cmd.replace("{url}", link);
        log::debug!("execute: \"{}\"", command);
        if let Err(e) = std::process::Command::new("sh").arg("-c").arg(&command).status() {
            log::warn!("open_link command failed: {}", e);
        }
        HandlerOutcome::Continue(None)
    }
}

impl Plugin for OpenerPlugin {
    fn mark(&self) -> &'static str {
        "open"
    }

    fn handle(&mut self, channel: &mut Channel, request: &Request) -> HandlerOutcome {
        match request.method.as_str() {
            "open_file" => self.handle_open_file(channel, request),
            "open_link" => self.handle_open_link(channel, request),
            other => HandlerOutcome::Abort(format!("unknown method \"{}\"", other)),
        }
    }
}
