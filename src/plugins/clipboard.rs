//! `clip` plugin: read/write the desktop clipboard via configured shell
//! commands, subject to a 15-second timeout.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::AppContext;
use crate::channel::Channel;
use crate::device::Device;
use crate::error::HandlerOutcome;
use crate::plugin::Plugin;
use crate::proc::{run_with_timeout, TimedOut};
use crate::rpc::{Request, Response};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardEntry {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_clipboard")]
    pub clipboard: String,
    pub read: Option<String>,
    pub write: Option<String>,
}

fn default_name() -> String {
    "Clipboard".to_string()
}

fn default_clipboard() -> String {
    "clipboard".to_string()
}

fn default_clipboards() -> Vec<ClipboardEntry> {
    vec![ClipboardEntry {
        name: "Clipboard".to_string(),
        clipboard: "clipboard".to_string(),
        read: Some("xclip -selection \"{clipboard}\" -o".to_string()),
        write: Some("xclip -selection \"{clipboard}\" -i".to_string()),
    }]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardConfig {
    #[serde(default = "default_clipboards")]
    pub clipboards: Vec<ClipboardEntry>,
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            clipboards: default_clipboards(),
        }
    }
}

pub struct ClipboardPlugin {
    clipboards: Vec<ClipboardEntry>,
}

impl ClipboardPlugin {
    pub fn new(context: &AppContext, device: &Device) -> Self {
        let config: ClipboardConfig = super::load_config(context, "clip", device);
        Self {
            clipboards: config.clipboards,
        }
    }

    fn handle_list(&self, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("list is not a notification".to_string());
        };
        let list: Vec<_> = self
            .clipboards
            .iter()
            .enumerate()
            .map(|(i, c)| {
                serde_json::json!({
                    "key": i.to_string(),
                    "name": c.name,
                    "readable": c.read.is_some(),
                    "writeable": c.write.is_some(),
                })
            })
            .collect();
        HandlerOutcome::Continue(Some(Response::success(id, Value::Array(list))))
    }

    fn lookup(&self, request: &Request) -> Result<&ClipboardEntry, HandlerOutcome> {
        let key = match request.params.get("clipboard") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let index = key.as_deref().and_then(|k| k.parse::<usize>().ok());
        match index.and_then(|i| self.clipboards.get(i)) {
            Some(entry) => Ok(entry),
            None => {
                let id = request.id.clone().ok_or_else(|| {
                    HandlerOutcome::Abort("clipboard request missing id".to_string())
                })?;
                Err(HandlerOutcome::Continue(Some(Response::success(
                    id,
                    serde_json::json!({"code": 1, "message": "No such clipboard"}),
                ))))
            }
        }
    }

    fn handle_read(&self, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("read is not a notification".to_string());
        };
        let entry = match self.lookup(request) {
            Ok(entry) => entry,
            Err(outcome) => return outcome,
        };
        let Some(template) = &entry.read else {
            return HandlerOutcome::Continue(Some(Response::success(
                id,
                serde_json::json!({"code": 1, "message": "No such clipboard"}),
            )));
        };
        let command = template.replace("{clipboard}", &entry.clipboard);
        match run_with_timeout(&command, None, COMMAND_TIMEOUT) {
            Ok(Ok(stdout)) => {
                let text = String::from_utf8_lossy(&stdout).to_string();
                HandlerOutcome::Continue(Some(Response::success(
                    id,
                    serde_json::json!({"code": 0, "text": text}),
                )))
            }
            Ok(Err(TimedOut)) => HandlerOutcome::Continue(Some(Response::success(
                id,
                serde_json::json!({"code": 2, "message": "Error: timed out"}),
            ))),
            Err(e) => HandlerOutcome::Continue(Some(Response::success(
                id,
                serde_json::json!({"code": 2, "message": format!("Error: {}", e)}),
            ))),
        }
    }

    fn handle_write(&self, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("write is not a notification".to_string());
        };
        let entry = match self.lookup(request) {
            Ok(entry) => entry,
            Err(outcome) => return outcome,
        };
        let Some(template) = &entry.write else {
            return HandlerOutcome::Continue(Some(Response::success(
                id,
                serde_json::json!({"code": 1, "message": "No such clipboard"}),
            )));
        };
        let Some(text) = request.params.get("text").and_then(Value::as_str) else {
            return HandlerOutcome::Abort("write missing \"text\" param".to_string());
        };
        let command = template.replace("{clipboard}", &entry.clipboard);
        match run_with_timeout(&command, Some(text.as_bytes()), COMMAND_TIMEOUT) {
            Ok(Ok(_)) => HandlerOutcome::Continue(Some(Response::success(
                id,
                serde_json::json!({"code": 0, "message": "OK"}),
            ))),
            Ok(Err(TimedOut)) => HandlerOutcome::Continue(Some(Response::success(
                id,
                serde_json::json!({"code": 2, "message": "Error: timed out"}),
            ))),
            Err(e) => HandlerOutcome::Continue(Some(Response::success(
                id,
                serde_json::json!({"code": 2, "message": format!("Error: {}", e)}),
            ))),
        }
    }
}

impl Plugin for ClipboardPlugin {
    fn mark(&self) -> &'static str {
        "clip"
    }

    fn handle(&mut self, _channel: &mut Channel, request: &Request) -> HandlerOutcome {
        match request.method.as_str() {
            "list" => self.handle_list(request),
            "read" => self.handle_read(request),
            "write" => self.handle_write(request),
            other => HandlerOutcome::Abort(format!("unknown method \"{}\"", other)),
        }
    }
}
