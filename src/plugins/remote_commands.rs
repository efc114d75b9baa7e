//! `rcmd` plugin: enumerate a configured menu of remote commands and run
//! the selected one by stable index.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::app::AppContext;
use crate::channel::Channel;
use crate::device::Device;
use crate::error::HandlerOutcome;
use crate::plugin::Plugin;
use crate::rpc::{Request, Response};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuEntry {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub method: Option<String>,
    pub cmd: Option<String>,
}

fn default_name() -> String {
    "Do nothing".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RemoteCommandsConfig {
    #[serde(default)]
    pub menu: Vec<MenuEntry>,
}

/// Stable index for a menu entry: `hash(cmd + method)`, matching the
/// source's `str(hash(cmd + method))` — `DefaultHasher::new()` uses a
/// fixed key, so this is deterministic within and across runs.
fn command_index(cmd: &str, method: &str) -> String {
    let mut hasher = DefaultHasher::new();
    format!("{}{}", cmd, method).hash(&mut hasher);
    hasher.finish().to_string()
}

struct IndexedCommand {
    index: Option<String>,
    name: String,
    description: Option<String>,
    method: Option<String>,
    cmd: Option<String>,
}

pub struct RemoteCommandsPlugin {
    commands: Vec<IndexedCommand>,
}

impl RemoteCommandsPlugin {
    pub fn new(context: &AppContext, device: &Device) -> Self {
        let config: RemoteCommandsConfig = super::load_config(context, "rcmd", device);
        let commands = config
            .menu
            .into_iter()
            .map(|entry| {
                let index = match (&entry.cmd, &entry.method) {
                    (Some(cmd), Some(method)) => Some(command_index(cmd, method)),
                    _ => None,
                };
                IndexedCommand {
                    index,
                    name: entry.name,
                    description: entry.description,
                    method: entry.method,
                    cmd: entry.cmd,
                }
            })
            .collect();
        Self { commands }
    }

    fn handle_list(&self, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("list is not a notification".to_string());
        };
        let menu: Vec<_> = self
            .commands
            .iter()
            .map(|c| serde_json::json!({"index": c.index, "name": c.name, "description": c.description}))
            .collect();
        HandlerOutcome::Continue(Some(Response::success(id, serde_json::Value::Array(menu))))
    }

    fn handle_exec(&self, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("exec is not a notification".to_string());
        };
        let Some(index) = request.params.get("index").and_then(|v| v.as_str()) else {
            return HandlerOutcome::Continue(Some(Response::success(
                id,
                serde_json::json!({"result": false, "message": "No such command"}),
            )));
        };
        let command = self
            .commands
            .iter()
            .find(|c| c.index.as_deref() == Some(index));
        let Some(command) = command else {
            return HandlerOutcome::Continue(Some(Response::success(
                id,
                serde_json::json!({"result": false, "message": "No such command"}),
            )));
        };
        let result = match (command.method.as_deref(), command.cmd.as_deref()) {
            (Some("shell"), Some(cmd)) => {
                log::debug!("execute shell command: \"{}\"", cmd);
                match std::process::Command::new("sh").arg("-c").arg(cmd).status() {
                    Ok(status) if status.success() => {
                        serde_json::json!({"result": true, "message": "OK"})
                    }
                    _ => serde_json::json!({"result": false, "message": "Failed"}),
                }
            }
            _ => serde_json::json!({"result": false, "message": "No such method"}),
        };
        HandlerOutcome::Continue(Some(Response::success(id, result)))
    }
}

impl Plugin for RemoteCommandsPlugin {
    fn mark(&self) -> &'static str {
        "rcmd"
    }

    fn handle(&mut self, _channel: &mut Channel, request: &Request) -> HandlerOutcome {
        match request.method.as_str() {
            "list" => self.handle_list(request),
            "exec" => self.handle_exec(request),
            other => HandlerOutcome::Abort(format!("unknown method \"{}\"", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_deterministic() {
        assert_eq!(command_index("echo hi", "shell"), command_index("echo hi", "shell"));
        assert_ne!(command_index("echo hi", "shell"), command_index("echo bye", "shell"));
    }

    fn plugin_with(menu: Vec<MenuEntry>) -> RemoteCommandsPlugin {
        let commands = menu
            .into_iter()
            .map(|entry| {
                let index = match (&entry.cmd, &entry.method) {
                    (Some(cmd), Some(method)) => Some(command_index(cmd, method)),
                    _ => None,
                };
                IndexedCommand {
                    index,
                    name: entry.name,
                    description: entry.description,
                    method: entry.method,
                    cmd: entry.cmd,
                }
            })
            .collect();
        RemoteCommandsPlugin { commands }
    }

    fn unwrap_response(outcome: HandlerOutcome) -> serde_json::Value {
        match outcome {
            HandlerOutcome::Continue(Some(resp)) => resp,
            _ => panic!("expected Continue(Some(response))"),
        }
    }

    #[test]
    fn list_then_exec_matches_seed_scenario() {
        let plugin = plugin_with(vec![
            MenuEntry {
                name: "Echo".to_string(),
                description: None,
                method: Some("shell".to_string()),
                cmd: Some("echo hi".to_string()),
            },
            MenuEntry {
                name: "Reboot".to_string(),
                description: None,
                method: Some("unsupported".to_string()),
                cmd: Some("reboot".to_string()),
            },
        ]);

        let list_req = Request {
            jsonrpc: None,
            method: "list".to_string(),
            params: serde_json::Value::Null,
            id: Some(serde_json::Value::from(1)),
        };
        let list_resp = unwrap_response(plugin.handle_list(&list_req));
        let entries = list_resp["result"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        let echo_index = entries[0]["index"].as_str().unwrap().to_string();

        let exec_req = Request {
            jsonrpc: None,
            method: "exec".to_string(),
            params: serde_json::json!({"index": echo_index}),
            id: Some(serde_json::Value::from(2)),
        };
        let exec_resp = unwrap_response(plugin.handle_exec(&exec_req));
        assert_eq!(exec_resp["result"]["result"], true);
        assert_eq!(exec_resp["result"]["message"], "OK");

        let bogus_req = Request {
            jsonrpc: None,
            method: "exec".to_string(),
            params: serde_json::json!({"index": "bogus"}),
            id: Some(serde_json::Value::from(3)),
        };
        let bogus_resp = unwrap_response(plugin.handle_exec(&bogus_req));
        assert_eq!(bogus_resp["result"]["result"], false);
        assert_eq!(bogus_resp["result"]["message"], "No such command");
    }
}
