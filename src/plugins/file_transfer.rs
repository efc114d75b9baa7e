//! `file` plugin: shared directory listing, upload-to-server,
//! download-from-server.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::AppContext;
use crate::channel::Channel;
use crate::device::Device;
use crate::error::HandlerOutcome;
use crate::plugin::Plugin;
use crate::rpc::Request;
use crate::transfer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedDir {
    pub path: PathBuf,
    pub name: Option<String>,
    #[serde(default = "default_glob")]
    pub glob: String,
    #[serde(default = "default_deep")]
    pub deep: u32,
}

fn default_glob() -> String {
    "*".to_string()
}

fn default_deep() -> u32 {
    1
}

fn default_download_directory() -> PathBuf {
    PathBuf::from("/tmp/dcnnt/files")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_download_directory")]
    pub download_directory: PathBuf,
    #[serde(default)]
    pub on_download: Option<String>,
    #[serde(default = "default_shared_dirs")]
    pub shared_dirs: Vec<SharedDir>,
}

fn default_shared_dirs() -> Vec<SharedDir> {
    vec![SharedDir {
        path: PathBuf::from("/tmp/dcnnt/files"),
        name: Some("Shared".to_string()),
        glob: "*".to_string(),
        deep: 1024,
    }]
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            download_directory: default_download_directory(),
            on_download: None,
            shared_dirs: default_shared_dirs(),
        }
    }
}

fn matches_glob(name: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    // Minimal glob: '*' wildcard only, matching fnmatch for this plugin's
    // simple filename-filter use case.
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return name == pattern;
    }
    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) if i == 0 && pos != 0 => return false,
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

pub struct FileTransferPlugin {
    download_directory: PathBuf,
    on_download: Option<String>,
    shared_dirs: Vec<SharedDir>,
    shared_files_index: Vec<PathBuf>,
}

impl FileTransferPlugin {
    pub fn new(context: &AppContext, device: &Device) -> Self {
        let config: FileConfig = super::load_config(context, "file", device);
        std::fs::create_dir_all(&config.download_directory).ok();
        Self {
            download_directory: config.download_directory,
            on_download: config.on_download,
            shared_dirs: config.shared_dirs,
            shared_files_index: Vec::new(),
        }
    }

    fn list_directory(&mut self, dir: &Path, glob: &str, max_deep: u32, current_deep: u32) -> Vec<Value> {
        let mut res = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("could not list content of directory \"{}\": {}", dir.display(), e);
                return res;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if current_deep < max_deep && max_deep > 0 {
                    let children = self.list_directory(&path, glob, max_deep, current_deep + 1);
                    res.push(serde_json::json!({
                        "name": name,
                        "node_type": "directory",
                        "size": children.len(),
                        "children": children,
                    }));
                }
            } else if path.is_file() && matches_glob(&name, glob) {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                self.shared_files_index.push(path);
                let index = self.shared_files_index.len() - 1;
                res.push(serde_json::json!({
                    "name": name,
                    "node_type": "file",
                    "size": size,
                    "index": index,
                }));
            }
        }
        res
    }

    fn shared_files_info(&mut self) -> Vec<Value> {
        self.shared_files_index.clear();
        let mut res = Vec::new();
        let mut names: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        for shared_dir in self.shared_dirs.clone() {
            if !shared_dir.path.is_dir() {
                log::warn!("shared directory \"{}\" not found", shared_dir.path.display());
                continue;
            }
            let mut name = shared_dir
                .name
                .clone()
                .unwrap_or_else(|| shared_dir.path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default());
            if let Some(count) = names.get_mut(&name) {
                *count += 1;
                name = format!("{} ({})", name, count);
            } else {
                names.insert(name.clone(), 0);
            }
            let children = self.list_directory(&shared_dir.path, &shared_dir.glob, shared_dir.deep, 1);
            res.push(serde_json::json!({
                "name": name,
                "node_type": "directory",
                "size": children.len(),
                "children": children,
            }));
        }
        res
    }

    fn handle_list(&mut self, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("list is not a notification".to_string());
        };
        let info = self.shared_files_info();
        HandlerOutcome::Continue(Some(crate::rpc::Response::success(id, Value::Array(info))))
    }

    fn handle_upload(&self, channel: &mut Channel, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("upload is not a notification".to_string());
        };
        match transfer::receive_to_path(channel, id, &request.params, &self.download_directory) {
            Ok(path) => {
                if let Some(template) = &self.on_download {
                    let command = template.replace("{path}", &path.display().to_string());
                    log::debug!("execute: \"{}\"", command);
                    if let Err(e) = std::process::Command::new("sh").arg("-c").arg(&command).status() {
                        log::warn!("on_download command failed: {}", e);
                    }
                }
                HandlerOutcome::Continue(None)
            }
            Err(outcome) => outcome,
        }
    }

    fn handle_download(&self, channel: &mut Channel, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("download is not a notification".to_string());
        };
        let Some(index) = request.params.get("index").and_then(Value::as_u64) else {
            return HandlerOutcome::Abort("download missing \"index\" param".to_string());
        };
        let size = request.params.get("size").and_then(Value::as_u64);
        match self.shared_files_index.get(index as usize) {
            Some(path) => transfer::send_from_path(channel, id, path, size),
            None => {
                let response = crate::rpc::Response::success(
                    id,
                    serde_json::json!({"code": 1, "message": format!("No such index: {}", index)}),
                );
                HandlerOutcome::Continue(Some(response))
            }
        }
    }
}

impl Plugin for FileTransferPlugin {
    fn mark(&self) -> &'static str {
        "file"
    }

    fn handle(&mut self, channel: &mut Channel, request: &Request) -> HandlerOutcome {
        match request.method.as_str() {
            "list" => self.handle_list(request),
            "upload" => self.handle_upload(channel, request),
            "download" => self.handle_download(channel, request),
            other => HandlerOutcome::Abort(format!("unknown method \"{}\"", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_star() {
        assert!(matches_glob("anything.txt", "*"));
        assert!(matches_glob("foo.txt", "*.txt"));
        assert!(!matches_glob("foo.jpg", "*.txt"));
    }

    #[test]
    fn shared_files_info_indexes_by_enumeration_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"aaa").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        let mut plugin = FileTransferPlugin {
            download_directory: dir.path().to_path_buf(),
            on_download: None,
            shared_dirs: vec![SharedDir {
                path: dir.path().to_path_buf(),
                name: Some("Shared".to_string()),
                glob: "*".to_string(),
                deep: 1,
            }],
            shared_files_index: Vec::new(),
        };
        let info = plugin.shared_files_info();
        assert_eq!(info.len(), 1);
        assert_eq!(plugin.shared_files_index.len(), 2);
    }
}
