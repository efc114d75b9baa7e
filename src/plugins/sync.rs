//! `sync` plugin: three-way reconciliation between a client's flat inventory
//! and the server's filesystem subtree, producing an action plan the client
//! then drives via `dir_upload`/`dir_download`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::AppContext;
use crate::channel::Channel;
use crate::device::Device;
use crate::error::HandlerOutcome;
use crate::plugin::Plugin;
use crate::rpc::{Request, Response};
use crate::transfer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncDir {
    pub path: PathBuf,
    pub name: Option<String>,
}

fn default_dirs() -> Vec<SyncDir> {
    Vec::new()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    #[serde(default = "default_dirs")]
    pub dir: Vec<SyncDir>,
}

/// One entry of the server-side walk, or of the reconciled view of a name
/// present on both sides.
#[derive(Debug, Clone)]
struct Entry {
    mtime_ms: i64,
    is_dir: bool,
}

/// A client inventory entry as sent over the wire: `[name, ts_ms,
/// is_dir_marker, crc]`, where `is_dir_marker == -1` means directory. `crc`
/// is parsed and kept around but never interpreted, matching the source.
struct ClientEntry {
    name: String,
    ts_ms: i64,
    is_dir: bool,
}

fn parse_client_entries(data: &Value) -> Option<Vec<ClientEntry>> {
    let arr = data.as_array()?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let tuple = item.as_array()?;
        if tuple.len() < 3 {
            return None;
        }
        let name = tuple[0].as_str()?.to_string();
        let ts_ms = tuple[1].as_i64()?;
        let marker = tuple[2].as_i64()?;
        out.push(ClientEntry {
            name,
            ts_ms,
            is_dir: marker == -1,
        });
    }
    Some(out)
}

/// Walk `root`, recording every file and directory relative to it, raising
/// each directory's recorded mtime to the maximum mtime of anything it
/// contains (propagated upward, stopping at `root` itself). Grounded on
/// the source's `flat_fs` walk shape.
fn walk_server_tree(root: &Path) -> std::io::Result<BTreeMap<String, Entry>> {
    let mut out = BTreeMap::new();
    collect(root, root, &mut out)?;
    Ok(out)
}

fn collect(root: &Path, dir: &Path, out: &mut BTreeMap<String, Entry>) -> std::io::Result<i64> {
    let mut max_child_mtime = mtime_ms(dir)?;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let relpath = path
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/");
        if path.is_dir() {
            let child_mtime = collect(root, &path, out)?;
            max_child_mtime = max_child_mtime.max(child_mtime);
            let entry = out.entry(relpath).or_insert(Entry {
                mtime_ms: child_mtime,
                is_dir: true,
            });
            entry.mtime_ms = entry.mtime_ms.max(child_mtime);
        } else {
            let file_mtime = mtime_ms(&path)?;
            max_child_mtime = max_child_mtime.max(file_mtime);
            out.insert(
                relpath,
                Entry {
                    mtime_ms: file_mtime,
                    is_dir: false,
                },
            );
        }
    }
    Ok(max_child_mtime)
}

fn mtime_ms(path: &Path) -> std::io::Result<i64> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified()?;
    let ms = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(ms)
}

/// Find an unused name by appending `-{mark}-1` .. `-{mark}-5` before the
/// extension; fails after six total attempts (the bare name counts as the
/// first).
fn rename_with_suffix(dir: &Path, name: &str, mark: &str, existing: &BTreeSet<String>) -> Option<String> {
    let path = Path::new(name);
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());
    let candidate = |suffix: &str| match &ext {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext),
        None => format!("{}{}", stem, suffix),
    };
    for attempt in 0..6 {
        let suffix = if attempt == 0 {
            format!("-{}", mark)
        } else {
            format!("-{}-{}", mark, attempt)
        };
        let candidate = candidate(&suffix);
        if !existing.contains(&candidate) && !dir.join(&candidate).exists() {
            return Some(candidate);
        }
    }
    None
}

/// Same collision-avoidance scheme, but with a caller-supplied exact suffix
/// (the `-srv-{ts_s}` form the wire contract names explicitly for the
/// sync+both case) tried first before falling back to the numbered scheme.
fn rename_with_exact_suffix(
    dir: &Path,
    name: &str,
    suffix: &str,
    mark: &str,
    existing: &BTreeSet<String>,
) -> Option<String> {
    let path = Path::new(name);
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());
    let first = match &ext {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext),
        None => format!("{}{}", stem, suffix),
    };
    if !existing.contains(&first) && !dir.join(&first).exists() {
        return Some(first);
    }
    rename_with_suffix(dir, name, mark, existing)
}

struct Plan {
    upload: Vec<String>,
    download: Vec<String>,
    create_c: Vec<String>,
    create_s: Vec<String>,
    rename_c: Vec<(String, String)>,
    rename_s: Vec<(String, String)>,
    delete_c: Vec<String>,
    delete_s: Vec<String>,
}

impl Plan {
    fn new() -> Self {
        Self {
            upload: Vec::new(),
            download: Vec::new(),
            create_c: Vec::new(),
            create_s: Vec::new(),
            rename_c: Vec::new(),
            rename_s: Vec::new(),
            delete_c: Vec::new(),
            delete_s: Vec::new(),
        }
    }
}

/// Build the reconciliation plan and apply server-side mutations. `root`
/// is the configured filesystem path `path` resolves to.
fn build_plan(
    root: &Path,
    client: &[ClientEntry],
    server: &BTreeMap<String, Entry>,
    mode: &str,
    on_conflict: &str,
    on_delete: &str,
) -> Result<Plan, &'static str> {
    let client_by_name: BTreeMap<&str, &ClientEntry> =
        client.iter().map(|e| (e.name.as_str(), e)).collect();
    let c_names: BTreeSet<&str> = client_by_name.keys().copied().collect();
    let s_names: BTreeSet<&str> = server.keys().map(|s| s.as_str()).collect();

    let only_c: Vec<&str> = c_names.difference(&s_names).copied().collect();
    let only_s: Vec<&str> = s_names.difference(&c_names).copied().collect();
    let both: Vec<&str> = c_names.intersection(&s_names).copied().collect();

    let uploads_mode = matches!(mode, "upload" | "sync");
    let downloads_mode = matches!(mode, "download" | "sync");

    let mut plan = Plan::new();

    // Rule 1: only_C.
    for name in &only_c {
        let entry = client_by_name[name];
        if uploads_mode {
            if entry.is_dir {
                plan.create_s.push(name.to_string());
            } else {
                plan.upload.push(name.to_string());
            }
        } else if on_delete == "delete" {
            plan.delete_c.push(name.to_string());
        }
    }

    // Rule 2: only_S, mirror of rule 1.
    for name in &only_s {
        let entry = &server[*name];
        if downloads_mode {
            if entry.is_dir {
                plan.create_c.push(name.to_string());
            } else {
                plan.download.push(name.to_string());
            }
        } else if on_delete == "delete" {
            plan.delete_s.push(name.to_string());
        }
    }

    // Used to keep generated rename targets from colliding with each other
    // within this same plan, in addition to what's already on disk.
    let mut existing_names: BTreeSet<String> = server.keys().cloned().collect();

    // Rule 3: both.
    for name in &both {
        let client_entry = client_by_name[name];
        let server_entry = &server[*name];
        if client_entry.is_dir && server_entry.is_dir {
            continue;
        }
        match mode {
            "download" => match on_conflict {
                "replace" => {
                    plan.delete_c.push(name.to_string());
                    if server_entry.is_dir {
                        plan.create_c.push(name.to_string());
                    } else {
                        plan.download.push(name.to_string());
                    }
                }
                "new" => {
                    if server_entry.mtime_ms > client_entry.ts_ms {
                        plan.delete_c.push(name.to_string());
                        if server_entry.is_dir {
                            plan.create_c.push(name.to_string());
                        } else {
                            plan.download.push(name.to_string());
                        }
                    }
                }
                "both" => {
                    if client_entry.is_dir != server_entry.is_dir {
                        return Err("Dir-file name conflict");
                    }
                    let renamed = rename_with_suffix(root, name, "local", &existing_names)
                        .ok_or("rename collision")?;
                    existing_names.insert(renamed.clone());
                    plan.rename_c.push((name.to_string(), renamed));
                    if server_entry.is_dir {
                        plan.create_c.push(name.to_string());
                    } else {
                        plan.download.push(name.to_string());
                    }
                }
                _ => {}
            },
            "upload" => match on_conflict {
                "replace" => {
                    plan.delete_s.push(name.to_string());
                    if client_entry.is_dir {
                        plan.create_s.push(name.to_string());
                    } else {
                        plan.upload.push(name.to_string());
                    }
                }
                "new" => {
                    if client_entry.ts_ms > server_entry.mtime_ms {
                        plan.delete_s.push(name.to_string());
                        if client_entry.is_dir {
                            plan.create_s.push(name.to_string());
                        } else {
                            plan.upload.push(name.to_string());
                        }
                    }
                }
                "both" => {
                    if client_entry.is_dir != server_entry.is_dir {
                        return Err("Dir-file name conflict");
                    }
                    let renamed = rename_with_exact_suffix(
                        root,
                        name,
                        &format!("-srv-{}", server_entry.mtime_ms),
                        "srv",
                        &existing_names,
                    )
                    .ok_or("rename collision")?;
                    existing_names.insert(renamed.clone());
                    plan.rename_s.push((name.to_string(), renamed));
                    if client_entry.is_dir {
                        plan.create_s.push(name.to_string());
                    } else {
                        plan.upload.push(name.to_string());
                    }
                }
                _ => {}
            },
            "sync" => match on_conflict {
                "replace" => {
                    plan.delete_c.push(name.to_string());
                    if server_entry.is_dir {
                        plan.create_c.push(name.to_string());
                    } else {
                        plan.download.push(name.to_string());
                    }
                }
                "new" => {
                    if client_entry.ts_ms >= server_entry.mtime_ms {
                        plan.delete_s.push(name.to_string());
                    } else {
                        plan.delete_c.push(name.to_string());
                    }
                }
                "both" => {
                    if client_entry.is_dir != server_entry.is_dir {
                        return Err("Dir-file name conflict");
                    }
                    let renamed = rename_with_exact_suffix(
                        root,
                        name,
                        &format!("-srv-{}", server_entry.mtime_ms),
                        "srv",
                        &existing_names,
                    )
                    .ok_or("rename collision")?;
                    existing_names.insert(renamed.clone());
                    plan.rename_s.push((name.to_string(), renamed));
                    plan.upload.push(name.to_string());
                    plan.download.push(renamed);
                }
                _ => {}
            },
            _ => {}
        }
    }

    Ok(plan)
}

/// Apply the server-side half of the plan to `root`: renames (ascending),
/// then deletes (descending, children before parents), then directory
/// creates (`mkdir -p`). Client-side actions are left for the caller to
/// report back; they are never performed here.
fn apply_server_mutations(root: &Path, plan: &Plan) {
    let mut renames = plan.rename_s.clone();
    renames.sort_by(|a, b| a.0.cmp(&b.0));
    for (from, to) in &renames {
        if let Err(e) = std::fs::rename(root.join(from), root.join(to)) {
            log::warn!("sync: rename {} -> {} failed: {}", from, to, e);
        }
    }

    let mut deletes = plan.delete_s.clone();
    deletes.sort();
    deletes.reverse();
    for name in &deletes {
        let path = root.join(name);
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            log::warn!("sync: delete {} failed: {}", name, e);
        }
    }

    for name in &plan.create_s {
        if let Err(e) = std::fs::create_dir_all(root.join(name)) {
            log::warn!("sync: mkdir -p {} failed: {}", name, e);
        }
    }
}

pub struct SyncPlugin {
    dirs: Vec<SyncDir>,
}

impl SyncPlugin {
    pub fn new(context: &AppContext, device: &Device) -> Self {
        let config: SyncConfig = super::load_config(context, "sync", device);
        Self { dirs: config.dir }
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .find(|d| d.path.to_string_lossy() == path)
            .map(|d| d.path.clone())
    }

    fn handle_dir_list(&self, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("dir_list is not a notification".to_string());
        };
        let params = &request.params;
        let Some(path) = params.get("path").and_then(Value::as_str) else {
            return HandlerOutcome::Abort("dir_list missing \"path\" param".to_string());
        };
        let Some(root) = self.resolve(path) else {
            return HandlerOutcome::Kill(format!("\"{}\" is not a configured sync root", path));
        };
        let mode = params.get("mode").and_then(Value::as_str).unwrap_or("sync");
        let on_conflict = params.get("on_conflict").and_then(Value::as_str).unwrap_or("ignore");
        let on_delete = params.get("on_delete").and_then(Value::as_str).unwrap_or("keep");

        let Some(client_entries) = params.get("data").and_then(parse_client_entries) else {
            return HandlerOutcome::Abort("dir_list \"data\" is malformed".to_string());
        };

        let server_tree = match walk_server_tree(&root) {
            Ok(tree) => tree,
            Err(e) => {
                return HandlerOutcome::Abort(format!(
                    "could not walk sync root \"{}\": {}",
                    root.display(),
                    e
                ))
            }
        };

        let plan = match build_plan(&root, &client_entries, &server_tree, mode, on_conflict, on_delete) {
            Ok(plan) => plan,
            Err(message) => return HandlerOutcome::Kill(message.to_string()),
        };

        apply_server_mutations(&root, &plan);

        let session = format!(
            "{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0)
        );

        let create: Vec<String> = plan.create_c.clone();
        let delete: Vec<String> = plan.delete_c.clone();
        let rename: Vec<Value> = plan
            .rename_c
            .iter()
            .map(|(from, to)| serde_json::json!({"from": from, "to": to}))
            .collect();

        HandlerOutcome::Continue(Some(Response::success(
            id,
            serde_json::json!({
                "upload": plan.upload,
                "download": plan.download,
                "create": create,
                "delete": delete,
                "rename": rename,
                "session": session,
            }),
        )))
    }

    fn handle_dir_upload(&self, channel: &mut Channel, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("dir_upload is not a notification".to_string());
        };
        let Some(path) = request.params.get("path").and_then(Value::as_str) else {
            return HandlerOutcome::Abort("dir_upload missing \"path\" param".to_string());
        };
        let Some(root) = self.resolve(path) else {
            return HandlerOutcome::Kill(format!("\"{}\" is not a configured sync root", path));
        };
        let Some(name) = request.params.get("name").and_then(Value::as_str) else {
            return HandlerOutcome::Abort("dir_upload missing \"name\" param".to_string());
        };
        if let Some(parent) = Path::new(name).parent() {
            if let Err(e) = std::fs::create_dir_all(root.join(parent)) {
                return HandlerOutcome::Abort(format!("cannot create parent of {}: {}", name, e));
            }
        }
        transfer::receive_to_path(channel, id, &request.params, &root)
            .map(|_| HandlerOutcome::Continue(None))
            .unwrap_or_else(|outcome| outcome)
    }

    fn handle_dir_download(&self, channel: &mut Channel, request: &Request) -> HandlerOutcome {
        let Some(id) = request.id.clone() else {
            return HandlerOutcome::Abort("dir_download is not a notification".to_string());
        };
        let Some(path) = request.params.get("path").and_then(Value::as_str) else {
            return HandlerOutcome::Abort("dir_download missing \"path\" param".to_string());
        };
        let Some(root) = self.resolve(path) else {
            return HandlerOutcome::Kill(format!("\"{}\" is not a configured sync root", path));
        };
        let Some(name) = request.params.get("name").and_then(Value::as_str) else {
            return HandlerOutcome::Abort("dir_download missing \"name\" param".to_string());
        };
        transfer::send_from_path(channel, id, &root.join(name), None)
    }
}

impl Plugin for SyncPlugin {
    fn mark(&self) -> &'static str {
        "sync"
    }

    fn handle(&mut self, channel: &mut Channel, request: &Request) -> HandlerOutcome {
        match request.method.as_str() {
            "dir_list" => self.handle_dir_list(request),
            "dir_upload" => self.handle_dir_upload(channel, request),
            "dir_download" => self.handle_dir_download(channel, request),
            other => HandlerOutcome::Abort(format!("unknown method \"{}\"", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, ts: i64, marker: i64) -> Value {
        serde_json::json!([name, ts, marker, 0])
    }

    #[test]
    fn identical_trees_produce_empty_plan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let server = walk_server_tree(dir.path()).unwrap();
        let ts = server["a.txt"].mtime_ms;
        let client = parse_client_entries(&serde_json::json!([entry("a.txt", ts, 0)])).unwrap();

        for mode in ["upload", "download", "sync"] {
            let plan = build_plan(dir.path(), &client, &server, mode, "ignore", "keep").unwrap();
            assert!(plan.upload.is_empty());
            assert!(plan.download.is_empty());
            assert!(plan.create_c.is_empty());
            assert!(plan.create_s.is_empty());
            assert!(plan.delete_c.is_empty());
            assert!(plan.delete_s.is_empty());
        }
    }

    #[test]
    fn upload_ignore_keep_only_populates_upload_and_create_s() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("b").join("y.txt"), b"y").unwrap();
        let server = walk_server_tree(dir.path()).unwrap();

        let client = parse_client_entries(&serde_json::json!([
            entry("a.txt", 100, 0),
            entry("dir_a", 100, -1),
        ]))
        .unwrap();

        let plan = build_plan(dir.path(), &client, &server, "upload", "ignore", "keep").unwrap();
        assert_eq!(plan.upload, vec!["a.txt"]);
        assert_eq!(plan.create_s, vec!["dir_a"]);
        assert!(plan.delete_c.is_empty());
        assert!(plan.delete_s.is_empty());
    }

    #[test]
    fn sync_new_seed_scenario() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a").join("x.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        let server = walk_server_tree(dir.path()).unwrap();
        let ts_s = server["a/x.txt"].mtime_ms;

        let client = parse_client_entries(&serde_json::json!([
            entry("a", 150, -1),
            entry("a/x.txt", ts_s - 1000, 0),
            entry("c.txt", 300, 0),
        ]))
        .unwrap();

        let plan = build_plan(dir.path(), &client, &server, "sync", "new", "delete").unwrap();
        assert_eq!(plan.upload, vec!["c.txt".to_string()]);
        assert_eq!(plan.download, vec!["b.txt".to_string()]);
        assert_eq!(plan.delete_c, vec!["a/x.txt".to_string()]);
        assert!(plan.delete_s.is_empty());
    }

    #[test]
    fn sync_both_renames_server_file_and_queues_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.txt"), b"server").unwrap();
        let server = walk_server_tree(dir.path()).unwrap();
        let ts_s = server["note.txt"].mtime_ms;

        let client = parse_client_entries(&serde_json::json!([entry("note.txt", ts_s + 5000, 0)])).unwrap();

        let plan = build_plan(dir.path(), &client, &server, "sync", "both", "keep").unwrap();
        assert_eq!(plan.upload, vec!["note.txt".to_string()]);
        assert_eq!(plan.rename_s.len(), 1);
        let (from, to) = &plan.rename_s[0];
        assert_eq!(from, "note.txt");
        assert_eq!(*to, format!("note-srv-{}.txt", ts_s));
        assert_eq!(plan.download, vec![to.clone()]);
    }

    #[test]
    fn both_dir_vs_file_conflict_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("thing")).unwrap();
        let server = walk_server_tree(dir.path()).unwrap();
        let client = parse_client_entries(&serde_json::json!([entry("thing", 100, 0)])).unwrap();
        let result = build_plan(dir.path(), &client, &server, "sync", "both", "keep");
        assert!(result.is_err());
    }

    #[test]
    fn handle_dir_list_kills_session_on_dir_file_conflict() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("thing")).unwrap();
        let plugin = SyncPlugin {
            dirs: vec![SyncDir {
                path: dir.path().to_path_buf(),
                name: None,
            }],
        };
        let request = Request {
            jsonrpc: None,
            method: "dir_list".to_string(),
            params: serde_json::json!({
                "path": dir.path().to_string_lossy(),
                "mode": "sync",
                "on_conflict": "both",
                "on_delete": "keep",
                "data": [entry("thing", 100, 0)],
            }),
            id: Some(Value::from(1)),
        };
        let outcome = plugin.handle_dir_list(&request);
        assert!(matches!(outcome, HandlerOutcome::Kill(_)));
    }

    #[test]
    fn handle_dir_list_kills_session_on_unconfigured_path() {
        let plugin = SyncPlugin { dirs: vec![] };
        let request = Request {
            jsonrpc: None,
            method: "dir_list".to_string(),
            params: serde_json::json!({
                "path": "/not/configured",
                "mode": "sync",
                "on_conflict": "ignore",
                "on_delete": "keep",
                "data": [],
            }),
            id: Some(Value::from(1)),
        };
        let outcome = plugin.handle_dir_list(&request);
        assert!(matches!(outcome, HandlerOutcome::Kill(_)));
    }

    #[test]
    fn never_same_name_in_delete_s_and_create_s() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("shared")).unwrap();
        std::fs::write(dir.path().join("shared").join("f.txt"), b"f").unwrap();
        let server = walk_server_tree(dir.path()).unwrap();
        let ts = server["shared/f.txt"].mtime_ms;

        let client = parse_client_entries(&serde_json::json!([
            entry("shared", ts + 10, -1),
            entry("shared/f.txt", ts + 10, 0),
        ]))
        .unwrap();

        let plan = build_plan(dir.path(), &client, &server, "upload", "new", "keep").unwrap();
        let delete_s: BTreeSet<_> = plan.delete_s.iter().collect();
        let create_s: BTreeSet<_> = plan.create_s.iter().collect();
        assert!(delete_s.intersection(&create_s).next().is_none());
    }
}
