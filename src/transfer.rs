//! File transfer sub-protocol shared by every plugin that moves bulk bytes
//! over the channel (`file`, `open`, `sync`): receive-to-path and
//! send-from-path as a sequence of framed records.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::channel::Channel;
use crate::error::HandlerOutcome;
use crate::rpc::Response;

/// Plaintext chunk size used when streaming a file out; matches the
/// source's `BaseFilePlugin.PART` (65532, leaving room under the 64KiB
/// record target once framing overhead is added elsewhere).
pub const PART: usize = 65532;

/// Receive a file announced by `{name, size}` into `download_dir`, replying
/// twice as the wire protocol requires (ack before the transfer, ack after).
/// Returns the final `HandlerOutcome` to give back to the caller's plugin
/// loop; on success carries `Ok(path)`, with the reply already sent by this
/// function in both outcomes.
pub fn receive_to_path(
    channel: &mut Channel,
    id: Value,
    params: &Value,
    download_dir: &Path,
) -> Result<PathBuf, HandlerOutcome> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerOutcome::Abort("upload missing \"name\" param".to_string()))?;
    let size = params
        .get("size")
        .and_then(Value::as_u64)
        .ok_or_else(|| HandlerOutcome::Abort("upload missing \"size\" param".to_string()))?;

    let path = download_dir.join(name);
    if let Err(e) = channel.rpc_send(&Response::success(
        id.clone(),
        serde_json::json!({"code": 0, "message": "OK"}),
    )) {
        return Err(HandlerOutcome::Kill(format!("failed to ack upload: {}", e)));
    }

    let mut file = File::create(&path)
        .map_err(|e| HandlerOutcome::Abort(format!("cannot create {}: {}", path.display(), e)))?;

    let mut written: u64 = 0;
    while written < size {
        let frame = match channel.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return Err(HandlerOutcome::Kill(format!(
                    "file receiving aborted ({} bytes received)",
                    written
                )))
            }
            Err(e) => return Err(HandlerOutcome::Kill(format!("transport break: {}", e))),
        };
        if frame.is_empty() {
            // Zero-length record is the in-band cancel sentinel: the next
            // record must be an RPC message whose method is "cancel".
            match channel.rpc_read() {
                Ok(Some(req)) if req.method == "cancel" => {
                    let _ = channel.rpc_send(&Response::success(
                        id,
                        serde_json::json!({"code": 1, "message": "Canceled"}),
                    ));
                    return Err(HandlerOutcome::Continue(None));
                }
                Ok(_) => {
                    return Err(HandlerOutcome::Kill(
                        "expected cancel notification after zero-length record".to_string(),
                    ))
                }
                Err(e) => return Err(HandlerOutcome::Kill(format!("transport break: {}", e))),
            }
        }
        if let Err(e) = file.write_all(&frame) {
            return Err(HandlerOutcome::Abort(format!("write failed: {}", e)));
        }
        written += frame.len() as u64;
    }

    if let Err(e) = channel.rpc_send(&Response::success(
        id,
        serde_json::json!({"code": 0, "message": "OK"}),
    )) {
        return Err(HandlerOutcome::Kill(format!(
            "failed to ack upload completion: {}",
            e
        )));
    }
    Ok(path)
}

/// Send the file at `path` in response to a request that optionally fixes
/// the expected `size`. Sends the initial `{code:0, message:"OK", size?}`
/// reply itself, then streams the body as consecutive framed records.
pub fn send_from_path(
    channel: &mut Channel,
    id: Value,
    path: &Path,
    expected_size: Option<u64>,
) -> HandlerOutcome {
    let metadata = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        _ => {
            let _ = channel.rpc_send(&Response::success(
                id,
                serde_json::json!({"code": 2, "message": "No such file"}),
            ));
            return HandlerOutcome::Continue(None);
        }
    };
    let file_size = metadata.len();
    if let Some(expected) = expected_size {
        if expected != file_size {
            let _ = channel.rpc_send(&Response::success(
                id,
                serde_json::json!({"code": 2, "message": "Size mismatch"}),
            ));
            return HandlerOutcome::Continue(None);
        }
    }

    let mut result = serde_json::json!({"code": 0, "message": "OK"});
    if expected_size.is_none() {
        result["size"] = Value::from(file_size);
    }
    if let Err(e) = channel.rpc_send(&Response::success(id, result)) {
        return HandlerOutcome::Kill(format!("failed to ack download: {}", e));
    }

    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => return HandlerOutcome::Abort(format!("cannot open {}: {}", path.display(), e)),
    };
    let mut buf = vec![0u8; PART];
    loop {
        let n = match std::io::Read::read(&mut file, &mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return HandlerOutcome::Abort(format!("read failed: {}", e)),
        };
        if let Err(e) = channel.write_frame(&buf[..n]) {
            return HandlerOutcome::Kill(format!("transport break while sending: {}", e));
        }
    }
    HandlerOutcome::Continue(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (Channel, Channel) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let key_a = crypto::derive_key("a");
        let key_b = crypto::derive_key("b");
        (
            Channel::new(client, key_a, key_b),
            Channel::new(server, key_b, key_a),
        )
    }

    #[test]
    fn receive_and_send_round_trip() {
        let (mut client, mut server) = pair();
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_path_buf();

        let server_thread = std::thread::spawn(move || {
            let params = serde_json::json!({"name": "a.txt", "size": 5});
            receive_to_path(&mut server, Value::from(1), &params, &dir_path).unwrap();
        });

        let _ack1 = client.read_frame().unwrap();
        client.write_frame(b"hello").unwrap();
        let _ack2 = client.read_frame().unwrap();

        server_thread.join().unwrap();
        let contents = std::fs::read(dir.path().join("a.txt")).unwrap();
        assert_eq!(contents, b"hello");
    }

    #[test]
    fn receive_aborts_on_cancel_sentinel() {
        let (mut client, mut server) = pair();
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_path_buf();

        let server_thread = std::thread::spawn(move || {
            let params = serde_json::json!({"name": "big.bin", "size": 1_000_000});
            receive_to_path(&mut server, Value::from(1), &params, &dir_path)
        });

        let _ack1 = client.read_frame().unwrap();
        client.write_frame(&[0u8; 65536]).unwrap();
        client.write_frame(b"").unwrap();
        client
            .rpc_send(&serde_json::json!({"jsonrpc": "2.0", "method": "cancel", "id": 2}))
            .unwrap();
        let ack2 = client.read_frame().unwrap().unwrap();
        let ack2: Value = serde_json::from_slice(&ack2).unwrap();
        assert_eq!(ack2["result"]["code"], 1);
        assert_eq!(ack2["result"]["message"], "Canceled");

        let result = server_thread.join().unwrap();
        assert!(matches!(result, Err(HandlerOutcome::Continue(None))));
    }
}
