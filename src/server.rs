//! TCP session server: accept loop, header-phase authentication, plugin
//! selection, and per-connection dispatch.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::app::AppContext;
use crate::channel::Channel;
use crate::crypto;
use crate::device::Device;
use crate::plugin::{run_session, Plugin};
use crate::plugins;

const HEADER_LEN: usize = 60;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct Server {
    listener: TcpListener,
    context: Arc<AppContext>,
}

impl Server {
    pub fn bind(port: u16, context: Arc<AppContext>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, context })
    }

    /// Accept loop. Each connection is handled on its own thread; a panic
    /// or error inside one session never stops this loop from accepting
    /// the next one.
    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::debug!("accepted connection from {}", addr);
                    let context = self.context.clone();
                    std::thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, &context) {
                            log::warn!("session with {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    log::warn!("tcp accept error: {}", e);
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("header read timed out or connection closed")]
    HeaderIncomplete,
    #[error("destination UIN {0} does not match this server's UIN {1}")]
    WrongDestination(u32, u32),
    #[error("unknown source UIN {0}")]
    UnknownSource(u32),
    #[error("source UIN {0} has no recv key")]
    NoRecvKey(u32),
    #[error("incorrect password for UIN {0}")]
    IncorrectPassword(u32),
    #[error("unknown plugin mark {0:?}")]
    UnknownPlugin(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn handle_connection(stream: TcpStream, context: &AppContext) -> Result<(), SessionError> {
    stream.set_nodelay(true).ok();
    let mut header = [0u8; HEADER_LEN];
    {
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let mut reader = &stream;
        use std::io::Read;
        reader
            .read_exact(&mut header)
            .map_err(|_| SessionError::HeaderIncomplete)?;
    }

    let dst = u32::from_be_bytes(header[16..20].try_into().unwrap());
    let src = u32::from_be_bytes(header[20..24].try_into().unwrap());
    let server = context.registry.server();
    if dst != server.uin {
        return Err(SessionError::WrongDestination(dst, server.uin));
    }
    let device: Device = context
        .registry
        .lookup(src)
        .ok_or(SessionError::UnknownSource(src))?;
    let key_recv = device.key_recv.ok_or(SessionError::NoRecvKey(src))?;
    let key_send = device.key_send.ok_or(SessionError::NoRecvKey(src))?;

    let plugin_mark_bytes =
        crypto::open(&header[24..60], &key_recv).map_err(|_| SessionError::IncorrectPassword(src))?;
    if plugin_mark_bytes.len() != 4 {
        return Err(SessionError::UnknownPlugin(format!("{:?}", plugin_mark_bytes)));
    }
    let plugin_mark = String::from_utf8_lossy(&plugin_mark_bytes).to_string();

    let mut plugin: Box<dyn Plugin> = plugins::build(&plugin_mark, context, &device)
        .ok_or_else(|| SessionError::UnknownPlugin(plugin_mark.clone()))?;

    let mut response = Vec::with_capacity(HEADER_LEN);
    response.extend_from_slice(&[0u8; 16]);
    response.extend_from_slice(&src.to_be_bytes());
    response.extend_from_slice(&server.uin.to_be_bytes());
    response.extend_from_slice(&crypto::seal(&plugin_mark_bytes, &key_send));
    {
        use std::io::Write;
        let mut writer = &stream;
        writer.write_all(&response)?;
    }

    let mut channel = Channel::new(stream, key_send, key_recv);
    channel.arm_watchdog().ok();
    log::debug!("[{}] entering plugin loop for UIN {}", plugin_mark, src);
    run_session(&mut channel, plugin.as_mut());
    channel.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceManager, ServerIdentity};

    fn context() -> (Arc<AppContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let devices_dir = dir.path().join("devices");
        let plugins_dir = dir.path().join("plugins");
        std::fs::create_dir_all(&plugins_dir).unwrap();
        let server = ServerIdentity {
            uin: 7,
            name: "Host".to_string(),
            password: "serverpw".to_string(),
        };
        let registry = Arc::new(DeviceManager::load(&devices_dir, server).unwrap());
        let context = Arc::new(AppContext {
            registry,
            config_dir: dir.path().to_path_buf(),
            plugins_dir,
            runtime_dir: dir.path().to_path_buf(),
        });
        (context, dir)
    }

    #[test]
    fn header_rejects_unknown_source() {
        let (context, _dir) = context();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_thread = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut header = vec![0u8; 16];
            header.extend_from_slice(&7u32.to_be_bytes());
            header.extend_from_slice(&99u32.to_be_bytes());
            header.extend_from_slice(&[0u8; 36]);
            use std::io::Write;
            stream.write_all(&header).unwrap();
            // No response bytes should follow; the peer closes instead.
            let mut buf = [0u8; 1];
            use std::io::Read;
            let n = stream.read(&mut buf).unwrap_or(0);
            assert_eq!(n, 0);
        });
        let (stream, _) = listener.accept().unwrap();
        let result = handle_connection(stream, &context);
        assert!(matches!(result, Err(SessionError::UnknownSource(99))));
        client_thread.join().unwrap();
    }
}
