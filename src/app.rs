//! Wires configuration, the device registry, and the UDP/TCP listeners
//! together and drives the top-level run/shutdown lifecycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::Config;
use crate::device::{DeviceManager, ServerIdentity};
use crate::discovery::DiscoveryResponder;
use crate::server::Server;

/// Shared, read-only-ish context every plugin and server component needs:
/// the registry, the daemon's own identity, and filesystem roots for
/// per-plugin configuration. Passed down instead of a monolithic app
/// object so plugins never need the whole app (breaks the cyclic
/// parent-link the source has between plugins and their owning app).
pub struct AppContext {
    pub registry: Arc<DeviceManager>,
    pub config_dir: PathBuf,
    pub plugins_dir: PathBuf,
    pub runtime_dir: PathBuf,
}

pub struct App {
    pub config: Config,
    pub context: Arc<AppContext>,
    pub port: u16,
}

impl App {
    pub fn init(config_dir: PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let config = Config::load(&config_dir)?;
        // `daemon::start` marks the detached child it spawns with this
        // variable so its logs go to the rotating file instead of the
        // `/dev/null` stderr it was launched with.
        let daemonized = std::env::var_os("DCNNT_DAEMON_CHILD").is_some();
        crate::logging::init(&config.log, daemonized)?;

        let runtime_dir = runtime_dir();
        std::env::set_var("DCNNT_CONFIG_DIR", &config_dir);
        std::env::set_var("DCNNT_RUNTIME_DIR", &runtime_dir);

        let devices_dir = config_dir.join("devices");
        let plugins_dir = config_dir.join("plugins");
        std::fs::create_dir_all(&plugins_dir)?;

        let server_identity = ServerIdentity {
            uin: config.self_.uin,
            name: config.self_.name.clone(),
            password: config.self_.password.clone(),
        };
        let registry = Arc::new(DeviceManager::load(&devices_dir, server_identity)?);

        let context = Arc::new(AppContext {
            registry,
            config_dir: config_dir.clone(),
            plugins_dir,
            runtime_dir,
        });

        Ok(Self {
            port: config.port,
            config,
            context,
        })
    }

    /// Spawn the UDP discovery responder and TCP session server threads.
    /// Returns a handle the caller can join on shutdown.
    pub fn run(&self) -> std::io::Result<AppHandles> {
        let stop = Arc::new(AtomicBool::new(false));

        let discovery = Arc::new(DiscoveryResponder::bind(self.port, self.context.registry.clone())?);
        let discovery_thread = {
            let discovery = discovery.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("udp-discovery".into())
                .spawn(move || discovery.run(&stop))?
        };

        let server = Arc::new(Server::bind(self.port, self.context.clone())?);
        let server_thread = {
            let server = server.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("tcp-session-server".into())
                .spawn(move || server.run(&stop))?
        };

        Ok(AppHandles {
            stop,
            discovery_thread,
            server_thread,
        })
    }

    /// One-shot pairing mode: run only the discovery responder with an
    /// active pairing code until a device successfully pairs or SIGINT
    /// fires. Returns `true` on successful pairing.
    pub fn pair(&self, pairing_code: String, sigint: &AtomicBool) -> bool {
        let responder = match DiscoveryResponder::bind_for_pairing(
            self.port,
            self.context.registry.clone(),
            pairing_code,
        ) {
            Ok(r) => r,
            Err(e) => {
                log::error!("failed to bind pairing socket: {}", e);
                return false;
            }
        };
        let stop = Arc::new(AtomicBool::new(false));
        let poll_stop = stop.clone();
        let responder = Arc::new(responder);
        let watch_responder = responder.clone();
        let watcher = std::thread::spawn(move || loop {
            if sigint.load(Ordering::Relaxed) {
                poll_stop.store(true, Ordering::Relaxed);
                return;
            }
            if matches!(
                watch_responder.pairing_state(),
                crate::discovery::PairingState::Paired { .. }
            ) {
                poll_stop.store(true, Ordering::Relaxed);
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(200));
        });
        responder.run(&stop);
        let _ = watcher.join();
        matches!(
            responder.pairing_state(),
            crate::discovery::PairingState::Paired { .. }
        )
    }
}

pub struct AppHandles {
    stop: Arc<AtomicBool>,
    discovery_thread: JoinHandle<()>,
    server_thread: JoinHandle<()>,
}

impl AppHandles {
    /// Orderly shutdown: stop accepting new work and join both listener
    /// threads. In-flight sessions finish on their own, since the stop
    /// flag only gates the accept/recv loops, not live connections.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.discovery_thread.join();
        let _ = self.server_thread.join();
    }
}

pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    // No portable way to get the uid without an extra crate; fall back to
    // $UID if the shell exported it, else a conventional default.
    let uid: u32 = std::env::var("UID").ok().and_then(|v| v.parse().ok()).unwrap_or(1000);
    PathBuf::from(format!("/var/run/user/{}", uid))
}
