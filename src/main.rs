//! CLI entry point: mode dispatch over `{doc, foreground, pair, start,
//! stop, restart}`, grounded on `original_source/dcnnt/dcnnt.py`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};

use dcnntd_lib::app::App;
use dcnntd_lib::config::Config;
use dcnntd_lib::daemon;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Doc,
    Foreground,
    Pair,
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Parser)]
#[command(name = "dcnntd", about = "dcnnt pairing/session daemon")]
struct Cli {
    /// Path to configuration directory
    #[arg(short = 'c', long = "configuration-directory")]
    configuration_directory: Option<PathBuf>,

    /// Mode to run program in
    #[arg(value_enum, default_value_t = Mode::Start)]
    mode: Mode,
}

fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".config")
        .join("dcnnt")
}

fn install_sigint_handler() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    }) {
        log::warn!("failed to install SIGINT handler: {}", e);
    }
    flag
}

fn run_foreground(config_dir: PathBuf) -> ExitCode {
    let app = match App::init(config_dir) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("failed to initialize: {}", e);
            return ExitCode::from(1);
        }
    };
    let handles = match app.run() {
        Ok(h) => h,
        Err(e) => {
            eprintln!("failed to start listeners: {}", e);
            return ExitCode::from(1);
        }
    };
    let sigint = install_sigint_handler();
    while !sigint.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    log::info!("shutting down");
    handles.shutdown();
    ExitCode::SUCCESS
}

fn run_pair(config_dir: PathBuf) -> ExitCode {
    let app = match App::init(config_dir) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("failed to initialize: {}", e);
            return ExitCode::from(1);
        }
    };
    let code = format!("{:06}", rand::random::<u32>() % 900_000 + 100_000);
    println!("App running in pairing mode");
    println!("Pair code:\n\n    {}-{}    \n", &code[..3], &code[3..]);
    let sigint = install_sigint_handler();
    let paired = app.pair(code, &sigint);
    if paired {
        println!("Successful pairing");
        ExitCode::SUCCESS
    } else {
        println!("Pairing failed");
        ExitCode::from(1)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_dir = cli
        .configuration_directory
        .unwrap_or_else(default_config_dir);

    match cli.mode {
        Mode::Doc => {
            println!("{}", Config::doc());
            ExitCode::SUCCESS
        }
        Mode::Foreground => run_foreground(config_dir),
        Mode::Pair => run_pair(config_dir),
        Mode::Start => {
            let config = match Config::load(&config_dir) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("failed to load configuration: {}", e);
                    return ExitCode::from(1);
                }
            };
            let pidfile = daemon::pidfile_path(config.pidfile.as_deref(), &dcnntd_lib::app::runtime_dir());
            match daemon::start(&pidfile, &config_dir) {
                Ok(()) => {
                    println!("Starting in background, pidfile: {}", pidfile.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::from(1)
                }
            }
        }
        Mode::Stop => {
            let config = match Config::load(&config_dir) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("failed to load configuration: {}", e);
                    return ExitCode::from(1);
                }
            };
            let pidfile = daemon::pidfile_path(config.pidfile.as_deref(), &dcnntd_lib::app::runtime_dir());
            match daemon::stop(&pidfile) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::from(1)
                }
            }
        }
        Mode::Restart => {
            let config = match Config::load(&config_dir) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("failed to load configuration: {}", e);
                    return ExitCode::from(1);
                }
            };
            let pidfile = daemon::pidfile_path(config.pidfile.as_deref(), &dcnntd_lib::app::runtime_dir());
            match daemon::restart(&pidfile, &config_dir) {
                Ok(()) => {
                    println!("Restarting, pidfile: {}", pidfile.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::from(1)
                }
            }
        }
    }
}
