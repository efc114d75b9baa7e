//! Logger setup: a console logger in the foreground, or a size-rotated
//! file logger once daemonized. Grounded on
//! `original_source/dcnnt/app.py::init_logger`, which attaches a rotating
//! file handler (`RotatingFileHandler(path, maxBytes=size, backupCount=count)`)
//! in daemon mode and a stream handler in foreground mode.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use env_logger::Builder;
use log::LevelFilter;

use crate::config::LogSection;

/// A `Write` implementation that rotates `path` to `path.1`, `path.2`, ...
/// up to `count` backups whenever a write would push it past `max_bytes`.
/// No rotation crate appears anywhere in the example pack, so this is
/// hand-rolled rather than borrowed.
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    count: u32,
    file: File,
    written: u64,
}

impl RotatingFile {
    fn open(path: PathBuf, max_bytes: u64, count: u32) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            count,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        for i in (1..self.count).rev() {
            let from = self.backup_path(i);
            let to = self.backup_path(i + 1);
            if from.exists() {
                let _ = fs::rename(&from, &to);
            }
        }
        if self.count > 0 {
            let _ = fs::rename(&self.path, self.backup_path(1));
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// A `Write` sink shared between `env_logger`'s formatting thread and the
/// underlying rotating file, since `env_logger::Builder::target` needs a
/// type that is both `Write` and `Send + Sync`.
struct SharedRotatingFile(Mutex<RotatingFile>);

impl Write for &SharedRotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

fn level_filter(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Initialize the global logger. `daemonized` selects the target: console
/// when running in the foreground (even if `log.path` is set, so `foreground`
/// mode stays useful for interactive debugging), the rotating file
/// otherwise.
pub fn init(log: &LogSection, daemonized: bool) -> io::Result<()> {
    let filter = level_filter(&log.level);
    let mut builder = Builder::new();
    builder.filter_level(filter);

    match (&log.path, daemonized) {
        (Some(path), true) => {
            let rotating = RotatingFile::open(path.clone(), log.size, log.count)?;
            let shared: &'static SharedRotatingFile =
                Box::leak(Box::new(SharedRotatingFile(Mutex::new(rotating))));
            builder.target(env_logger::Target::Pipe(Box::new(PipeAdapter(shared))));
        }
        _ => {
            builder.target(env_logger::Target::Stderr);
        }
    }

    builder.format_timestamp_millis();
    let _ = builder.try_init();
    Ok(())
}

/// `env_logger::Target::Pipe` wants a boxed `Write`; this adapts our
/// `&'static SharedRotatingFile` reference into an owned one.
struct PipeAdapter(&'static SharedRotatingFile);

impl Write for PipeAdapter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&mut &*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&mut &*self.0).flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotating_file_rolls_over_past_max_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        let mut rotating = RotatingFile::open(path.clone(), 10, 2).unwrap();
        rotating.write_all(b"0123456789").unwrap();
        let backup = rotating.backup_path(1);
        rotating.write_all(b"more").unwrap();
        assert!(backup.exists());
        assert!(path.exists());
    }

    #[test]
    fn level_filter_parses_known_levels() {
        assert_eq!(level_filter("debug"), LevelFilter::Debug);
        assert_eq!(level_filter("WARN"), LevelFilter::Warn);
        assert_eq!(level_filter("nonsense"), LevelFilter::Info);
    }
}
