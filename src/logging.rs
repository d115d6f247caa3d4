//! Tracing subscriber setup.

use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level`. With a `log_file`, output is also written
/// to a daily-rotated file next to it; the returned guard flushes that file
/// and must be held until exit.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard) = match log_file {
        Some(path) => {
            let (file, guard) = rolling_writer(path)?;
            (BoxMakeWriter::new(io::stderr.and(file)), Some(guard))
        }
        None => (BoxMakeWriter::new(io::stderr), None),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(guard.is_none())
        .try_init();

    Ok(guard)
}

fn rolling_writer(path: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("log_file '{}' has no file name", path.display())))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let appender = tracing_appender::rolling::daily(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}
