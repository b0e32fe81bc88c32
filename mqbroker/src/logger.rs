use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use slog::{o, Drain};

use mqbroker_conf::logging::To;
use mqbroker_conf::Log;

pub use slog::Logger;

/// Routes the `log` macros used throughout the broker into an async slog
/// drain configured by the `[log]` section.
pub fn logger_init(cfg: &Log) -> Result<()> {
    let level = cfg.level.inner();
    let root = config_logger(cfg.filename(), cfg.to, level)?;
    log::set_boxed_logger(Box::new(Bridge(root))).map_err(|e| anyhow!(e))?;
    log::set_max_level(to_log_level(level).to_level_filter());
    Ok(())
}

/// Builds a root logger writing plain text lines to the selected outputs.
pub fn config_logger(filename: String, to: To, level: slog::Level) -> Result<Logger> {
    let decorator = slog_term::PlainDecorator::new(Outputs::open(&filename, to)?);
    let format = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|w: &mut dyn Write| write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f")))
        .build()
        .filter_level(level)
        .fuse();

    let drain = slog_async::Async::new(format)
        .chan_size(16 * 1024)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Ok(Logger::root(drain, o!()))
}

struct Bridge(Logger);

impl log::Log for Bridge {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let location = slog::RecordLocation {
            file: record.file_static().unwrap_or("?"),
            line: record.line().unwrap_or(0),
            column: 0,
            function: "",
            module: record.module_path_static().unwrap_or("?"),
        };
        let rs = slog::RecordStatic { location: &location, level: to_slog_level(record.level()), tag: record.target() };
        self.0.log(&slog::Record::new(&rs, record.args(), slog::b!()))
    }

    fn flush(&self) {}
}

fn to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Error => slog::Level::Error,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Info => slog::Level::Info,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Trace => slog::Level::Trace,
    }
}

fn to_log_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Critical | slog::Level::Error => log::Level::Error,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Info => log::Level::Info,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Trace => log::Level::Trace,
    }
}

/// Console and/or append-mode file, every line goes to all of them.
struct Outputs(Vec<Box<dyn Write + Send>>);

impl Outputs {
    fn open(filename: &str, to: To) -> Result<Self> {
        let mut outs: Vec<Box<dyn Write + Send>> = Vec::new();
        if to.console() {
            outs.push(Box::new(io::stdout()));
        }
        if to.file() {
            if let Some(dir) = Path::new(filename).parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)
                .map_err(|e| anyhow!("cannot open log file {}: {}", filename, e))?;
            outs.push(Box::new(file));
        }
        Ok(Self(outs))
    }
}

impl Write for Outputs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for out in self.0.iter_mut() {
            out.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.iter_mut().try_for_each(|out| out.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_conversion() {
        assert_eq!(to_slog_level(log::Level::Warn), slog::Level::Warning);
        assert_eq!(to_log_level(slog::Level::Critical), log::Level::Error);
        for l in [log::Level::Error, log::Level::Info, log::Level::Trace] {
            assert_eq!(to_log_level(to_slog_level(l)), l);
        }
    }

    #[test]
    fn test_file_output() {
        let dir = std::env::temp_dir().join(format!("mqbroker-logger-{}", std::process::id()));
        let filename = dir.join("broker.log").to_string_lossy().into_owned();
        let logger = config_logger(filename.clone(), To::File, slog::Level::Info).unwrap();
        slog::warn!(logger, "session {} expired", "c1");
        slog::debug!(logger, "not written");
        drop(logger);
        std::thread::sleep(std::time::Duration::from_millis(200));
        let content = std::fs::read_to_string(&filename).unwrap();
        assert!(content.contains("session c1 expired"));
        assert!(!content.contains("not written"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
