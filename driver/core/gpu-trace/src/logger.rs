use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, OnceLock};

/// Records kept by default.
const DEFAULT_CAPACITY: usize = 4096;

/// One captured log record.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TraceRecord {
    pub level: Level,
    pub target: String,
    pub message: String,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.level, self.target, self.message)
    }
}

pub struct TraceLogger {
    max_level: LevelFilter,
    capacity: usize,
    echo: bool,
    ring: Mutex<VecDeque<TraceRecord>>,
}

static INSTALLED: OnceLock<&'static TraceLogger> = OnceLock::new();

impl TraceLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self {
            max_level,
            capacity: DEFAULT_CAPACITY,
            echo: cfg!(feature = "stderr"),
            ring: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    #[inline]
    #[must_use]
    pub const fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Register as the global logger.
    ///
    /// # Errors
    /// Fails if any logger was already registered.
    pub fn init(self) -> Result<&'static Self, SetLoggerError> {
        let this: &'static Self = Box::leak(Box::new(self));
        log::set_logger(this)?;
        log::set_max_level(this.max_level);
        let _ = INSTALLED.set(this);
        Ok(this)
    }

    /// The process-wide trace logger, registering one on first use.
    ///
    /// Later calls return the first instance regardless of `max_level`. If a
    /// foreign logger is already registered, the returned instance stays empty.
    pub fn install(max_level: LevelFilter) -> &'static Self {
        INSTALLED.get_or_init(|| {
            let this: &'static Self = Box::leak(Box::new(Self::new(max_level).with_echo(false)));
            if log::set_logger(this).is_ok() {
                log::set_max_level(max_level);
            }
            this
        })
    }

    /// Copy of the buffered records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TraceRecord> {
        self.ring
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return the buffered records.
    pub fn drain(&self) -> Vec<TraceRecord> {
        self.ring
            .lock()
            .map(|mut r| r.drain(..).collect())
            .unwrap_or_default()
    }

    /// Whether a buffered record of `target` contains `needle`.
    #[must_use]
    pub fn contains(&self, target: &str, needle: &str) -> bool {
        self.ring.lock().is_ok_and(|r| {
            r.iter()
                .any(|rec| rec.target == target && rec.message.contains(needle))
        })
    }
}

impl Log for TraceLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let rec = TraceRecord {
            level: record.level(),
            target: record.target().to_owned(),
            message: record.args().to_string(),
        };
        if self.echo {
            eprintln!("{rec}");
        }
        if self.capacity == 0 {
            return;
        }
        if let Ok(mut ring) = self.ring.lock() {
            while ring.len() >= self.capacity {
                ring.pop_front();
            }
            ring.push_back(rec);
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(logger: &TraceLogger, level: Level, target: &str, msg: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target(target)
                .args(format_args!("{msg}"))
                .build(),
        );
    }

    #[test]
    fn filters_by_level() {
        let l = TraceLogger::new(LevelFilter::Info).with_echo(false);
        record(&l, Level::Debug, "vram", "hidden");
        record(&l, Level::Warn, "vram", "shown");
        let snap = l.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].to_string(), "[WARN] vram: shown");
    }

    #[test]
    fn ring_keeps_newest() {
        let l = TraceLogger::new(LevelFilter::Trace)
            .with_capacity(2)
            .with_echo(false);
        for m in ["a", "b", "c"] {
            record(&l, Level::Info, "t", m);
        }
        let msgs: Vec<_> = l.drain().into_iter().map(|r| r.message).collect();
        assert_eq!(msgs, ["b", "c"]);
        assert!(l.snapshot().is_empty());
    }

    #[test]
    fn contains_matches_target_and_text() {
        let l = TraceLogger::new(LevelFilter::Trace).with_echo(false);
        record(&l, Level::Error, "channel", "channel 3 failed to pause");
        assert!(l.contains("channel", "failed"));
        assert!(!l.contains("swap", "failed"));
        assert!(!l.contains("channel", "resumed"));
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let l = TraceLogger::new(LevelFilter::Trace)
            .with_capacity(0)
            .with_echo(false);
        record(&l, Level::Error, "t", "x");
        assert!(l.snapshot().is_empty());
    }
}
