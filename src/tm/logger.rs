use chrono::Local;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// A single log line, as published to broadcast subscribers (web hub).
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub ts: String,
    pub level: String,
    pub message: String,
}

/// Append-only text logger shared across the daemon.
///
/// Lines go to the sink file and are echoed to the console; subscribers
/// (the web hub) get a copy over a broadcast channel. Failing to open the
/// sink at startup is the daemon's only fatal condition.
pub struct Logger {
    sink: Mutex<File>,
    tx: broadcast::Sender<LogLine>,
}

impl Logger {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let sink = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, _) = broadcast::channel(256);
        Ok(Self {
            sink: Mutex::new(sink),
            tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.write("INFO", message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.write("ERROR", message.as_ref());
    }

    fn write(&self, level: &str, message: &str) {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let line = format!("[{ts}] {level}: {message}");

        {
            let mut sink = self.sink.lock().unwrap_or_else(|p| p.into_inner());
            let _ = writeln!(sink, "{line}");
        }
        println!("{line}");

        // no receivers is fine; send only fails when nobody is listening
        let _ = self.tx.send(LogLine {
            ts,
            level: level.to_string(),
            message: message.to_string(),
        });
    }
}
