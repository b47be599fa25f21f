use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskmaster::tm::config;
use taskmaster::tm::instance::ProcessState;
use taskmaster::tm::logger::Logger;
use taskmaster::tm::supervisor::{StatusSnapshot, Supervisor};
use tempfile::TempDir;

/// One supervisor wired to a throwaway config file and log sink.
pub struct Harness {
    pub dir: TempDir,
    pub config_path: PathBuf,
    pub supervisor: Supervisor,
}

pub fn harness(yaml: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("taskmaster.yml");
    std::fs::write(&config_path, yaml).unwrap();

    let logger = Arc::new(Logger::new(&dir.path().join("taskmaster.log")).unwrap());
    let cfg = config::load(&config_path).unwrap();
    Harness {
        supervisor: Supervisor::new(cfg, logger),
        config_path,
        dir,
    }
}

impl Harness {
    /// Overwrite the config file in place (reload tests).
    #[allow(dead_code)]
    pub fn rewrite_config(&self, yaml: &str) {
        std::fs::write(&self.config_path, yaml).unwrap();
    }
}

/// Poll `get_status` until `pred` holds, panicking with the last snapshot on
/// timeout.
pub async fn wait_for<F>(supervisor: &Supervisor, timeout: Duration, mut pred: F) -> StatusSnapshot
where
    F: FnMut(&StatusSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = supervisor.get_status().await;
        if pred(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}; last status: {snapshot:#?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// True when `program` has exactly `n` instances, all in `state`.
pub fn all_in_state(
    snapshot: &StatusSnapshot,
    program: &str,
    state: ProcessState,
    n: usize,
) -> bool {
    snapshot
        .get(program)
        .map(|instances| instances.len() == n && instances.iter().all(|i| i.state == state))
        .unwrap_or(false)
}
