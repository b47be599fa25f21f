use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::time as tokio_time;

/// Signal names accepted in program configuration (`stopsignal`).
pub const SIGNAL_TABLE: &[(&str, Signal)] = &[
    ("TERM", Signal::SIGTERM),
    ("KILL", Signal::SIGKILL),
    ("INT", Signal::SIGINT),
    ("HUP", Signal::SIGHUP),
    ("USR1", Signal::SIGUSR1),
    ("USR2", Signal::SIGUSR2),
    ("QUIT", Signal::SIGQUIT),
    ("STOP", Signal::SIGSTOP),
    ("CONT", Signal::SIGCONT),
];

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("unknown signal: {0}")]
    Unknown(String),
    #[error("failed to signal pid {pid}: {source}")]
    Os { pid: i32, source: nix::Error },
}

/// Outcome of a graceful stop attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process exited within the grace window.
    Terminated,
    /// The grace window expired and SIGKILL was sent.
    Killed,
}

pub fn resolve(name: &str) -> Result<Signal, SignalError> {
    SIGNAL_TABLE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, s)| *s)
        .ok_or_else(|| SignalError::Unknown(name.to_string()))
}

pub fn is_valid(name: &str) -> bool {
    resolve(name).is_ok()
}

pub fn send(pid: i32, name: &str) -> Result<(), SignalError> {
    let sig = resolve(name)?;
    kill(Pid::from_raw(pid), sig).map_err(|source| SignalError::Os { pid, source })
}

/// Signal-0 liveness probe.
pub fn alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Send `stop_signal` to `pid`, then poll liveness every 100 ms. If the
/// process is still alive when `timeout` expires, escalate to SIGKILL.
pub async fn graceful_stop(
    pid: i32,
    stop_signal: &str,
    timeout: Duration,
) -> Result<StopOutcome, SignalError> {
    send(pid, stop_signal)?;

    let deadline = tokio_time::Instant::now() + timeout;
    loop {
        if !alive(pid) {
            return Ok(StopOutcome::Terminated);
        }
        if tokio_time::Instant::now() >= deadline {
            break;
        }
        tokio_time::sleep(Duration::from_millis(100)).await;
    }

    kill(Pid::from_raw(pid), Signal::SIGKILL)
        .map_err(|source| SignalError::Os { pid, source })?;
    Ok(StopOutcome::Killed)
}
