use crate::tm::config::Program;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Lifecycle state of one process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Failed,
    Restarting,
}

impl ProcessState {
    /// Active means the instance owns (or is about to own) a live child.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProcessState::Running | ProcessState::Starting | ProcessState::Restarting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "STOPPED",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Failed => "FAILED",
            ProcessState::Restarting => "RESTARTING",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Book-keeping record for one spawned child. Lives in the supervisor table
/// and is mutated only under the supervisor lock; the OS child handle itself
/// is owned by the instance's monitor task, never stored here.
#[derive(Debug)]
pub struct ProcessInstance {
    /// `"<program>_<index>"`, index in `[0, numprocs)`.
    pub name: String,
    /// Effective program configuration snapshot used for this spawn batch.
    pub config: Arc<Program>,
    /// Spawn-batch serial. A monitor acts on its instance only while the id
    /// still matches, so a monitor outliving a prune/respawn cannot clobber
    /// the replacement record.
    pub id: u64,
    pub pid: i32,
    pub state: ProcessState,
    pub start_time: Instant,
    /// Last observed exit status (128+signo for signal deaths). Meaningless
    /// until the instance has exited at least once.
    pub exit_code: i32,
    /// Consecutive restart attempts since the last operator-initiated start.
    pub restart_count: u32,
    /// Courtesy wake-up for the monitor's backoff sleep; correctness relies
    /// on `manual_stop`, not on this channel.
    pub stop_tx: mpsc::Sender<()>,
    /// Latched under the supervisor lock when the operator (or a reload)
    /// stops the instance; the monitor checks it before any respawn.
    pub manual_stop: bool,
}

impl ProcessInstance {
    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            name: self.name.clone(),
            state: self.state,
            pid: self.pid,
            uptime_secs: if self.state == ProcessState::Running {
                Some(self.start_time.elapsed().as_secs())
            } else {
                None
            },
            exit_code: self.exit_code,
            restart_count: self.restart_count,
        }
    }
}

/// Deep-copied instance view returned by `get_status` and serialized to the
/// web hub. No handle back into the supervisor table.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub state: ProcessState,
    pub pid: i32,
    pub uptime_secs: Option<u64>,
    pub exit_code: i32,
    pub restart_count: u32,
}
