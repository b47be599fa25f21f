use crate::tm::config::{Program, RestartPolicy};
use crate::tm::instance::ProcessState;
use crate::tm::supervisor::Supervisor;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time as tokio_time;

/// Launch the monitor task for a freshly spawned instance. The monitor owns
/// the OS child handle; the supervisor never waits on a child directly.
pub(crate) fn spawn(
    supervisor: Supervisor,
    program: String,
    instance: String,
    id: u64,
    config: Arc<Program>,
    child: Child,
    stop_rx: mpsc::Receiver<()>,
) {
    tokio::spawn(run(supervisor, program, instance, id, config, child, stop_rx));
}

enum Decision {
    Done,
    Restart,
}

async fn run(
    supervisor: Supervisor,
    program: String,
    instance: String,
    id: u64,
    config: Arc<Program>,
    mut child: Child,
    mut stop_rx: mpsc::Receiver<()>,
) {
    loop {
        // Start-grace window: race the child's exit against the starttime
        // sleep so an early death is observed directly instead of inferred
        // from a stale handle. Only a survivor is marked RUNNING.
        let early_exit = tokio::select! {
            biased;
            res = child.wait() => Some(res),
            _ = tokio_time::sleep(Duration::from_secs(config.starttime)) => None,
        };

        let wait_result = match early_exit {
            Some(res) => res,
            None => {
                {
                    let mut inner = supervisor.write_inner().await;
                    if let Some(inst) = inner.find_instance_mut(&program, &instance, id) {
                        if inst.state == ProcessState::Starting && !inst.manual_stop {
                            inst.state = ProcessState::Running;
                            supervisor
                                .log()
                                .info(format!("process {instance} successfully started and running"));
                            supervisor.notify_status_locked(&inner);
                        }
                    }
                }
                child.wait().await
            }
        };

        let exit_code = exit_code_of(&wait_result);

        let decision = {
            let mut inner = supervisor.write_inner().await;
            let Some(inst) = inner.find_instance_mut(&program, &instance, id) else {
                // pruned or superseded while we were waiting
                return;
            };
            inst.exit_code = exit_code;

            match &wait_result {
                Ok(status) if status.success() => supervisor
                    .log()
                    .info(format!("process {instance} exited normally")),
                Ok(_) => supervisor
                    .log()
                    .error(format!("process {instance} exited with code {exit_code}")),
                Err(e) => supervisor
                    .log()
                    .error(format!("failed to wait on process {instance}: {e}")),
            }

            if inst.manual_stop {
                supervisor
                    .log()
                    .info(format!("process {instance} was manually stopped, not restarting"));
                inst.state = ProcessState::Stopped;
                supervisor.notify_status_locked(&inner);
                Decision::Done
            } else {
                let wants_restart =
                    should_restart(config.autorestart, exit_code, &config.exitcodes);
                if wants_restart && inst.restart_count < config.startretries {
                    inst.state = ProcessState::Restarting;
                    inst.restart_count += 1;
                    supervisor.log().info(format!(
                        "restarting process {instance} (attempt {}/{})",
                        inst.restart_count, config.startretries
                    ));
                    supervisor.notify_status_locked(&inner);
                    Decision::Restart
                } else {
                    inst.state = if wants_restart {
                        supervisor
                            .log()
                            .error(format!("process {instance} failed too many times, giving up"));
                        ProcessState::Failed
                    } else if config.is_expected_exit(exit_code) {
                        supervisor.log().info(format!(
                            "process {instance} terminated naturally with expected code {exit_code}"
                        ));
                        ProcessState::Stopped
                    } else {
                        supervisor.log().info(format!(
                            "process {instance} terminated with unexpected code {exit_code}"
                        ));
                        ProcessState::Failed
                    };
                    supervisor.notify_status_locked(&inner);
                    Decision::Done
                }
            }
        };

        match decision {
            Decision::Done => return,
            Decision::Restart => {}
        }

        // Backoff outside the lock. The stop channel is a courtesy wake-up;
        // manual_stop is re-checked under the lock either way.
        tokio::select! {
            _ = tokio_time::sleep(Duration::from_secs(1)) => {}
            _ = stop_rx.recv() => {}
        }

        let mut inner = supervisor.write_inner().await;
        let Some(inst) = inner.find_instance_mut(&program, &instance, id) else {
            return;
        };
        if inst.manual_stop {
            inst.state = ProcessState::Stopped;
            supervisor
                .log()
                .info(format!("process {instance} was manually stopped, not restarting"));
            supervisor.notify_status_locked(&inner);
            return;
        }

        inst.manual_stop = false;
        match supervisor.spawn_child(&instance, &config) {
            Ok(new_child) => {
                inst.pid = new_child.id().unwrap_or_default() as i32;
                inst.start_time = Instant::now();
                inst.state = ProcessState::Starting;
                supervisor
                    .log()
                    .info(format!("started process {instance} (PID: {})", inst.pid));
                supervisor.notify_status_locked(&inner);
                drop(inner);
                child = new_child;
            }
            Err(e) => {
                inst.exit_code = 1;
                inst.state = ProcessState::Failed;
                supervisor
                    .log()
                    .error(format!("failed to restart process {instance}: {e}"));
                supervisor.notify_status_locked(&inner);
                return;
            }
        }
    }
}

/// OS-convention exit code: 128+signo for signal deaths, the raw status
/// otherwise. A wait that never produced a status reports 1.
fn exit_code_of(result: &std::io::Result<ExitStatus>) -> i32 {
    match result {
        Ok(status) => {
            if let Some(sig) = status.signal() {
                128 + sig
            } else {
                status.code().unwrap_or(1)
            }
        }
        Err(_) => 1,
    }
}

/// The `autorestart` policy decision for one observed exit.
pub(crate) fn should_restart(policy: RestartPolicy, exit_code: i32, exitcodes: &[i32]) -> bool {
    match policy {
        RestartPolicy::Always => true,
        RestartPolicy::Never => false,
        RestartPolicy::Unexpected => !exitcodes.contains(&exit_code),
    }
}
