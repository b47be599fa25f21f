use crate::tm::config::{self, Config, ConfigError, Program};
use crate::tm::instance::{InstanceStatus, ProcessInstance, ProcessState};
use crate::tm::logger::Logger;
use crate::tm::monitor;
use crate::tm::signals::{self, StopOutcome};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::sync::{mpsc, RwLock, RwLockWriteGuard};
use tokio::time as tokio_time;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("program {0} not found in configuration")]
    UnknownProgram(String),
    #[error("program {name} has {active} active process(es) running")]
    AlreadyRunning { name: String, active: usize },
    #[error("failed to start some instances: {}", .failures.join("; "))]
    SpawnFailed { failures: Vec<String> },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Deep-copied table view: program name to per-instance status, index order.
pub type StatusSnapshot = HashMap<String, Vec<InstanceStatus>>;

pub(crate) struct Inner {
    pub(crate) programs: HashMap<String, Program>,
    pub(crate) processes: HashMap<String, Vec<ProcessInstance>>,
}

impl Inner {
    /// Locate an instance by program, name and spawn-batch id. Monitors use
    /// this after every suspension; a `None` means the record was pruned and
    /// possibly replaced, and the caller must stand down.
    pub(crate) fn find_instance_mut(
        &mut self,
        program: &str,
        instance: &str,
        id: u64,
    ) -> Option<&mut ProcessInstance> {
        self.processes
            .get_mut(program)?
            .iter_mut()
            .find(|i| i.name == instance && i.id == id)
    }

    fn active_count(&self, program: &str) -> usize {
        self.processes
            .get(program)
            .map(|v| v.iter().filter(|i| i.state.is_active()).count())
            .unwrap_or(0)
    }

    fn snapshot(&self) -> StatusSnapshot {
        self.processes
            .iter()
            .map(|(name, instances)| {
                (
                    name.clone(),
                    instances.iter().map(|i| i.status()).collect(),
                )
            })
            .collect()
    }
}

/// The supervision core: owns the program table and all instance
/// book-keeping behind one reader/writer lock. Cheap to clone; clones share
/// state, the way monitor tasks expect.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<RwLock<Inner>>,
    logger: Arc<Logger>,
    status_tx: broadcast::Sender<StatusSnapshot>,
    next_spawn_id: Arc<AtomicU64>,
}

impl Supervisor {
    pub fn new(config: Config, logger: Arc<Logger>) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                programs: config.programs,
                processes: HashMap::new(),
            })),
            logger,
            status_tx,
            next_spawn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Status change feed for the web hub. Every externally visible state
    /// mutation publishes a fresh snapshot here.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    /// Start every program configured with `autostart: true`, aggregating
    /// per-program failures.
    pub async fn start_autostart(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner.write().await;
        let mut names: Vec<String> = inner
            .programs
            .iter()
            .filter(|(_, p)| p.autostart)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();

        let mut failures = Vec::new();
        for name in &names {
            if let Err(e) = self.start_locked(&mut inner, name) {
                self.logger
                    .error(format!("failed to start program {name}: {e}"));
                failures.push(format!("{name}: {e}"));
            }
        }
        self.notify_status_locked(&inner);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::SpawnFailed { failures })
        }
    }

    pub async fn start_program(&self, name: &str) -> Result<(), SupervisorError> {
        let mut inner = self.inner.write().await;
        let result = self.start_locked(&mut inner, name);
        self.notify_status_locked(&inner);
        result
    }

    pub async fn stop_program(&self, name: &str) -> Result<(), SupervisorError> {
        let mut inner = self.inner.write().await;
        let result = self.stop_locked(&mut inner, name).await;
        self.notify_status_locked(&inner);
        result
    }

    /// Stop, give children a moment to settle, then start again.
    pub async fn restart_program(&self, name: &str) -> Result<(), SupervisorError> {
        self.stop_program(name).await?;
        tokio_time::sleep(Duration::from_secs(2)).await;
        self.start_program(name).await
    }

    /// Stop every program that has an instance sequence. Used by the shell
    /// exit path and signal-driven shutdown; failures are logged, not fatal.
    pub async fn stop_all(&self) {
        let mut inner = self.inner.write().await;
        let mut names: Vec<String> = inner.processes.keys().cloned().collect();
        names.sort();
        for name in &names {
            if let Err(e) = self.stop_locked(&mut inner, name).await {
                self.logger
                    .error(format!("error stopping program {name} during shutdown: {e}"));
            }
        }
        self.notify_status_locked(&inner);
    }

    pub async fn get_status(&self) -> StatusSnapshot {
        let inner = self.inner.read().await;
        inner.snapshot()
    }

    /// Diff-and-apply a new configuration against the running table. A load
    /// error aborts with no mutation.
    pub async fn reload_config(&self, path: &Path) -> Result<(), SupervisorError> {
        let mut inner = self.inner.write().await;
        let new_config = config::load(path)?;

        let old_programs = std::mem::replace(&mut inner.programs, new_config.programs);

        let mut names: Vec<String> = inner.programs.keys().cloned().collect();
        names.sort();
        for name in &names {
            let new_program = inner.programs[name].clone();
            match old_programs.get(name) {
                None => {
                    if new_program.autostart {
                        self.logger.info(format!("starting new program {name}"));
                        if let Err(e) = self.start_locked(&mut inner, name) {
                            self.logger
                                .error(format!("failed to start new program {name}: {e}"));
                        }
                    }
                }
                Some(old_program) if *old_program == new_program => {}
                Some(_) => {
                    self.logger
                        .info(format!("program {name} configuration changed, restarting"));
                    match self.stop_locked(&mut inner, name).await {
                        Err(SupervisorError::UnknownProgram(_)) => {}
                        Err(e) => self
                            .logger
                            .error(format!("failed to stop program {name} for restart: {e}")),
                        Ok(()) => {}
                    }
                    if new_program.autostart {
                        if let Err(e) = self.start_locked(&mut inner, name) {
                            self.logger
                                .error(format!("failed to restart program {name}: {e}"));
                        }
                    }
                }
            }
        }

        let mut removed: Vec<String> = old_programs
            .keys()
            .filter(|n| !inner.programs.contains_key(*n))
            .cloned()
            .collect();
        removed.sort();
        for name in &removed {
            self.logger
                .info(format!("removing program {name} (no longer in configuration)"));
            match self.stop_locked(&mut inner, name).await {
                Err(SupervisorError::UnknownProgram(_)) => {}
                Err(e) => self
                    .logger
                    .error(format!("failed to stop removed program {name}: {e}")),
                Ok(()) => {}
            }
            inner.processes.remove(name);
        }

        self.notify_status_locked(&inner);
        self.logger.info("configuration reloaded successfully");
        Ok(())
    }

    /// Drop all STOPPED/FAILED instances; programs whose sequence becomes
    /// empty lose their table entry.
    pub async fn cleanup(&self) {
        let mut inner = self.inner.write().await;
        let names: Vec<String> = inner.processes.keys().cloned().collect();
        let mut cleaned = 0;
        for name in names {
            cleaned += Self::prune_dead(&mut inner, &name);
        }
        if cleaned > 0 {
            self.logger
                .info(format!("cleaned up {cleaned} dead process instances"));
        }
        self.notify_status_locked(&inner);
    }

    /// Per-program variant of [`cleanup`](Self::cleanup).
    pub async fn cleanup_program(&self, name: &str) {
        let mut inner = self.inner.write().await;
        let cleaned = Self::prune_dead(&mut inner, name);
        if cleaned > 0 {
            self.logger
                .info(format!("cleaned up {cleaned} dead instances for program {name}"));
        }
        self.notify_status_locked(&inner);
    }

    // -------- locked helpers --------

    /// Spawn `numprocs` fresh instances for `name`. Assumes the writer lock.
    fn start_locked(&self, inner: &mut Inner, name: &str) -> Result<(), SupervisorError> {
        let program = inner
            .programs
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownProgram(name.to_string()))?;

        let active = inner.active_count(name);
        if active > 0 {
            return Err(SupervisorError::AlreadyRunning {
                name: name.to_string(),
                active,
            });
        }

        let pruned = Self::prune_dead(inner, name);
        if pruned > 0 {
            self.logger
                .info(format!("auto-cleaned {pruned} dead instances for program {name}"));
        }

        let config = Arc::new(program);
        let mut failures = Vec::new();
        for i in 0..config.numprocs {
            let instance_name = format!("{name}_{i}");
            match self.spawn_child(&instance_name, &config) {
                Ok(child) => {
                    let pid = child.id().unwrap_or_default() as i32;
                    let id = self.next_spawn_id.fetch_add(1, Ordering::Relaxed);
                    let (stop_tx, stop_rx) = mpsc::channel(1);
                    inner
                        .processes
                        .entry(name.to_string())
                        .or_default()
                        .push(ProcessInstance {
                            name: instance_name.clone(),
                            config: Arc::clone(&config),
                            id,
                            pid,
                            state: ProcessState::Starting,
                            start_time: Instant::now(),
                            exit_code: 0,
                            restart_count: 0,
                            stop_tx,
                            manual_stop: false,
                        });
                    self.logger
                        .info(format!("started process {instance_name} (PID: {pid})"));
                    monitor::spawn(
                        self.clone(),
                        name.to_string(),
                        instance_name,
                        id,
                        Arc::clone(&config),
                        child,
                        stop_rx,
                    );
                }
                Err(e) => {
                    self.logger
                        .error(format!("failed to start process {instance_name}: {e}"));
                    failures.push(format!("{instance_name}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::SpawnFailed { failures })
        }
    }

    /// Gracefully stop every active instance of `name`. Assumes the writer
    /// lock; `manual_stop` is latched before the stop signal goes out, so no
    /// monitor can respawn once this returns.
    async fn stop_locked(&self, inner: &mut Inner, name: &str) -> Result<(), SupervisorError> {
        let instances = inner
            .processes
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownProgram(name.to_string()))?;

        let mut stopped = 0;
        for instance in instances.iter_mut() {
            if !instance.state.is_active() {
                continue;
            }
            instance.manual_stop = true;
            let _ = instance.stop_tx.try_send(());

            self.logger.info(format!(
                "stopping process {} with signal {} (timeout: {}s)",
                instance.name, instance.config.stopsignal, instance.config.stoptime
            ));
            match signals::graceful_stop(
                instance.pid,
                &instance.config.stopsignal,
                Duration::from_secs(instance.config.stoptime),
            )
            .await
            {
                Ok(StopOutcome::Terminated) => {
                    self.logger
                        .info(format!("process {} stopped gracefully", instance.name));
                    stopped += 1;
                }
                Ok(StopOutcome::Killed) => {
                    self.logger.info(format!(
                        "process {} did not exit in time, killed",
                        instance.name
                    ));
                    stopped += 1;
                }
                Err(e) => {
                    self.logger.error(format!(
                        "failed to stop process {} gracefully: {e}",
                        instance.name
                    ));
                }
            }
            instance.state = ProcessState::Stopped;
        }

        if stopped > 0 {
            self.logger.info(format!(
                "successfully stopped {stopped} process(es) for program {name}"
            ));
        }
        Ok(())
    }

    /// Remove dead (STOPPED/FAILED) instances; drop the entry when empty.
    /// Returns how many were removed.
    fn prune_dead(inner: &mut Inner, name: &str) -> usize {
        let Some(instances) = inner.processes.get_mut(name) else {
            return 0;
        };
        let before = instances.len();
        instances.retain(|i| i.state.is_active());
        let cleaned = before - instances.len();
        if instances.is_empty() {
            inner.processes.remove(name);
        }
        cleaned
    }

    // -------- shared with the monitor tasks --------

    pub(crate) async fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().await
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.logger
    }

    pub(crate) fn notify_status_locked(&self, inner: &Inner) {
        let _ = self.status_tx.send(inner.snapshot());
    }

    /// Spawn protocol: `sh -c` with the umask wrapper, env merged onto the
    /// inherited environment, append-mode redirections, own process group.
    /// Does not touch the table; the caller records the result.
    pub(crate) fn spawn_child(&self, instance: &str, config: &Program) -> std::io::Result<Child> {
        // umask is octal-checked by the loader, so the wrapper is always safe
        let command_line = format!("umask {}; exec {}", config.umask, config.cmd);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command_line);
        cmd.envs(&config.env);
        if !config.workingdir.is_empty() {
            cmd.current_dir(&config.workingdir);
        }
        cmd.stdout(self.redirect_target(instance, &config.stdout));
        cmd.stderr(self.redirect_target(instance, &config.stderr));
        cmd.process_group(0);
        cmd.spawn()
    }

    fn redirect_target(&self, instance: &str, path: &str) -> Stdio {
        use std::os::unix::fs::OpenOptionsExt;
        match path {
            "" => Stdio::inherit(),
            "/dev/null" => Stdio::null(),
            p => match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o666)
                .open(p)
            {
                Ok(file) => Stdio::from(file),
                Err(e) => {
                    self.logger
                        .error(format!("failed to open redirection {p} for {instance}: {e}"));
                    Stdio::null()
                }
            },
        }
    }
}
