use crate::tm::instance::{InstanceStatus, ProcessState};
use crate::tm::logger::Logger;
use crate::tm::signals;
use crate::tm::supervisor::Supervisor;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Interactive read-eval loop over the supervisor API.
pub struct Shell {
    supervisor: Supervisor,
    logger: Arc<Logger>,
    config_path: PathBuf,
}

impl Shell {
    pub fn new(supervisor: Supervisor, logger: Arc<Logger>, config_path: PathBuf) -> Self {
        Self {
            supervisor,
            logger,
            config_path,
        }
    }

    /// Run until EOF or an exit command. The exit path stops every program
    /// before returning.
    pub async fn run(&self) {
        println!("taskmaster shell started. Type 'help' for available commands.");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("taskmaster> ");
            let _ = std::io::stdout().flush();

            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if self.execute(line).await {
                break;
            }
        }

        self.logger.info("shell exiting, stopping all programs");
        self.supervisor.stop_all().await;
    }

    /// Returns true when the shell should terminate.
    async fn execute(&self, line: &str) -> bool {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let (command, args) = (parts[0], &parts[1..]);

        match command {
            "help" => show_help(),
            "status" => self.show_status().await,
            "start" => match args.first() {
                None => println!("Usage: start <program_name>"),
                Some(name) => self.start(name).await,
            },
            "stop" => match args.first() {
                None => println!("Usage: stop <program_name>"),
                Some(name) => self.stop(name).await,
            },
            "restart" => match args.first() {
                None => println!("Usage: restart <program_name>"),
                Some(name) => self.restart(name).await,
            },
            "reload" => self.reload().await,
            "clear" => match args.first() {
                None => {
                    println!("clearing dead processes from memory...");
                    self.supervisor.cleanup().await;
                    println!("dead processes cleared");
                }
                Some(name) => {
                    println!("clearing dead processes for program {name}...");
                    self.supervisor.cleanup_program(name).await;
                    println!("dead processes cleared for {name}");
                }
            },
            "quit" | "exit" => {
                println!("goodbye!");
                return true;
            }
            other => {
                println!("unknown command: {other}. Type 'help' for available commands.")
            }
        }
        false
    }

    async fn show_status(&self) {
        let status = self.supervisor.get_status().await;
        if status.is_empty() {
            println!("no programs running");
            return;
        }

        println!(
            "{:<20} {:<12} {:<8} {:<10} {:<8}",
            "NAME", "STATE", "PID", "UPTIME", "RESTARTS"
        );
        println!("{}", "-".repeat(70));

        let mut names: Vec<&String> = status.keys().collect();
        names.sort();
        for name in names {
            for instance in &status[name] {
                print_instance_row(instance);
            }
        }
    }

    async fn start(&self, name: &str) {
        println!("starting program {name}...");
        match self.supervisor.start_program(name).await {
            Ok(()) => println!("program {name} started successfully"),
            Err(e) => println!("error starting program {name}: {e}"),
        }
    }

    async fn stop(&self, name: &str) {
        println!("stopping program {name}...");
        match self.supervisor.stop_program(name).await {
            Ok(()) => println!("program {name} stopped successfully"),
            Err(e) => println!("error stopping program {name}: {e}"),
        }
    }

    async fn restart(&self, name: &str) {
        println!("restarting program {name}...");
        match self.supervisor.restart_program(name).await {
            Ok(()) => println!("program {name} restarted successfully"),
            Err(e) => println!("error restarting program {name}: {e}"),
        }
    }

    async fn reload(&self) {
        println!("reloading configuration...");
        match self.supervisor.reload_config(&self.config_path).await {
            Ok(()) => println!("configuration reloaded successfully"),
            Err(e) => println!("error reloading configuration: {e}"),
        }
    }
}

fn print_instance_row(instance: &InstanceStatus) {
    // A RUNNING pid that no longer answers signal 0 means the monitor has
    // not caught up with the exit yet; flag it rather than lie.
    if instance.state == ProcessState::Running && !signals::alive(instance.pid) {
        println!(
            "{:<20} {:<12} {:<8} {:<10} {:<8} (stale)",
            instance.name, "UNKNOWN", "-", "N/A", instance.restart_count
        );
        return;
    }

    let pid = if instance.state.is_active() {
        instance.pid.to_string()
    } else {
        "-".to_string()
    };
    let uptime = match instance.uptime_secs {
        Some(secs) => format!("{secs}s"),
        None => "N/A".to_string(),
    };

    println!(
        "{:<20} {}{:<12}\x1b[0m {:<8} {:<10} {:<8}",
        instance.name,
        state_color(instance.state),
        instance.state,
        pid,
        uptime,
        instance.restart_count
    );
}

fn state_color(state: ProcessState) -> &'static str {
    match state {
        ProcessState::Running => "\x1b[32m",
        ProcessState::Failed => "\x1b[31m",
        ProcessState::Starting | ProcessState::Restarting => "\x1b[33m",
        ProcessState::Stopped => "\x1b[90m",
    }
}

fn show_help() {
    println!("available commands:");
    println!("  help            - show this help message");
    println!("  status          - show status of all programs");
    println!("  start <name>    - start a program");
    println!("  stop <name>     - stop a program");
    println!("  restart <name>  - restart a program");
    println!("  reload          - reload the configuration file");
    println!("  clear [name]    - clear dead process history");
    println!("  quit/exit       - stop everything and exit");
}
