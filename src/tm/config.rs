use crate::tm::signals;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Restart policy for a program's instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    Never,
    Unexpected,
}

impl RestartPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "always" => Some(RestartPolicy::Always),
            "never" => Some(RestartPolicy::Never),
            "unexpected" => Some(RestartPolicy::Unexpected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::Never => "never",
            RestartPolicy::Unexpected => "unexpected",
        }
    }
}

/// Validated per-program configuration, defaults applied.
///
/// `PartialEq` is the reload diff's semantic equality: all fields compared,
/// `exitcodes` element-wise, `env` key/value-wise.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub cmd: String,
    pub numprocs: u32,
    pub autostart: bool,
    pub autorestart: RestartPolicy,
    pub exitcodes: Vec<i32>,
    pub starttime: u64,
    pub startretries: u32,
    pub stopsignal: String,
    pub stoptime: u64,
    pub stdout: String,
    pub stderr: String,
    pub env: HashMap<String, String>,
    pub workingdir: String,
    pub umask: String,
}

impl Program {
    /// True when `code` is one of the program's expected exit codes.
    pub fn is_expected_exit(&self, code: i32) -> bool {
        self.exitcodes.contains(&code)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub programs: HashMap<String, Program>,
}

// -------- YAML file schema (raw; defaults applied after parse) --------
//
// Fields the loader defaults are Option<_> so an explicit 0 (e.g.
// `starttime: 0`) is distinguishable from an absent key.

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    programs: HashMap<String, ProgramFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramFile {
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    numprocs: Option<u32>,
    #[serde(default)]
    autostart: bool,
    #[serde(default)]
    autorestart: Option<String>,
    #[serde(default)]
    exitcodes: Option<Vec<i32>>,
    #[serde(default)]
    starttime: Option<u64>,
    #[serde(default)]
    startretries: Option<u32>,
    #[serde(default)]
    stopsignal: Option<String>,
    #[serde(default)]
    stoptime: Option<u64>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    workingdir: Option<String>,
    #[serde(default)]
    umask: Option<String>,
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ConfigFile = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut programs = HashMap::with_capacity(file.programs.len());
    for (name, pf) in file.programs {
        let program = validate_program(&name, pf)?;
        programs.insert(name, program);
    }
    Ok(Config { programs })
}

fn validate_program(name: &str, pf: ProgramFile) -> Result<Program, ConfigError> {
    if pf.cmd.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "program {name}: cmd must not be empty"
        )));
    }

    let numprocs = pf.numprocs.unwrap_or(1);
    if numprocs < 1 {
        return Err(ConfigError::Invalid(format!(
            "program {name}: numprocs must be >= 1 (got {numprocs})"
        )));
    }

    let autorestart = match pf.autorestart.as_deref() {
        None => RestartPolicy::Unexpected,
        Some(s) => RestartPolicy::parse(s).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "program {name}: autorestart must be one of always/never/unexpected (got {s:?})"
            ))
        })?,
    };

    let stopsignal = pf.stopsignal.unwrap_or_else(|| "TERM".to_string());
    if !signals::is_valid(&stopsignal) {
        return Err(ConfigError::Invalid(format!(
            "program {name}: unknown stopsignal {stopsignal:?}"
        )));
    }

    let umask = pf.umask.unwrap_or_else(|| "022".to_string());
    if parse_umask(&umask).is_none() {
        return Err(ConfigError::Invalid(format!(
            "program {name}: umask {umask:?} is not a valid octal string"
        )));
    }

    Ok(Program {
        cmd: pf.cmd,
        numprocs,
        autostart: pf.autostart,
        autorestart,
        exitcodes: pf.exitcodes.unwrap_or_else(|| vec![0]),
        starttime: pf.starttime.unwrap_or(1),
        startretries: pf.startretries.unwrap_or(3),
        stopsignal,
        stoptime: pf.stoptime.unwrap_or(10),
        stdout: pf.stdout.unwrap_or_default(),
        stderr: pf.stderr.unwrap_or_default(),
        env: pf.env,
        workingdir: pf.workingdir.unwrap_or_default(),
        umask,
    })
}

/// Parse an octal umask string like "022". Returns None when not octal.
pub fn parse_umask(s: &str) -> Option<u32> {
    if s.is_empty() {
        return None;
    }
    u32::from_str_radix(s, 8).ok()
}
