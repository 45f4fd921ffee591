use crate::{muted_error, weak_error};
use log::error;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::Path;
use std::str::FromStr;

/// What to do with a child process created by fork.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForkPolicy {
    /// Trace child as a new process.
    Follow,
    /// Restore child memory and detach from it, parent continues alone.
    #[default]
    Detach,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct ConfigFile {
    fork_policy: Option<ForkPolicy>,
    prefer_hardware_breakpoints: Option<bool>,
    allow_software_fallback: Option<bool>,
    quiet_signals: Option<Vec<String>>,
    stop_on_exec: Option<bool>,
    disable_aslr: Option<bool>,
    max_string_length: Option<usize>,
    adopt_threads: Option<bool>,
}

/// Debugger behaviour settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebuggerConfig {
    pub fork_policy: ForkPolicy,
    /// Try hardware slots before patching memory.
    pub prefer_hardware_breakpoints: bool,
    /// If false, breakpoint insertion fails with `DebugRegisterOccupied` when no hardware slot free.
    pub allow_software_fallback: bool,
    /// Signals that are passed to the debugee without a stop.
    pub quiet_signals: Vec<Signal>,
    /// Surface exec as a stop (otherwise debugee continues after exec).
    pub stop_on_exec: bool,
    pub disable_aslr: bool,
    /// Upper bound for null terminated string reads.
    pub max_string_length: usize,
    /// If true, threads created by clone are traced, otherwise they are detached.
    pub adopt_threads: bool,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            fork_policy: ForkPolicy::default(),
            prefer_hardware_breakpoints: true,
            allow_software_fallback: true,
            quiet_signals: vec![
                Signal::SIGALRM,
                Signal::SIGURG,
                Signal::SIGCHLD,
                Signal::SIGIO,
                Signal::SIGVTALRM,
                Signal::SIGPROF,
            ],
            stop_on_exec: false,
            disable_aslr: true,
            max_string_length: 4096,
            adopt_threads: true,
        }
    }
}

impl DebuggerConfig {
    const DEFAULT_PATH: &'static str = ".config/rdb/config.toml";

    /// Load configuration from file or from a default location (`$HOME/.config/rdb/config.toml`).
    /// Return default configuration on errors.
    pub fn load(path: Option<&Path>) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    fn from_file(path: Option<&Path>) -> Option<Self> {
        let data = match path {
            None => {
                let path = home::home_dir()?;
                let path = path.join(Self::DEFAULT_PATH);
                muted_error!(read_to_string(path))?
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    error!(target: "debugger", "Error while load config file: {err}");
                    return None;
                }
            },
        };
        weak_error!(Self::from_toml(&data))
    }

    /// Parse configuration from toml text, unset keys take default values.
    pub fn from_toml(data: &str) -> Result<Self, crate::debugger::error::Error> {
        let file: ConfigFile = toml::de::from_str(data)?;
        let default = Self::default();

        let quiet_signals = match file.quiet_signals {
            None => default.quiet_signals,
            Some(names) => names
                .iter()
                .filter_map(|name| {
                    weak_error!(
                        Signal::from_str(&name.to_uppercase()),
                        "unknown signal in config:"
                    )
                })
                .collect(),
        };

        Ok(Self {
            fork_policy: file.fork_policy.unwrap_or(default.fork_policy),
            prefer_hardware_breakpoints: file
                .prefer_hardware_breakpoints
                .unwrap_or(default.prefer_hardware_breakpoints),
            allow_software_fallback: file
                .allow_software_fallback
                .unwrap_or(default.allow_software_fallback),
            quiet_signals,
            stop_on_exec: file.stop_on_exec.unwrap_or(default.stop_on_exec),
            disable_aslr: file.disable_aslr.unwrap_or(default.disable_aslr),
            max_string_length: file.max_string_length.unwrap_or(default.max_string_length),
            adopt_threads: file.adopt_threads.unwrap_or(default.adopt_threads),
        })
    }

    pub fn is_quiet(&self, signal: Signal) -> bool {
        self.quiet_signals.contains(&signal)
    }
}
