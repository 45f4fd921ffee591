use crate::debugger::channel::ChannelError;
use log::debug;
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::Options;
use nix::sys::signal::SIGSTOP;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use os_pipe::PipeWriter;
use std::collections::HashSet;
use std::iter;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use sysinfo::{ProcessRefreshKind, System};

/// Ptrace options used for every traced thread.
pub(crate) fn trace_options() -> Options {
    Options::PTRACE_O_TRACECLONE
        .union(Options::PTRACE_O_TRACEFORK)
        .union(Options::PTRACE_O_TRACEVFORK)
        .union(Options::PTRACE_O_TRACEEXEC)
        .union(Options::PTRACE_O_TRACEEXIT)
}

/// Description of a process to spawn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessStart {
    /// Program name or path, names are resolved through `PATH`.
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Environment of a new process, `None` for inheriting debugger environment.
    pub env: Option<Vec<(String, String)>>,
    /// Capture stdout and stderr of a process through pipes.
    pub redirect_output: bool,
    pub disable_aslr: bool,
}

impl ProcessStart {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            cwd: None,
            env: None,
            redirect_output: true,
            disable_aslr: true,
        }
    }

    pub fn args<ARGS: IntoIterator<Item = I>, I: Into<String>>(mut self, args: ARGS) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    pub fn redirect_output(mut self, redirect: bool) -> Self {
        self.redirect_output = redirect;
        self
    }

    /// Return a path to an executable file.
    pub fn resolve_program(&self) -> Result<PathBuf, ChannelError> {
        let cwd = self
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default();
        which::which_in(&self.program, std::env::var_os("PATH"), cwd)
            .map_err(|e| ChannelError::CannotStartTarget(format!("{}: {e}", self.program)))
    }

    /// Instantiate process by `fork()` system call with caller as a parent (and tracer) process.
    /// After installation process is seized and stopped by `SIGSTOP` signal before `exec`.
    pub(crate) fn install(
        &self,
        stdout: Option<PipeWriter>,
        stderr: Option<PipeWriter>,
    ) -> Result<Pid, ChannelError> {
        let program = self.resolve_program()?;
        let mut cmd = Command::new(&program);
        cmd.args(&self.args);
        if let Some(stdout) = stdout {
            cmd.stdout(stdout);
        }
        if let Some(stderr) = stderr {
            cmd.stderr(stderr);
        }
        if let Some(cwd) = self.cwd.as_deref() {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &self.env {
            cmd.env_clear().envs(env.iter().map(|(k, v)| (k, v)));
        }
        if self.disable_aslr {
            unsafe {
                cmd.pre_exec(move || {
                    sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                    Ok(())
                });
            }
        }

        match unsafe { fork() }.map_err(|e| ChannelError::Syscall("fork", e))? {
            ForkResult::Parent { child: pid } => {
                waitpid(pid, Some(WaitPidFlag::WSTOPPED))
                    .map_err(|e| ChannelError::Syscall("waitpid", e))?;
                sys::ptrace::seize(pid, trace_options())
                    .map_err(|e| ChannelError::Syscall("ptrace seize", e))?;
                debug!(target: "tracer", "process {pid} installed ({})", program.display());
                Ok(pid)
            }
            ForkResult::Child => {
                if sys::signal::raise(SIGSTOP).is_ok() {
                    let err = cmd.exec();
                    eprintln!("run debugee fail with: {err}");
                }
                std::process::exit(127);
            }
        }
    }
}

/// Refresh task list of a process and return its threads, the leader goes first.
fn process_threads(system: &mut System, pid: Pid) -> Result<Vec<Pid>, ChannelError> {
    let sys_pid = sysinfo::Pid::from_u32(pid.as_raw() as u32);
    system.refresh_pids_specifics(&[sys_pid], ProcessRefreshKind::new());
    let process = system.process(sys_pid).ok_or(ChannelError::NoSuchThread(pid))?;
    let threads = match process.tasks() {
        Some(tasks) => iter::once(pid)
            .chain(
                tasks
                    .iter()
                    .map(|tid| Pid::from_raw(tid.as_u32() as i32))
                    .filter(|tid| *tid != pid),
            )
            .collect(),
        None => vec![pid],
    };
    Ok(threads)
}

/// Seize all threads of an external process and stop them.
/// Return list of threads observed at the time of attaching.
pub(crate) fn seize_external(pid: Pid) -> Result<Vec<Pid>, ChannelError> {
    let mut system = System::new();

    let mut interrupted = HashSet::new();
    // two interrupt rounds, threads may be created while the first round in progress
    for _ in 0..2 {
        let threads: Vec<Pid> = process_threads(&mut system, pid)?
            .into_iter()
            .filter(|t| !interrupted.contains(t))
            .collect();

        for tid in &threads {
            sys::ptrace::seize(*tid, trace_options())
                .map_err(|e| ChannelError::Syscall("ptrace seize", e))?;
        }
        for tid in &threads {
            sys::ptrace::interrupt(*tid)
                .map_err(|e| ChannelError::Syscall("ptrace interrupt", e))?;
        }
        for tid in &threads {
            let status = waitpid(*tid, Some(WaitPidFlag::__WALL))
                .map_err(|e| ChannelError::Syscall("waitpid", e))?;
            debug!(target: "tracer", "attach status of thread {tid}: {status:?}");
            if let WaitStatus::Exited(..) | WaitStatus::Signaled(..) = status {
                continue;
            }
            interrupted.insert(*tid);
        }
    }

    let mut threads: Vec<Pid> = interrupted.into_iter().collect();
    threads.sort();
    Ok(threads)
}
