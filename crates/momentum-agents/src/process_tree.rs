//! Signalling a whole agent process tree.
//!
//! On unix the agent is started as the leader of a new process group and the
//! group is signalled with a negative pid. Elsewhere `taskkill /T` walks the
//! tree. Callers only see the [`ProcessTree`] trait.

use std::fmt::Debug;
use std::io;
use std::process::Command;
use std::sync::Arc;

pub trait ProcessTree: Send + Sync + Debug {
    /// Configure `command` so the spawned process roots its own tree.
    fn prepare(&self, command: &mut Command);
    /// Ask the whole tree rooted at `pid` to stop.
    fn interrupt(&self, pid: u32) -> io::Result<()>;
    /// Forcefully terminate the tree rooted at `pid`, falling back to the root
    /// process alone if the tree cannot be signalled.
    fn kill(&self, pid: u32) -> io::Result<()>;
}

#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessGroup;

#[cfg(unix)]
impl ProcessGroup {
    fn signal(target: i32, signal: libc::c_int) -> io::Result<()> {
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(target, signal) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    fn signal_tree(pid: u32, signal: libc::c_int) -> io::Result<()> {
        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        match Self::signal(-pid, signal) {
            Ok(()) => Ok(()),
            Err(group_err) => {
                tracing::debug!(pid, error = %group_err, "process group signal failed; signalling root");
                Self::signal(pid, signal)
            }
        }
    }
}

#[cfg(unix)]
impl ProcessTree for ProcessGroup {
    fn prepare(&self, command: &mut Command) {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    fn interrupt(&self, pid: u32) -> io::Result<()> {
        Self::signal_tree(pid, libc::SIGINT)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::signal_tree(pid, libc::SIGKILL)
    }
}

#[cfg(not(unix))]
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskKillTree;

#[cfg(not(unix))]
impl TaskKillTree {
    fn taskkill(pid: u32, tree: bool, force: bool) -> io::Result<()> {
        let mut command = Command::new("taskkill");
        if force {
            command.arg("/F");
        }
        if tree {
            command.arg("/T");
        }
        let status = command.arg("/PID").arg(pid.to_string()).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("taskkill exited with {status}"),
            ))
        }
    }
}

#[cfg(not(unix))]
impl ProcessTree for TaskKillTree {
    fn prepare(&self, _command: &mut Command) {}

    fn interrupt(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, true, false)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, true, true).or_else(|_| Self::taskkill(pid, false, true))
    }
}

/// The controller for the current platform.
pub fn default_process_tree() -> Arc<dyn ProcessTree> {
    #[cfg(unix)]
    {
        Arc::new(ProcessGroup)
    }
    #[cfg(not(unix))]
    {
        Arc::new(TaskKillTree)
    }
}
