//! The tracee: a child process spawned under PTRACE_TRACEME.

use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use log::debug;
use nix::sys::personality::{self, Persona};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::ptrace;

pub enum Status {
    /// Inferior stopped; carries the stopping signal and the instruction
    /// pointer it stopped at.
    Stopped(Signal, u64),

    /// Inferior exited normally with this status code.
    Exited(i32),

    /// Inferior was killed by this signal.
    Signaled(Signal),
}

/// Runs in the child between fork and exec: turn off address-space
/// randomization so PIE load addresses are stable across runs, then ask to
/// be traced. The kernel stops the child with SIGTRAP once exec completes.
fn child_traceme() -> Result<(), std::io::Error> {
    if let Ok(persona) = personality::get() {
        let _ = personality::set(persona | Persona::ADDR_NO_RANDOMIZE);
    }
    ptrace::trace_me().or(Err(std::io::Error::new(
        std::io::ErrorKind::Other,
        "ptrace TRACEME failed",
    )))
}

pub struct Inferior {
    child: Child,
}

impl Inferior {
    /// Attempts to start a new inferior process. Returns Some(Inferior) if
    /// successful, or None if an error is encountered.
    pub fn new(target: &str, args: &[String]) -> Option<Inferior> {
        let mut cmd = Command::new(target);
        cmd.args(args);
        unsafe {
            cmd.pre_exec(child_traceme);
        }
        let inferior = Inferior {
            child: cmd.spawn().ok()?,
        };
        debug!("spawned tracee pid {}", inferior.pid());
        Some(inferior)
    }

    /// Returns the pid of this inferior.
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Calls waitpid on this inferior and returns a Status to indicate the
    /// state of the process after the waitpid call.
    pub fn wait(&self, options: Option<WaitPidFlag>) -> Result<Status, nix::Error> {
        Ok(match waitpid(self.pid(), options)? {
            WaitStatus::Exited(_pid, exit_code) => Status::Exited(exit_code),
            WaitStatus::Signaled(_pid, signal, _core_dumped) => Status::Signaled(signal),
            WaitStatus::Stopped(_pid, signal) => {
                let regs = ptrace::get_regs(self.pid());
                Status::Stopped(signal, regs.rip)
            }
            other => panic!("waitpid returned unexpected status: {:?}", other),
        })
    }

    /// Kill the tracee and reap it.
    pub fn kill(&mut self) {
        if self.child.kill().is_ok() {
            let _ = self.child.wait();
            println!("Killed inferior (pid {})", self.pid());
        }
    }
}
