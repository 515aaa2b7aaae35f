//! Parent side of the container launch.
//!
//! The child is created with `clone(2)` entering all six namespaces
//! atomically, and immediately re-executes the current binary under a
//! sentinel first argument. The binary's entry point dispatches on the
//! sentinel into [`crate::child::child_main`], which performs the
//! in-namespace setup.
//!
//! Synchronization: the child blocks on a pipe before its first
//! in-namespace step. The parent writes the uid/gid maps, finishes the
//! host-side network setup (including moving the veth peer into the
//! child's namespace), and only then releases the [`StartGate`]. If the
//! parent fails or dies first, the closed pipe delivers EOF and the
//! child aborts instead of racing ahead.

use std::ffi::CString;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::sched::{clone, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, pipe, Gid, Pid, Uid};
use tracing::debug;

use crate::error::{ContainerError, Result};

/// Sentinel first argument directing the re-executed binary into the
/// child path.
pub const CHILD_SENTINEL: &str = "child-init";

/// Stack size for the cloned child; it only execs, so small is fine.
const STACK_SIZE: usize = 1024 * 1024;

/// Host-side handle to a launched container process.
pub struct Child {
    pid: Pid,
    /// Mounted rootfs the child pivoted into; owned by the orchestrator
    /// until it unmounts on exit.
    pub rootfs: PathBuf,
    /// Command the child execs.
    pub command: String,
}

impl Child {
    /// The child PID as seen from the host.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Waits for the child to exit and returns its exit code.
    ///
    /// # Errors
    ///
    /// [`ContainerError::Wait`] if the wait itself fails or the status
    /// is not an exit or signal termination.
    pub fn wait(&self) -> Result<i32> {
        match waitpid(self.pid, None) {
            Ok(WaitStatus::Exited(_, code)) => Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => Ok(128 + signal as i32),
            Ok(other) => Err(ContainerError::Wait(format!(
                "unexpected wait status: {other:?}"
            ))),
            Err(e) => Err(ContainerError::Wait(e.to_string())),
        }
    }
}

/// Write end of the start handshake pipe.
///
/// Dropping it unreleased closes the pipe; the child reads EOF and
/// exits without touching its namespaces.
pub struct StartGate {
    pipe: File,
}

impl StartGate {
    /// Signals the child to begin its in-namespace setup.
    ///
    /// # Errors
    ///
    /// [`ContainerError::Sync`] if the byte cannot be written.
    pub fn release(mut self) -> Result<()> {
        self.pipe
            .write_all(&[1])
            .map_err(|e| ContainerError::Sync(format!("releasing start gate: {e}")))
    }
}

/// Clones the container child and installs its identity mappings.
///
/// The returned child sits blocked on the start gate; the caller
/// finishes host-side setup and calls [`StartGate::release`].
///
/// # Errors
///
/// [`ContainerError::Clone`], [`ContainerError::Sync`], or
/// [`ContainerError::IdMap`].
pub fn spawn(rootfs: &Path, command: &str) -> Result<(Child, StartGate)> {
    let (sync_rx, sync_tx): (OwnedFd, OwnedFd) =
        pipe().map_err(|e| ContainerError::Sync(format!("creating start pipe: {e}")))?;

    let exe = CString::new("/proc/self/exe")
        .map_err(|e| ContainerError::Clone(e.to_string()))?;
    let rootfs_arg = rootfs.display().to_string();
    let fd_arg = sync_rx.as_raw_fd().to_string();
    let argv: Vec<CString> = [
        "/proc/self/exe",
        CHILD_SENTINEL,
        rootfs_arg.as_str(),
        command,
        fd_arg.as_str(),
    ]
    .iter()
    .map(|arg| CString::new(*arg).map_err(|e| ContainerError::Clone(e.to_string())))
    .collect::<Result<_>>()?;

    let flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWUSER;

    let sync_tx_raw = sync_tx.as_raw_fd();
    let mut stack = vec![0u8; STACK_SIZE];

    // The callback runs in the child's copied address space. It closes
    // its copy of the gate's write end (so EOF can reach the read end if
    // the parent dies) and re-executes this binary under the sentinel.
    let child_entry: Box<dyn FnMut() -> isize + '_> = Box::new(|| {
        unsafe { libc::close(sync_tx_raw) };
        let _ = execv(&exe, &argv);
        127
    });

    let pid = unsafe { clone(child_entry, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
        .map_err(|e| ContainerError::Clone(e.to_string()))?;

    // The read end belongs to the child now.
    drop(sync_rx);

    debug!(pid = pid.as_raw(), "cloned container child");
    write_id_maps(pid)?;

    Ok((
        Child {
            pid,
            rootfs: rootfs.to_path_buf(),
            command: command.to_string(),
        },
        StartGate {
            pipe: File::from(sync_tx),
        },
    ))
}

/// Installs the single-entry identity mapping: container uid/gid 0 maps
/// to the invoking user's uid/gid, length 1. `setgroups` must be denied
/// before an unprivileged process may write the gid map.
fn write_id_maps(pid: Pid) -> Result<()> {
    let uid = Uid::current();
    let gid = Gid::current();

    fs::write(format!("/proc/{pid}/uid_map"), format!("0 {uid} 1\n"))
        .map_err(|e| ContainerError::IdMap(format!("writing uid_map: {e}")))?;
    fs::write(format!("/proc/{pid}/setgroups"), "deny\n")
        .map_err(|e| ContainerError::IdMap(format!("denying setgroups: {e}")))?;
    fs::write(format!("/proc/{pid}/gid_map"), format!("0 {gid} 1\n"))
        .map_err(|e| ContainerError::IdMap(format!("writing gid_map: {e}")))?;

    Ok(())
}
