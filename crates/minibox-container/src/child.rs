//! In-namespace container init, run by the re-executed binary.
//!
//! Order matters here: `/proc` must be mounted inside the new root
//! before `pivot_root`, and nothing may run before the parent's start
//! signal — the uid/gid maps and the veth peer move have to be complete
//! first.

use std::convert::Infallible;
use std::ffi::CString;
use std::fs;
use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, execve, pivot_root, sethostname};
use tracing::debug;

use crate::error::{ContainerError, Result};
use crate::launcher::CHILD_SENTINEL;
use minibox_net::NetConfig;

/// Hostname set inside the new UTS namespace.
pub const DEFAULT_HOSTNAME: &str = "container";

/// Environment handed to the user command.
const CONTAINER_PS1: &str = "PS1=-[container]- # ";

/// Mount point the old root is pivoted onto, relative to the new root.
const PIVOT_OLD_ROOT: &str = ".pivot_root";

/// Arguments the parent passed through the re-exec trampoline.
#[derive(Debug, PartialEq, Eq)]
pub struct ChildArgs {
    /// Mounted overlay rootfs to pivot into.
    pub rootfs: PathBuf,
    /// Command to exec once set up.
    pub command: String,
    /// Read end of the start handshake pipe.
    pub sync_fd: RawFd,
}

/// Parses the sentinel argv produced by the launcher. Returns `None`
/// unless `args` is exactly `[exe, sentinel, rootfs, command, fd]`.
#[must_use]
pub fn parse_argv(args: &[String]) -> Option<ChildArgs> {
    match args {
        [_, sentinel, rootfs, command, fd] if sentinel == CHILD_SENTINEL => Some(ChildArgs {
            rootfs: PathBuf::from(rootfs),
            command: command.clone(),
            sync_fd: fd.parse().ok()?,
        }),
        _ => None,
    }
}

/// Runs the in-namespace setup and execs the user command.
///
/// Only returns on error; on success the process image is replaced.
///
/// # Errors
///
/// One of [`ContainerError::Sync`], [`ContainerError::ProcMount`],
/// [`ContainerError::Pivot`], [`ContainerError::Hostname`],
/// [`ContainerError::Net`], [`ContainerError::Exec`].
pub fn child_main(args: &ChildArgs, net: &NetConfig, hostname: &str) -> Result<Infallible> {
    wait_for_start(args.sync_fd)?;
    mount_proc(&args.rootfs)?;
    enter_root(&args.rootfs)?;
    sethostname(hostname).map_err(|e| ContainerError::Hostname(e.to_string()))?;
    minibox_net::container_setup(net)?;
    exec_command(&args.command)
}

/// Blocks until the parent releases the start gate. EOF means the
/// parent failed before completing setup.
fn wait_for_start(fd: RawFd) -> Result<()> {
    let mut pipe = unsafe { File::from_raw_fd(fd) };
    let mut byte = [0u8; 1];
    pipe.read_exact(&mut byte)
        .map_err(|e| ContainerError::Sync(format!("waiting for parent start signal: {e}")))?;
    debug!("start signal received");
    Ok(())
}

/// Mounts procfs at `<rootfs>/proc`; the fresh PID namespace has none.
fn mount_proc(rootfs: &Path) -> Result<()> {
    let target = rootfs.join("proc");
    fs::create_dir_all(&target)?;
    mount(
        Some("proc"),
        &target,
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| {
        ContainerError::ProcMount(format!("mounting proc at {}: {e}", target.display()))
    })
}

/// Swaps the mount tree root for `rootfs` via `pivot_root`.
///
/// `pivot_root` requires the new root to be a mount point, hence the
/// recursive self bind-mount first. The old root lands on
/// `/.pivot_root`, is detach-unmounted, and the mount point removed.
fn enter_root(rootfs: &Path) -> Result<()> {
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| ContainerError::Pivot(format!("self bind-mount of new root: {e}")))?;

    let put_old = rootfs.join(PIVOT_OLD_ROOT);
    fs::create_dir_all(&put_old)?;

    pivot_root(rootfs, &put_old).map_err(|e| ContainerError::Pivot(e.to_string()))?;

    chdir("/").map_err(|e| ContainerError::Pivot(format!("chdir to new root: {e}")))?;

    let old_root = Path::new("/").join(PIVOT_OLD_ROOT);
    umount2(&old_root, MntFlags::MNT_DETACH)
        .map_err(|e| ContainerError::Pivot(format!("detaching old root: {e}")))?;
    fs::remove_dir(&old_root)?;

    debug!(rootfs = %rootfs.display(), "pivoted into new root");
    Ok(())
}

/// Execs the user command with inherited stdio and a minimal
/// environment.
fn exec_command(command: &str) -> Result<Infallible> {
    let program =
        CString::new(command).map_err(|e| ContainerError::Exec(e.to_string()))?;
    let env = CString::new(CONTAINER_PS1).map_err(|e| ContainerError::Exec(e.to_string()))?;

    execve(&program, &[program.clone()], &[env])
        .map_err(|e| ContainerError::Exec(format!("executing {command}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_parse_argv_roundtrip() {
        let parsed = parse_argv(&args(&[
            "/proc/self/exe",
            CHILD_SENTINEL,
            "/tmp/minibox/containers/c1/rootfs",
            "/bin/sh",
            "3",
        ]))
        .unwrap();

        assert_eq!(
            parsed,
            ChildArgs {
                rootfs: PathBuf::from("/tmp/minibox/containers/c1/rootfs"),
                command: "/bin/sh".to_string(),
                sync_fd: 3,
            }
        );
    }

    #[test]
    fn test_parse_argv_rejects_other_invocations() {
        assert!(parse_argv(&args(&["minibox"])).is_none());
        assert!(parse_argv(&args(&["minibox", "-n", "c1", "-i", "busybox"])).is_none());
        assert!(parse_argv(&args(&["minibox", CHILD_SENTINEL, "/rootfs"])).is_none());
        // Malformed fd
        assert!(parse_argv(&args(&[
            "minibox",
            CHILD_SENTINEL,
            "/rootfs",
            "/bin/sh",
            "not-a-number",
        ]))
        .is_none());
    }
}
