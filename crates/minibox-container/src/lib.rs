//! # minibox-container
//!
//! Namespace isolation for minibox: clones a child into fresh
//! mount/UTS/IPC/PID/net/user namespaces, re-executes the binary inside
//! it, and performs the in-namespace setup (proc mount, pivot_root,
//! hostname, network, exec).
//!
//! The parent half lives in [`launcher`], the re-executed half in
//! [`child`]. They synchronize over a pipe so the child never observes
//! a namespace the parent has not finished preparing.

pub mod child;
pub mod error;
pub mod launcher;

pub use child::{child_main, parse_argv, ChildArgs, DEFAULT_HOSTNAME};
pub use error::{ContainerError, Result};
pub use launcher::{spawn, Child, StartGate, CHILD_SENTINEL};
