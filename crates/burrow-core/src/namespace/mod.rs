//! Linux namespace management for process isolation.
//!
//! Only the PID namespace is isolated. Network, mount, IPC, UTS, and user
//! namespaces are shared with the host.

pub mod pid;
