//! # burrow-runtime
//!
//! The `run` pipeline: assembles an ephemeral root from a pulled image,
//! executes the command inside it under chroot and a fresh PID namespace,
//! and removes the root afterwards.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod isolate;
pub mod rootfs;
