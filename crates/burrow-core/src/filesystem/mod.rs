//! Root filesystem switching for process isolation.

pub mod chroot;
