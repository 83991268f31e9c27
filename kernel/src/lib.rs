//! Core kernel data structures: the dentry/inode cache, per-process
//! virtual memory zone map, and per-thread signal dispatch.
//!
//! Boot, interrupt vectoring, the on-disk filesystem format, and the
//! scheduler's run queue all live outside this crate. Where this core
//! needs one of those, it is expressed as a trait its caller
//! implements (see [`driver`]).
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod console;
pub mod cpu;
pub mod dcache;
pub mod driver;
pub mod error;
pub mod interrupt;
pub mod memory;
pub mod param;
pub mod proc;
pub mod signal;
pub mod sync;
pub mod zonemap;
