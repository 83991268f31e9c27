//! Borrowed and owned byte-string types used for filenames.
#![cfg_attr(not(test), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod os_str;
