//! # Kernel Syscall Boundary
//!
//! Decodes syscall numbers and register arguments, runs the call against
//! the kernel memory context and the platform [`Services`], and encodes the
//! outcome as a single `i64`: a payload, or a negative [`SyscallError`]
//! code.
//!
//! | Nr | Call            | Arguments                 | Returns |
//! |----|-----------------|---------------------------|---------|
//! | 1  | write           | string                    | 0 |
//! | 2  | allocate        | size                      | pointer |
//! | 3  | release         | pointer                   | 0 |
//! | 4  | write-file      | name, NUL-terminated data | 0 |
//! | 5  | read-file       | name, `*mut u32` size     | pointer to a heap copy |
//! | 6  | exec            | name                      | 0 once the image returned |
//! | 7  | list-directory  | `*mut FileInfo`, max      | entries written |
//! | 8  | sleep           | milliseconds              | 0 |

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod dispatch;
mod error;
pub mod fat12;
mod number;
mod services;

pub use crate::dispatch::Syscalls;
pub use crate::error::{DirectoryError, SyscallError, decode, encode};
pub use crate::fat12::{Fat12Volume, FileInfo, RootDirectory};
pub use crate::number::Sysno;
pub use crate::services::{Console, DeviceError, FileError, FileStore, SectorDevice, Services, Timer};
