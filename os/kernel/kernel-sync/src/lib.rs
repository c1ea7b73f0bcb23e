//! # Kernel synchronization primitives
//!
//! The kernel runs on a single core; the only concurrency is an interrupt
//! arriving in the middle of kernel code. State that an interrupt handler can
//! reach is therefore guarded by a [`SpinMutex`] taken with
//! [`SpinMutex::lock_irq`], which masks interrupts for the lifetime of the guard.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use mutex::{IrqMutexGuard, SpinMutex, SpinMutexGuard};
pub use sync_once_cell::SyncOnceCell;
