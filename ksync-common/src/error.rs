// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use crate::types::ObjectKind;

/// Errors returned by kernel object operations.
///
/// A timed-out wait is not an error; see `WaitStatus` in the kernel crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("invalid handle")]
    InvalidHandle,

    #[error("wrong object type: expected {expected}, found {found}")]
    WrongType {
        expected: ObjectKind,
        found: ObjectKind,
    },

    #[error("handle table full")]
    OutOfHandles,

    #[error("caller does not own the object")]
    NotOwner,

    #[error("no free slots")]
    Exhausted,

    #[error("object destroyed while waiting")]
    ObjectDestroyed,

    #[error("handle is protected")]
    AccessDenied,

    #[error("unknown thread {0}")]
    InvalidThread(u64),

    #[error("operation not valid in the current state")]
    InvalidState,

    #[error("too many objects in wait: {count} > {max}")]
    TooManyObjects { count: usize, max: usize },

    #[error("invalid argument")]
    InvalidArgument,
}

/// Result alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
