// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod error;
pub mod types;

pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use types::*;
