// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod critical_section;
pub mod handle_table;
pub mod kernel;
pub mod objects;
pub mod queue;
pub mod report;
pub mod scheduler;
pub mod thread;
pub mod timer;
pub mod tls;
pub mod wait;

#[cfg(test)]
mod testing;

pub use critical_section::CriticalSection;
pub use kernel::KernelCore;
pub use queue::{EnqueueError, MessageQueue, QueueError};
pub use report::{HandleInfo, HandleReport};
pub use scheduler::{Dispatcher, Ticker};
pub use thread::{KThread, ThreadState};
pub use timer::TimerId;
pub use wait::WaitStatus;
