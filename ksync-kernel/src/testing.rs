// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Helpers shared by the unit tests.

use std::time::{Duration, Instant};

use ksync_common::ThreadId;

use crate::thread::ThreadState;
use crate::KernelCore;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Spin until `tid` is parked in a wait.
pub fn wait_until_blocked(kernel: &KernelCore, tid: ThreadId) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while kernel.thread_state(tid) != Some(ThreadState::Waiting) {
        assert!(Instant::now() < deadline, "thread {tid} never blocked");
        std::thread::sleep(Duration::from_millis(1));
    }
}
