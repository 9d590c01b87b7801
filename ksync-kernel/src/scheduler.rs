// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Scheduler-facing hooks.
//!
//! The core decides by itself when a parked thread may continue; an
//! external run-queue can follow along through a [`Dispatcher`]. The
//! [`Ticker`] stands in for the timer interrupt.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ksync_common::ThreadId;
use log::{debug, info};

use crate::kernel::KernelCore;

/// Observer of thread wait transitions.
///
/// Called with the kernel lock held: implementations must not call back
/// into the [`KernelCore`].
pub trait Dispatcher: Send + Sync {
    /// `tid` blocked in a wait.
    fn thread_waiting(&self, _tid: ThreadId) {}

    /// `tid`'s wait ended (satisfied, timed out or destroyed).
    fn thread_ready(&self, _tid: ThreadId) {}
}

/// Host thread calling [`KernelCore::tick`] at the configured tick rate.
pub struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn(kernel: Arc<KernelCore>) -> io::Result<Self> {
        let period = kernel.config().tick_period();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("ksync-tick".to_string())
            .spawn(move || {
                debug!("ticker running, period {:?}", period);
                while !flag.load(Ordering::Acquire) {
                    thread::sleep(period);
                    kernel.tick();
                }
                debug!("ticker stopped at tick {}", kernel.now());
            })?;
        info!("started ticker");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop ticking and join the host thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
