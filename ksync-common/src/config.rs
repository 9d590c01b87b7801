// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;
use std::time::Duration;

use ini::Ini;
use log::{debug, info, warn};

use crate::types::MAX_HANDLE_SLOTS;

/// Sizing and timing parameters for a kernel core instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of handle table slots.
    pub max_handles: usize,
    /// Number of thread-local storage slots per thread.
    pub max_tls_slots: usize,
    /// Maximum number of objects in a single multi-object wait.
    pub max_wait_objects: usize,
    /// Timer interrupt frequency.
    pub tick_hz: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_handles: 1024,
            max_tls_slots: 64,
            max_wait_objects: 16,
            tick_hz: 100,
        }
    }
}

impl KernelConfig {
    /// Load settings from an INI file's `[Kernel]` section.
    ///
    /// A missing or unparsable file yields the defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!("No kernel config at {}, using defaults", path.display());
            return Self::default();
        }

        info!("Loading kernel config from: {}", path.display());
        match Ini::load_from_file(path) {
            Ok(conf) => Self::from_ini(&conf),
            Err(e) => {
                warn!("Failed to parse kernel config: {}", e);
                Self::default()
            }
        }
    }

    /// Parse settings from INI text.
    pub fn from_ini_str(text: &str) -> Self {
        match Ini::load_from_str(text) {
            Ok(conf) => Self::from_ini(&conf),
            Err(e) => {
                warn!("Failed to parse kernel config: {}", e);
                Self::default()
            }
        }
    }

    fn from_ini(conf: &Ini) -> Self {
        let mut config = Self::default();

        let Some(section) = conf.section(Some("Kernel")) else {
            debug!("Kernel config has no [Kernel] section");
            return config;
        };

        for (key, value) in section.iter() {
            match key {
                "max_handles" => {
                    config.max_handles = parse_or(key, value, config.max_handles)
                        .clamp(1, MAX_HANDLE_SLOTS);
                }
                "max_tls_slots" => {
                    config.max_tls_slots = parse_or(key, value, config.max_tls_slots).max(1);
                }
                "max_wait_objects" => {
                    config.max_wait_objects =
                        parse_or(key, value, config.max_wait_objects).max(1);
                }
                "tick_hz" => {
                    config.tick_hz = parse_or(key, value, config.tick_hz).max(1);
                }
                _ => warn!("Unknown kernel config key: {}", key),
            }
        }

        debug!("Kernel config: {:?}", config);
        config
    }

    /// Duration of one tick.
    pub fn tick_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.tick_hz.max(1)))
    }

    /// Convert milliseconds to ticks, rounding up so a non-zero delay never
    /// becomes a poll.
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        let hz = u64::from(self.tick_hz.max(1));
        (ms.saturating_mul(hz)).div_ceil(1000)
    }
}

fn parse_or<T: std::str::FromStr + Copy>(key: &str, value: &str, default: T) -> T {
    match value.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!("Invalid value for {}: {:?}", key, value);
            default
        }
    }
}
