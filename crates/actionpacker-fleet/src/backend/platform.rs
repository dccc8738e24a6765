// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host platform detection for agent bundles.

use std::fmt;

use super::BackendError;

/// OS/architecture pair as used in agent bundle names (`linux-x64`, `osx-arm64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    /// `linux` or `osx`.
    pub os: &'static str,
    /// `x64`, `arm64` or `arm`.
    pub arch: &'static str,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

/// Identify the host platform.
pub fn detect_platform() -> Result<Platform, BackendError> {
    platform_for(std::env::consts::OS, std::env::consts::ARCH)
}

/// Map Rust's OS/arch names onto an agent bundle platform.
pub fn platform_for(os: &str, arch: &str) -> Result<Platform, BackendError> {
    let unsupported = || BackendError::UnsupportedPlatform {
        os: os.to_string(),
        arch: arch.to_string(),
    };

    let os_name = match os {
        "linux" => "linux",
        "macos" => "osx",
        _ => return Err(unsupported()),
    };

    let arch_name = match (os_name, arch) {
        (_, "x86_64") => "x64",
        (_, "aarch64") => "arm64",
        ("linux", "arm") => "arm",
        _ => return Err(unsupported()),
    };

    Ok(Platform {
        os: os_name,
        arch: arch_name,
    })
}
