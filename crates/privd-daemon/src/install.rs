//! Helper installation: systemd unit generation.
//!
//! Writes a socket-activation-free, on-demand unit for the helper and
//! reports the installed binary's digest so deployments can pin the
//! expected peer identity. A failed service restart is reported in the
//! result rather than failing the install; the unit lands on disk either
//! way.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::peer::MAX_EXECUTABLE_SIZE;

/// Default directory for system units.
const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// Installation errors.
#[derive(Debug, Error)]
pub enum InstallError {
    /// A file could not be read or written.
    #[error("install failed at {path}: {source}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The helper binary exceeds the digest size bound.
    #[error("binary {path} is {size} bytes, exceeds {max} byte limit")]
    TooLarge {
        /// Binary path.
        path: PathBuf,
        /// Actual size in bytes.
        size: u64,
        /// Maximum allowed size.
        max: u64,
    },
}

/// What to install and where.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Path to the helper binary the unit will exec.
    pub binary_path: PathBuf,
    /// Service name the helper will answer for.
    pub service: String,
    /// Directory the unit file is written into.
    pub unit_dir: PathBuf,
    /// Optional config file path passed to the helper.
    pub config_path: Option<PathBuf>,
    /// Whether to reload systemd and restart the unit after writing it.
    pub restart: bool,
}

impl InstallOptions {
    /// Options with the default unit directory and no restart.
    #[must_use]
    pub fn new(binary_path: impl Into<PathBuf>, service: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            service: service.into(),
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
            config_path: None,
            restart: false,
        }
    }
}

/// Result of a restart attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RestartOutcome {
    /// Unit that was restarted.
    pub unit: String,
    /// `restarted` or `failed`.
    pub status: String,
    /// Failure detail, when the restart failed.
    pub error: Option<String>,
}

/// What the install wrote and verified.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    /// Path of the written unit file.
    pub unit_path: PathBuf,
    /// Hex SHA-256 digest of the installed binary.
    pub binary_sha256: String,
    /// Restart outcome, when a restart was requested.
    pub restart: Option<RestartOutcome>,
}

/// Write the systemd unit for the helper.
///
/// # Errors
///
/// Returns [`InstallError`] if the binary cannot be digested or the unit
/// cannot be written. Restart failures are reported in the result, not as
/// errors.
pub fn install_systemd_unit(options: &InstallOptions) -> Result<InstallReport, InstallError> {
    let binary_sha256 = binary_digest_hex(&options.binary_path)?;

    let unit_name = unit_name(&options.service);
    let unit_path = options.unit_dir.join(&unit_name);
    std::fs::create_dir_all(&options.unit_dir).map_err(|source| InstallError::Io {
        path: options.unit_dir.clone(),
        source,
    })?;
    std::fs::write(&unit_path, render_unit(options)).map_err(|source| InstallError::Io {
        path: unit_path.clone(),
        source,
    })?;
    info!(unit = %unit_path.display(), sha256 = %binary_sha256, "unit installed");

    let restart = options.restart.then(|| restart_unit(&unit_name));

    Ok(InstallReport {
        unit_path,
        binary_sha256,
        restart,
    })
}

fn unit_name(service: &str) -> String {
    format!("privd-{service}.service")
}

fn render_unit(options: &InstallOptions) -> String {
    let mut exec_start = format!(
        "{} --service {}",
        options.binary_path.display(),
        options.service
    );
    if let Some(config) = &options.config_path {
        exec_start.push_str(&format!(" --config {}", config.display()));
    }

    format!(
        "[Unit]\n\
         Description=privd privileged helper ({service})\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exec_start}\n\
         User=root\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        service = options.service,
    )
}

fn restart_unit(unit_name: &str) -> RestartOutcome {
    let run = |args: &[&str]| -> Result<(), String> {
        let output = ProcessCommand::new("systemctl")
            .args(args)
            .output()
            .map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    };

    let result = run(&["daemon-reload"]).and_then(|()| run(&["restart", unit_name]));
    match result {
        Ok(()) => RestartOutcome {
            unit: unit_name.to_string(),
            status: "restarted".to_string(),
            error: None,
        },
        Err(error) => {
            warn!(unit = unit_name, %error, "restart failed");
            RestartOutcome {
                unit: unit_name.to_string(),
                status: "failed".to_string(),
                error: Some(error),
            }
        }
    }
}

/// Bounded SHA-256 of the helper binary, hex-encoded.
fn binary_digest_hex(path: &Path) -> Result<String, InstallError> {
    let map_io = |source: io::Error| InstallError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = std::fs::File::open(path).map_err(map_io)?;
    let size = file.metadata().map_err(map_io)?.len();
    if size > MAX_EXECUTABLE_SIZE {
        return Err(InstallError::TooLarge {
            path: path.to_path_buf(),
            size,
            max: MAX_EXECUTABLE_SIZE,
        });
    }

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(map_io)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_writes_unit_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("privd-daemon");
        std::fs::write(&binary, b"#!/bin/sh\nexit 0\n").unwrap();

        let mut options = InstallOptions::new(&binary, "com.example.helper");
        options.unit_dir = dir.path().join("units");
        options.config_path = Some(dir.path().join("helper.toml"));

        let report = install_systemd_unit(&options).unwrap();
        assert_eq!(report.binary_sha256.len(), 64);
        assert!(report.restart.is_none());

        let unit = std::fs::read_to_string(&report.unit_path).unwrap();
        assert!(unit.contains("--service com.example.helper"));
        assert!(unit.contains("--config"));
        assert!(unit.contains("User=root"));
        assert!(report
            .unit_path
            .ends_with("privd-com.example.helper.service"));
    }

    #[test]
    fn test_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let options = InstallOptions::new(dir.path().join("absent"), "svc");
        assert!(matches!(
            install_systemd_unit(&options),
            Err(InstallError::Io { .. })
        ));
    }

    #[test]
    fn test_digest_matches_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data");
        std::fs::write(&file, b"abc").unwrap();
        assert_eq!(
            binary_digest_hex(&file).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
