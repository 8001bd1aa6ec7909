//! Master configuration.
//!
//! One explicit struct threaded through construction; nothing reads
//! process-global state. Validation happens once at startup and a failure
//! is fatal by design: a master with an unwritable meta directory or an
//! absurd volume size limit must not join the cluster.

use std::path::PathBuf;
use std::time::Duration;

use needlehouse_core::ReplicaPlacement;

use crate::error::{Error, Result};

/// Index offsets are `u32`s counted in 8-byte units, so one volume can
/// address at most 32 GiB; the historical limit of 256,000 MB also keeps
/// the per-volume index within its memory budget.
pub const MAX_VOLUME_SIZE_LIMIT_MB: u64 = 256_000;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Advertised address of this master's HTTP port.
    pub ip: String,
    pub port: u16,
    /// Raft log, snapshot and sequencer state live here.
    pub meta_dir: PathBuf,
    /// All master peers as `ip:port` HTTP addresses, this node included.
    pub peers: Vec<String>,
    pub volume_size_limit_mb: u64,
    pub pulse: Duration,
    pub default_replica_placement: ReplicaPlacement,
    pub garbage_threshold: f64,
}

impl MasterConfig {
    /// `ip:port` identity used in peer lists and leader hints.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn volume_size_limit(&self) -> u64 {
        self.volume_size_limit_mb * 1024 * 1024
    }

    /// Startup validation; failures here are fatal-init.
    pub fn validate(&self) -> Result<()> {
        if self.volume_size_limit_mb > MAX_VOLUME_SIZE_LIMIT_MB {
            return Err(Error::Internal(format!(
                "volume size limit {} MB exceeds the maximum of {} MB",
                self.volume_size_limit_mb, MAX_VOLUME_SIZE_LIMIT_MB
            )));
        }
        // The meta folder must exist and be writable before Raft touches it.
        std::fs::create_dir_all(&self.meta_dir)?;
        let probe = self.meta_dir.join(".writable_check");
        std::fs::write(&probe, b"ok")?;
        std::fs::remove_file(&probe)?;
        Ok(())
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            ip: "localhost".to_string(),
            port: 9333,
            meta_dir: PathBuf::from("."),
            peers: Vec::new(),
            volume_size_limit_mb: 30 * 1000,
            pulse: Duration::from_secs(5),
            default_replica_placement: ReplicaPlacement::default(),
            garbage_threshold: 0.3,
        }
    }
}

/// gRPC endpoint convention: the gRPC port sits 10000 above the HTTP port.
pub fn grpc_endpoint(http_address: &str) -> String {
    match http_address.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u32>() {
            Ok(port) => format!("http://{}:{}", host, port + 10000),
            Err(_) => format!("http://{}", http_address),
        },
        None => format!("http://{}", http_address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_oversized_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = MasterConfig {
            meta_dir: dir.path().to_path_buf(),
            volume_size_limit_mb: MAX_VOLUME_SIZE_LIMIT_MB + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MasterConfig {
            meta_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_grpc_endpoint_offset() {
        assert_eq!(grpc_endpoint("10.0.0.1:9333"), "http://10.0.0.1:19333");
    }
}
