//! NeedleHouse Protocol Buffer Definitions
//!
//! This crate contains the gRPC service definitions and message types for
//! communication between NeedleHouse components.
//!
//! ## Services
//!
//! - **VolumeServer** (`volume_server` package): volume-to-volume sync
//!   (`VolumeSyncStatus` / `VolumeSyncIndex` / `VolumeSyncData`) and volume
//!   allocation directives.
//! - **Master** (`master` package): volume-server heartbeats and the
//!   volume-location subscription stream.
//! - **Raft** (`raft` package): consensus RPCs between master peers.
//!
//! ## Usage
//!
//! ```ignore
//! use needlehouse_proto::volume::volume_server_client::VolumeServerClient;
//! use needlehouse_proto::volume::VolumeSyncStatusRequest;
//!
//! let mut client = VolumeServerClient::connect("http://127.0.0.1:18080").await?;
//! let status = client
//!     .volume_sync_status(VolumeSyncStatusRequest { volume_id: 3 })
//!     .await?
//!     .into_inner();
//! println!("tail at {}", status.tail_offset);
//! ```

/// Volume server RPCs (sync protocol, volume allocation)
pub mod volume {
    tonic::include_proto!("volume_server");
}

/// Master RPCs (heartbeat, location subscription)
pub mod master {
    tonic::include_proto!("master");
}

/// Raft consensus RPCs between master peers
pub mod raft {
    tonic::include_proto!("raft");
}
