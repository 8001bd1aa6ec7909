//! Server assembly for NeedleHouse.
//!
//! The binary in `main.rs` wires an embedded master and a volume server
//! into one process; this library holds the reusable pieces so the
//! integration tests can assemble the same cluster on loopback ports:
//!
//! - [`volume_http`]: the volume server's object surface
//!   (`PUT`/`GET`/`DELETE /{fid}`)
//! - [`heartbeat`]: the volume server's pulse loop towards the masters

pub mod heartbeat;
pub mod volume_http;

pub use heartbeat::heartbeat_loop;
pub use volume_http::volume_router;
