//! Wire types shared by the sshx peer and the signaling relay.
//!
//! Everything here is plain data plus the framing helpers used on the
//! loopback multiplexer and the direct-link socket. Keeping it in its own
//! crate lets the relay build without pulling in the peer-connection stack.

mod envelope;
mod error;
mod frame;
mod pool_id;
mod signaling;

pub use envelope::{DirectHandshake, Envelope, OperationCode, Status, STATUS_FAILED, STATUS_OK};
pub use error::{ProtoError, ProtoResult};
pub use frame::{decode, encode, read_frame, write_frame, MAX_FRAME_LEN};
pub use pool_id::{Direction, PoolId};
pub use signaling::{SignalFlag, SignalingMessage};

/// Application codes understood by the adapter registry.
pub mod app {
    pub const SSH: i32 = 0;
    pub const VNC: i32 = 1;
    pub const SCP: i32 = 2;
    pub const SFS: i32 = 3;
    pub const PROXY: i32 = 4;
    pub const STAT: i32 = 5;
    pub const VNC_SERVICE: i32 = 6;

    pub fn name(code: i32) -> &'static str {
        match code {
            SSH => "ssh",
            VNC => "vnc",
            SCP => "scp",
            SFS => "sfs",
            PROXY => "proxy",
            STAT => "stat",
            VNC_SERVICE => "vnc-service",
            _ => "unknown",
        }
    }
}
