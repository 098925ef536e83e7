use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::pool_id::PoolId;

pub const STATUS_OK: i32 = 0;
pub const STATUS_FAILED: i32 = -1;

const OPERATION_BITS: i32 = 8;
const OPERATION_MASK: i32 = (1 << OPERATION_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationCode {
    Up = 0,
    Down = 1,
    Stat = 2,
    Attach = 3,
}

impl TryFrom<i32> for OperationCode {
    type Error = ProtoError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OperationCode::Up),
            1 => Ok(OperationCode::Down),
            2 => Ok(OperationCode::Stat),
            3 => Ok(OperationCode::Attach),
            other => Err(ProtoError::UnknownOperation(other)),
        }
    }
}

/// Request and reply record of the local multiplexer.
///
/// `kind` packs `(app_code << 8) | operation`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: i32,
    pub pair_id: String,
    pub detach: bool,
    pub payload: Vec<u8>,
    pub status: i32,
}

impl Envelope {
    pub fn pack(app_code: i32, op: OperationCode) -> i32 {
        (app_code << OPERATION_BITS) | op as i32
    }

    pub fn request(app_code: i32, op: OperationCode) -> Self {
        Self {
            kind: Self::pack(app_code, op),
            ..Default::default()
        }
    }

    pub fn with_pair_id(mut self, pair_id: impl Into<String>) -> Self {
        self.pair_id = pair_id.into();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }

    /// Application code carried by a packed type.
    pub fn app_code_of(kind: i32) -> i32 {
        kind >> OPERATION_BITS
    }

    pub fn app_code(&self) -> i32 {
        Self::app_code_of(self.kind)
    }

    pub fn operation(&self) -> Result<OperationCode, ProtoError> {
        OperationCode::try_from(self.kind & OPERATION_MASK)
    }

    /// Reply carrying the same type, the given pair id and a status.
    pub fn reply(&self, pair_id: impl Into<String>, status: i32) -> Self {
        Self {
            kind: self.kind,
            pair_id: pair_id.into(),
            detach: self.detach,
            payload: Vec::new(),
            status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Read-only projection of one registered pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub pair_id: String,
    pub target_id: String,
    pub app_code: i32,
    pub parent_pair_id: Option<String>,
    /// Unix epoch milliseconds.
    pub start_time: u64,
}

/// First frame on a direct-link socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectHandshake {
    pub app_code: i32,
    pub host_id: String,
    pub id: PoolId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app;

    #[test]
    fn kind_packs_application_and_operation() {
        let env = Envelope::request(app::PROXY, OperationCode::Attach);
        assert_eq!(env.kind, (4 << 8) | 3);
        assert_eq!(env.app_code(), app::PROXY);
        assert_eq!(env.operation().unwrap(), OperationCode::Attach);
    }

    #[test]
    fn unknown_operation_is_an_error() {
        let env = Envelope {
            kind: (app::SSH << 8) | 0x7f,
            ..Default::default()
        };
        assert!(matches!(
            env.operation(),
            Err(ProtoError::UnknownOperation(0x7f))
        ));
    }

    #[test]
    fn reply_keeps_type_and_sets_status() {
        let req = Envelope::request(app::SSH, OperationCode::Up).with_payload(vec![1, 2]);
        let reply = req.reply("conn_0_5_1", STATUS_FAILED);
        assert_eq!(reply.kind, req.kind);
        assert_eq!(reply.pair_id, "conn_0_5_1");
        assert!(reply.payload.is_empty());
        assert!(!reply.is_ok());
    }
}
