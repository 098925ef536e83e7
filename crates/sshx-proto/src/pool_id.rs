use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Which side of a negotiation a pool entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    /// The responding side, created when an offer arrives.
    #[default]
    Inbound,
    /// The initiating side, created by a local UP request.
    Outbound,
}

impl Direction {
    pub fn bit(self) -> u8 {
        match self {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        }
    }

    pub fn from_bit(bit: u8) -> Option<Self> {
        match bit {
            0 => Some(Direction::Inbound),
            1 => Some(Direction::Outbound),
            _ => None,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }
}

/// Correlation key for one negotiation attempt.
///
/// Both peers hold an entry for the same `(app_code, value)`; the
/// direction keeps the two views apart when both live in one process.
/// The string form `conn_{app}_{value}_{direction}` is what operators and
/// the multiplexer see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PoolId {
    pub app_code: i32,
    pub value: i64,
    pub direction: Direction,
}

impl PoolId {
    pub fn new(app_code: i32, value: i64, direction: Direction) -> Self {
        Self {
            app_code,
            value,
            direction,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    /// The same negotiation as seen from the other peer.
    pub fn flipped(self) -> Self {
        Self {
            direction: self.direction.flipped(),
            ..self
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conn_{}_{}_{}",
            self.app_code,
            self.value,
            self.direction.bit()
        )
    }
}

impl FromStr for PoolId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtoError::InvalidPoolId(s.to_string());
        let rest = s.strip_prefix("conn_").ok_or_else(invalid)?;
        let mut parts = rest.split('_');
        let (Some(code), Some(value), Some(direction), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let app_code = code.parse().map_err(|_| invalid())?;
        let value = value.parse().map_err(|_| invalid())?;
        let direction = direction
            .parse::<u8>()
            .ok()
            .and_then(Direction::from_bit)
            .ok_or_else(invalid)?;
        Ok(Self {
            app_code,
            value,
            direction,
        })
    }
}
