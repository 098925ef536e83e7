use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("encode failed: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode failed: {0}")]
    Decode(#[source] bincode::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("invalid pool id: {0:?}")]
    InvalidPoolId(String),
    #[error("unknown operation code {0}")]
    UnknownOperation(i32),
    #[error("invalid signaling message: {0}")]
    InvalidMessage(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtoResult<T> = Result<T, ProtoError>;
