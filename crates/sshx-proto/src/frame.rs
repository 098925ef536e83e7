use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtoError, ProtoResult};

/// Upper bound for one framed record; anything larger is treated as garbage.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub fn encode<T: Serialize>(value: &T) -> ProtoResult<Vec<u8>> {
    bincode::serialize(value).map_err(ProtoError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ProtoResult<T> {
    bincode::deserialize(bytes).map_err(ProtoError::Decode)
}

/// Writes `value` as a u32 big-endian length followed by its bincode body.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> ProtoResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = encode(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> ProtoResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{app, Envelope, OperationCode};

    #[test_timeout::tokio_timeout_test]
    async fn frames_survive_a_stream_with_trailing_bytes() {
        let (mut left, mut right) = tokio::io::duplex(1024);
        let request = Envelope::request(app::SSH, OperationCode::Up);
        write_frame(&mut left, &request).await.unwrap();
        left.write_all(b"raw tail").await.unwrap();

        let decoded: Envelope = read_frame(&mut right).await.unwrap();
        assert_eq!(decoded, request);

        let mut tail = [0u8; 8];
        right.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"raw tail");
    }

    #[test_timeout::tokio_timeout_test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut left, mut right) = tokio::io::duplex(64);
        left.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = read_frame::<_, Envelope>(&mut right).await.unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge(_)));
    }

    #[test]
    fn garbage_body_fails_to_decode() {
        let err = decode::<Envelope>(&[0xff]).unwrap_err();
        assert!(matches!(err, ProtoError::Decode(_)));
    }
}
