//! Thin client for the local multiplexer, used by the CLI and by adapters
//! that spawn child tunnels.

use std::net::{Ipv4Addr, SocketAddr};

use sshx_proto::{Envelope, OperationCode, ProtoError, Status, app, read_frame, write_frame};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to reach multiplexer at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("request rejected with status {status}")]
    Rejected { status: i32, pair_id: String },
}

#[derive(Debug, Clone, Copy)]
pub struct MuxClient {
    addr: SocketAddr,
}

impl MuxClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn local(port: u16) -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    async fn connect(&self) -> Result<TcpStream, ClientError> {
        TcpStream::connect(self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr,
                source,
            })
    }

    /// Sends a waiting request and returns the reply together with the
    /// connection, which carries the tunneled bytes for UP and ATTACH.
    pub async fn open(&self, request: &Envelope) -> Result<(Envelope, TcpStream), ClientError> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, request).await?;
        let reply: Envelope = read_frame(&mut stream).await?;
        if !reply.is_ok() {
            return Err(ClientError::Rejected {
                status: reply.status,
                pair_id: reply.pair_id,
            });
        }
        Ok((reply, stream))
    }

    pub async fn request(&self, request: &Envelope) -> Result<Envelope, ClientError> {
        self.open(request).await.map(|(reply, _)| reply)
    }

    /// Fire-and-forget; failures only show up in a later STAT.
    pub async fn send_detached(&self, request: Envelope) -> Result<(), ClientError> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &request.detached()).await?;
        stream.shutdown().await.map_err(ProtoError::Io)?;
        Ok(())
    }

    pub async fn stat(&self) -> Result<Vec<Status>, ClientError> {
        let reply = self
            .request(&Envelope::request(app::STAT, OperationCode::Stat))
            .await?;
        Ok(sshx_proto::decode(&reply.payload)?)
    }

    pub async fn down(&self, pair_id: &str, app_code: i32) -> Result<(), ClientError> {
        self.request(&Envelope::request(app_code, OperationCode::Down).with_pair_id(pair_id))
            .await
            .map(|_| ())
    }
}
