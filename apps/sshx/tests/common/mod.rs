#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use sshx_core::config::Config;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Starts a relay on an ephemeral port and returns its base URL.
pub async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = sshx_signal::Config {
        pull_timeout: Duration::from_secs(1),
        ..sshx_signal::Config::default()
    };
    tokio::spawn(async move {
        let _ = sshx_signal::serve(listener, &config).await;
    });
    format!("http://{addr}")
}

/// Stands in for a local sshd: echoes whatever it receives.
pub async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

pub fn node_config(id: &str, relay: &str, ssh_port: u16) -> Config {
    Config {
        id: id.to_string(),
        local_tcp_port: 0,
        local_ssh_port: ssh_port,
        direct_port: 0,
        signaling_server_addr: relay.to_string(),
        ice_servers: Vec::new(),
        direct_links: HashMap::new(),
        admission_poll_ms: 50,
        admission_timeout_secs: 20,
    }
}

pub fn link(config: &mut Config, peer: &str, addr: SocketAddr) {
    config
        .direct_links
        .insert(peer.to_string(), format!("127.0.0.1:{}", addr.port()));
}

/// Polls `check` until it holds or `attempts` run out.
pub async fn eventually<F, Fut>(attempts: usize, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..attempts {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
