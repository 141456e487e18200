// src/server/listener.rs
// Low-level TCP bind, kept apart so a TLS acceptor can wrap it.
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub async fn bind_tcp(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    Ok(listener)
}
