mod common;

use std::time::Duration;

use anyhow::{Context, Result};
use cache_failover::{CacheError, Client, ClientConfig};
use common::{MockServer, WAIT, refused_addr};
use futures::future::join_all;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn end_fails_in_flight_requests_with_client_closed() -> Result<()> {
    let silent = MockServer::silent().await?;
    let config = ClientConfig {
        timeout: Duration::from_secs(30),
        ..ClientConfig::default()
    };
    let client = Client::new(silent.address(), config)?;

    let requests: Vec<_> = (0..5)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.get(&format!("key-{i}")).await })
        })
        .collect();
    sleep(Duration::from_millis(100)).await;

    timeout(WAIT, client.end()).await.context("end completes")?;

    for outcome in join_all(requests).await {
        assert_eq!(outcome?, Err(CacheError::ClientClosed));
    }

    silent.stop().await;
    Ok(())
}

#[tokio::test]
async fn calls_after_end_are_rejected() -> Result<()> {
    let addr = refused_addr().await?;
    let client = Client::new(addr.as_str(), ClientConfig::default())?;

    client.end().await;
    client.end().await;

    assert_eq!(client.get("k").await, Err(CacheError::ClientClosed));
    assert_eq!(client.set("k", "v", 0).await, Err(CacheError::ClientClosed));
    assert_eq!(client.lookup("k").await, Err(CacheError::ClientClosed));
    assert_eq!(client.issue(&addr).await, Err(CacheError::ClientClosed));
    Ok(())
}

#[tokio::test]
async fn concurrent_end_calls_all_return() -> Result<()> {
    let server = MockServer::start().await?;
    let client = Client::new(server.address(), ClientConfig::default())?;
    client.set("k", "v", 0).await?;

    let ends = (0..3).map(|_| client.end());
    timeout(WAIT, join_all(ends))
        .await
        .context("every end returns")?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn end_closes_open_sockets() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let client = Client::new(addr.as_str(), ClientConfig::default())?;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.get("k").await })
    };
    let (mut socket, _) = timeout(WAIT, listener.accept()).await??;
    let mut request = [0u8; 7];
    socket.read_exact(&mut request).await?;
    assert_eq!(&request, b"get k\r\n");

    client.end().await;
    assert_eq!(pending.await?, Err(CacheError::ClientClosed));

    let mut rest = Vec::new();
    let read = timeout(WAIT, socket.read_to_end(&mut rest))
        .await
        .context("socket closed after end")??;
    assert_eq!(read, 0);
    Ok(())
}

#[tokio::test]
async fn dropping_every_handle_shuts_down() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let client = Client::new(addr.as_str(), ClientConfig::default())?;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.get("k").await })
    };
    let (mut socket, _) = timeout(WAIT, listener.accept()).await??;
    let mut request = [0u8; 7];
    socket.read_exact(&mut request).await?;

    drop(client);
    pending.abort();

    let mut rest = Vec::new();
    let read = timeout(WAIT, socket.read_to_end(&mut rest))
        .await
        .context("socket closed once the client is gone")??;
    assert_eq!(read, 0);
    Ok(())
}
