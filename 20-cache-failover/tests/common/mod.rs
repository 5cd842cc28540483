#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use cache_failover::{EventKind, HealthEvent};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

pub const WAIT: Duration = Duration::from_secs(3);

/// Keys starting with this make the mock answer `SERVER_ERROR`.
pub const SERVER_ERROR_KEY: &str = "server-error";

const LOCALHOST_ANY: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

type Store = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// In-process memcached speaking the single-key text subset.
pub struct MockServer {
    pub addr: SocketAddr,
    store: Store,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Result<Self> {
        Self::spawn(LOCALHOST_ANY, false).await
    }

    /// Rebinds a previously used address, e.g. to bring a stopped server back.
    pub async fn start_at(addr: SocketAddr) -> Result<Self> {
        Self::spawn(addr, false).await
    }

    /// Accepts connections and reads requests but never answers.
    pub async fn silent() -> Result<Self> {
        Self::spawn(LOCALHOST_ANY, true).await
    }

    async fn spawn(addr: SocketAddr, silent: bool) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind mock server on {addr}"))?;
        let addr = listener.local_addr()?;
        let store: Store = Arc::default();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let shared = Arc::clone(&store);
        let task = tokio::spawn(async move {
            let mut sessions = Vec::new();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let store = Arc::clone(&shared);
                        sessions.push(tokio::spawn(async move {
                            let _ = serve(stream, store, silent).await;
                        }));
                    }
                }
            }
            for session in sessions {
                session.abort();
            }
        });

        Ok(Self {
            addr,
            store,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn insert(&self, key: &str, value: &[u8]) {
        if let Ok(mut store) = self.store.lock() {
            store.insert(key.to_string(), value.to_vec());
        }
    }

    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.store.lock().ok()?.get(key).cloned()
    }

    /// Closes the listener and every open session.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }
}

async fn serve(stream: tokio::net::TcpStream, store: Store, silent: bool) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        if silent {
            continue;
        }
        let parts: Vec<&str> = line.trim_end().split(' ').collect();
        match parts.as_slice() {
            ["get", key] if key.starts_with(SERVER_ERROR_KEY) => {
                reply(&mut writer, "SERVER_ERROR simulated failure").await?;
            }
            ["get", key] => {
                let value = store.lock().ok().and_then(|s| s.get(*key).cloned());
                match value {
                    Some(value) => {
                        let header = format!("VALUE {key} 0 {}\r\n", value.len());
                        writer.write_all(header.as_bytes()).await?;
                        writer.write_all(&value).await?;
                        writer.write_all(b"\r\nEND\r\n").await?;
                    }
                    None => writer.write_all(b"END\r\n").await?,
                }
            }
            [verb @ ("set" | "add" | "replace"), key, _flags, _ttl, len] => {
                let len: usize = len.parse()?;
                let mut data = vec![0u8; len + 2];
                reader.read_exact(&mut data).await?;
                data.truncate(len);
                let stored = store_value(&store, verb, key, data);
                reply(&mut writer, if stored { "STORED" } else { "NOT_STORED" }).await?;
            }
            ["delete", key] => {
                let removed = store.lock().ok().and_then(|mut s| s.remove(*key)).is_some();
                reply(&mut writer, if removed { "DELETED" } else { "NOT_FOUND" }).await?;
            }
            ["touch", key, _ttl] => {
                let exists = store.lock().ok().is_some_and(|s| s.contains_key(*key));
                reply(&mut writer, if exists { "TOUCHED" } else { "NOT_FOUND" }).await?;
            }
            _ => reply(&mut writer, "ERROR").await?,
        }
    }
}

fn store_value(store: &Store, verb: &str, key: &str, data: Vec<u8>) -> bool {
    let Ok(mut store) = store.lock() else {
        return false;
    };
    let exists = store.contains_key(key);
    let allowed = match verb {
        "add" => !exists,
        "replace" => exists,
        _ => true,
    };
    if allowed {
        store.insert(key.to_string(), data);
    }
    allowed
}

async fn reply(writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    Ok(())
}

/// An address nothing listens on, so connecting is refused.
pub async fn refused_addr() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr.to_string())
}

/// Collects every event emitted within `window`.
pub async fn collect_events(
    events: &mut broadcast::Receiver<HealthEvent>,
    window: Duration,
) -> Vec<HealthEvent> {
    let deadline = Instant::now() + window;
    let mut seen = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        seen.push(event);
    }
    seen
}

/// Waits for the first event of `kind`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<HealthEvent>,
    kind: EventKind,
) -> Result<HealthEvent> {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await?;
            if event.kind() == kind {
                return Ok::<_, anyhow::Error>(event);
            }
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {kind:?}"))?
}

pub fn count(events: &[HealthEvent], kind: EventKind) -> usize {
    events.iter().filter(|event| event.kind() == kind).count()
}
