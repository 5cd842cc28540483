//! Public handle to the cache cluster.

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::config::{ClientConfig, ServerId, ServerList};
use crate::dispatcher::{self, ClientRequest};
use crate::error::CacheError;
use crate::events::{EventBus, HealthEvent};
use crate::protocol::{Command, Response, StoreMode};
use crate::tracker::IssueSnapshot;

/// Cheap to clone; every clone talks to the same dispatcher. The dispatcher
/// shuts down on [`Client::end`] or once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Client {
    requests: mpsc::UnboundedSender<ClientRequest>,
    events: EventBus,
}

impl Client {
    /// Builds a client for `servers`. No socket is opened until the first
    /// request. Must be called from inside a Tokio runtime.
    ///
    /// ```no_run
    /// # async fn demo() -> anyhow::Result<()> {
    /// use cache_failover::{Client, ClientConfig};
    ///
    /// let client = Client::new(["127.0.0.1:11211", "127.0.0.1:11212"], ClientConfig::default())?;
    /// client.set("greeting", "hello", 0).await?;
    /// assert_eq!(client.get("greeting").await?, Some(b"hello".to_vec()));
    /// client.end().await;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(servers: impl Into<ServerList>, config: ClientConfig) -> Result<Self> {
        config.validate().context("invalid client options")?;
        let servers = servers.into().into_specs()?;
        tokio::runtime::Handle::try_current()
            .context("the cache client must be created inside a Tokio runtime")?;

        let events = EventBus::new();
        let requests = dispatcher::spawn(servers, config, events.clone());
        Ok(Self { requests, events })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self.execute(Command::Get { key: key.into() }).await? {
            Response::Value(value) => Ok(value),
            other => Err(unexpected("get", other)),
        }
    }

    /// Stores unconditionally. `ttl` is in seconds, `0` means no expiry.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: u32,
    ) -> Result<bool, CacheError> {
        self.store(StoreMode::Set, key, value.into(), ttl).await
    }

    /// Stores only if the key is absent. Returns `false` when it exists.
    pub async fn add(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: u32,
    ) -> Result<bool, CacheError> {
        self.store(StoreMode::Add, key, value.into(), ttl).await
    }

    /// Stores only if the key is present. Returns `false` when it is missing.
    pub async fn replace(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: u32,
    ) -> Result<bool, CacheError> {
        self.store(StoreMode::Replace, key, value.into(), ttl).await
    }

    /// Returns `false` when the key did not exist.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        match self.execute(Command::Delete { key: key.into() }).await? {
            Response::Deleted => Ok(true),
            Response::NotFound => Ok(false),
            other => Err(unexpected("delete", other)),
        }
    }

    pub async fn touch(&self, key: &str, ttl: u32) -> Result<bool, CacheError> {
        match self.execute(Command::Touch {
            key: key.into(),
            ttl,
        })
        .await?
        {
            Response::Touched => Ok(true),
            Response::NotFound => Ok(false),
            other => Err(unexpected("touch", other)),
        }
    }

    async fn store(
        &self,
        mode: StoreMode,
        key: &str,
        value: Vec<u8>,
        ttl: u32,
    ) -> Result<bool, CacheError> {
        let command = Command::Store {
            mode,
            key: key.into(),
            value,
            ttl,
        };
        let name = command.name();
        match self.execute(command).await? {
            Response::Stored => Ok(true),
            Response::NotStored => Ok(false),
            other => Err(unexpected(name, other)),
        }
    }

    /// Routes one command and waits for its single outcome.
    pub async fn execute(&self, command: Command) -> Result<Response, CacheError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ClientRequest::Execute {
            command,
            respond_to,
        })?;
        response.await.map_err(|_| CacheError::ClientClosed)?
    }

    /// Servers a request for `key` would try, in order.
    pub async fn lookup(&self, key: &str) -> Result<Vec<ServerId>, CacheError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ClientRequest::Lookup {
            key: key.into(),
            respond_to,
        })?;
        response.await.map_err(|_| CacheError::ClientClosed)
    }

    /// Servers still in the ring, sorted.
    pub async fn servers(&self) -> Result<Vec<ServerId>, CacheError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ClientRequest::Servers { respond_to })?;
        response.await.map_err(|_| CacheError::ClientClosed)
    }

    /// Health state of one configured server, or `None` if it was never configured.
    pub async fn issue(&self, server: &str) -> Result<Option<IssueSnapshot>, CacheError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ClientRequest::Issue {
            server: server.into(),
            respond_to,
        })?;
        response.await.map_err(|_| CacheError::ClientClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Fails every in-flight request with [`CacheError::ClientClosed`],
    /// cancels timers and closes all sockets. Safe to call more than once.
    pub async fn end(&self) {
        let (respond_to, done) = oneshot::channel();
        if self
            .requests
            .send(ClientRequest::Shutdown { respond_to })
            .is_err()
        {
            debug!("client already closed");
            return;
        }
        // A dropped ack means another `end` got there first.
        let _ = done.await;
    }

    fn send(&self, request: ClientRequest) -> Result<(), CacheError> {
        self.requests
            .send(request)
            .map_err(|_| CacheError::ClientClosed)
    }
}

fn unexpected(command: &str, response: Response) -> CacheError {
    CacheError::protocol(format!("unexpected {command} response {response:?}"))
}
