//! One persistent socket per cache node.
//!
//! Each [`ServerConnection`] is a Tokio task that owns the socket and a FIFO
//! job queue. The protocol is not pipelined, so the task serves one job at a
//! time: connect if needed, write the command, read the reply, then report a
//! [`Completion`] to the dispatcher. Failures close the socket and are
//! reported, never retried here; retry policy lives in the tracker and the
//! dispatcher.

use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::config::{ClientConfig, ServerId};
use crate::error::CacheError;
use crate::protocol::{self, Command, ReadError, Response};

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
pub struct Job {
    pub request: RequestId,
    pub command: Command,
}

#[derive(Debug)]
pub struct Completion {
    pub request: RequestId,
    pub server: ServerId,
    pub result: Result<Response, CacheError>,
}

/// Limits applied by every connection task.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Bounds both the connect and each request/reply round trip.
    pub timeout: Duration,
    pub idle: Duration,
    pub max_value: usize,
}

impl From<&ClientConfig> for ConnectionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            timeout: config.timeout,
            idle: config.idle,
            max_value: config.max_value,
        }
    }
}

/// Handle to a node's connection task.
pub struct ServerConnection {
    server: ServerId,
    jobs: mpsc::UnboundedSender<Job>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl ServerConnection {
    /// Spawns the connection task. No socket is opened until the first job.
    pub fn spawn(
        server: ServerId,
        options: ConnectionOptions,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let worker = Worker {
            server: server.clone(),
            options,
            stream: None,
            last_active: Instant::now(),
            state: state_tx,
            jobs: jobs_rx,
            completions,
        };
        let task = tokio::spawn(worker.run());

        Self {
            server,
            jobs: jobs_tx,
            state: state_rx,
            task,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Queues a job behind any already waiting. Hands the job back if the
    /// task is gone.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        self.jobs.send(job).map_err(|err| err.0)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stops accepting jobs. The task still serves what is queued, reports
    /// each completion, then exits and closes the socket.
    pub fn retire(self) -> JoinHandle<()> {
        let Self { server, task, .. } = self;
        debug!(%server, "connection retired");
        task
    }

    #[cfg(test)]
    pub(crate) fn abort(&self) {
        self.task.abort();
    }

    /// Stops the task and waits for it, so the socket is closed on return.
    /// A job cut off mid-exchange still reports a completion; queued jobs
    /// are dropped without one.
    pub async fn close(self) {
        self.task.abort();
        let _ = self.task.await;
        debug!(server = %self.server, "connection closed");
    }
}

type Stream = (BufReader<OwnedReadHalf>, OwnedWriteHalf);

struct Worker {
    server: ServerId,
    options: ConnectionOptions,
    stream: Option<Stream>,
    last_active: Instant,
    state: watch::Sender<ConnectionState>,
    jobs: mpsc::UnboundedReceiver<Job>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let idle_deadline = self.last_active + self.options.idle;
            tokio::select! {
                job = self.jobs.recv() => match job {
                    Some(job) => self.serve(job).await,
                    None => break,
                },
                _ = time::sleep_until(idle_deadline), if self.stream.is_some() => {
                    debug!(server = %self.server, idle = ?self.options.idle, "closing idle connection");
                    self.disconnect();
                }
            }
        }
        self.disconnect();
    }

    async fn serve(&mut self, job: Job) {
        let reply = PendingReply {
            request: job.request,
            server: self.server.clone(),
            completions: self.completions.clone(),
            sent: false,
        };
        let result = self.exchange(&job.command).await;
        if let Err(err) = &result {
            if err.is_health_failure() {
                debug!(server = %self.server, error = %err, "dropping connection after failure");
                self.disconnect();
            }
        }
        self.last_active = Instant::now();
        reply.send(result);
    }

    async fn exchange(&mut self, command: &Command) -> Result<Response, CacheError> {
        if self.stream.is_none() {
            let stream = self.connect().await?;
            self.stream = Some(stream);
        }
        let ConnectionOptions {
            timeout, max_value, ..
        } = self.options;
        let server = &self.server;
        let Some((reader, writer)) = self.stream.as_mut() else {
            return Err(CacheError::closed_by_peer(server));
        };

        let round_trip = async {
            protocol::write_command(writer, command).await?;
            protocol::read_response(reader, command, max_value).await
        };
        match time::timeout(timeout, round_trip).await {
            Err(_) => Err(CacheError::timeout()),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(read_error(server, err)),
        }
    }

    async fn connect(&mut self) -> Result<Stream, CacheError> {
        self.state.send_replace(ConnectionState::Connecting);

        let attempt = time::timeout(self.options.timeout, TcpStream::connect(self.server.as_str())).await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(CacheError::connect(&self.server, &err));
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(CacheError::timeout());
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!(server = %self.server, ?err, "failed to set TCP_NODELAY");
        }
        info!(server = %self.server, "connected");
        self.state.send_replace(ConnectionState::Connected);

        let (reader, writer) = stream.into_split();
        Ok((BufReader::new(reader), writer))
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            info!(server = %self.server, "disconnected");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

/// Reports the completion of one job exactly once. Dropping it unsent, when
/// the task is aborted or unwinds mid-exchange, reports a lost connection.
struct PendingReply {
    request: RequestId,
    server: ServerId,
    completions: mpsc::UnboundedSender<Completion>,
    sent: bool,
}

impl PendingReply {
    fn send(mut self, result: Result<Response, CacheError>) {
        self.sent = true;
        self.report(result);
    }

    fn report(&self, result: Result<Response, CacheError>) {
        let completion = Completion {
            request: self.request,
            server: self.server.clone(),
            result,
        };
        if self.completions.send(completion).is_err() {
            debug!(server = %self.server, "dispatcher gone, discarding completion");
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.sent {
            self.report(Err(CacheError::connection_lost(&self.server)));
        }
    }
}

fn read_error(server: &str, err: ReadError) -> CacheError {
    match err {
        ReadError::Io(err) => CacheError::io(server, &err),
        ReadError::Eof => CacheError::closed_by_peer(server),
        ReadError::Malformed(message) => CacheError::protocol(format!("{server}: {message}")),
        ReadError::Server(message) => CacheError::Server { message },
    }
}
