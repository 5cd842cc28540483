//! Request routing and failover.
//!
//! A single Tokio task owns the ring, the failure tracker, every connection
//! handle and the table of in-flight requests. Callers talk to it through
//! [`ClientRequest`] messages carrying a `oneshot` reply channel; connection
//! tasks report back through [`Completion`]s and tracker timers through
//! [`TimerFired`]. Nothing here is shared, so no locks are needed.
//!
//! Each in-flight request owns its reply sender. Resolving consumes it,
//! which is what guarantees one answer per request.
//!
//! At most one job per server is handed to its connection at a time. Later
//! requests for a busy server wait in that server's [`Lane`] and are admitted
//! again when they reach the front, so a server that failed while they
//! waited is not hit by them.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, Redundancy, ServerId, ServerSpec};
use crate::connection::{Completion, ConnectionOptions, Job, RequestId, ServerConnection};
use crate::error::CacheError;
use crate::events::{EventBus, HealthEvent};
use crate::hash_ring::HashRing;
use crate::protocol::{self, Command, Response};
use crate::tracker::{Admission, FailureOutcome, FailureTracker, IssueSnapshot, TimerFired};

pub(crate) type Reply = oneshot::Sender<Result<Response, CacheError>>;

pub(crate) enum ClientRequest {
    Execute {
        command: Command,
        respond_to: Reply,
    },
    Lookup {
        key: String,
        respond_to: oneshot::Sender<Vec<ServerId>>,
    },
    Issue {
        server: ServerId,
        respond_to: oneshot::Sender<Option<IssueSnapshot>>,
    },
    Servers {
        respond_to: oneshot::Sender<Vec<ServerId>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// An admitted request, either queued for a server or waiting on its reply.
struct Request {
    command: Command,
    /// Candidates not tried yet, in ring order.
    fallbacks: VecDeque<ServerId>,
    /// Most recent health failure, returned once candidates run out.
    last_error: Option<CacheError>,
    /// Server that this request's failures pushed out of the ring.
    removed: Option<ServerId>,
    respond_to: Reply,
}

impl Request {
    fn resolve(self, result: Result<Response, CacheError>) {
        // The caller may have given up waiting; that is not an error here.
        let _ = self.respond_to.send(result);
    }
}

/// Requests bound for one server.
#[derive(Default)]
struct Lane {
    /// A job is with the connection task and has not completed.
    busy: bool,
    waiting: VecDeque<RequestId>,
}

/// Spawns the dispatcher task. Must be called inside a Tokio runtime.
pub(crate) fn spawn(
    servers: Vec<ServerSpec>,
    config: ClientConfig,
    events: EventBus,
) -> mpsc::UnboundedSender<ClientRequest> {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let worker = Worker::new(servers, config, events, request_rx);
    tokio::spawn(worker.run());
    request_tx
}

struct Worker {
    ring: HashRing,
    tracker: FailureTracker,
    connections: HashMap<ServerId, ServerConnection>,
    lanes: HashMap<ServerId, Lane>,
    retired: Vec<JoinHandle<()>>,
    pending: HashMap<RequestId, Request>,
    next_request: RequestId,
    redundancy: Redundancy,
    max_key_size: usize,
    options: ConnectionOptions,
    events: EventBus,
    requests: mpsc::UnboundedReceiver<ClientRequest>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
}

impl Worker {
    fn new(
        servers: Vec<ServerSpec>,
        config: ClientConfig,
        events: EventBus,
        requests: mpsc::UnboundedReceiver<ClientRequest>,
    ) -> Self {
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let options = ConnectionOptions::from(&config);

        let connections = servers
            .iter()
            .map(|spec| {
                let connection =
                    ServerConnection::spawn(spec.addr.clone(), options, completion_tx.clone());
                (spec.addr.clone(), connection)
            })
            .collect();
        let lanes = servers
            .iter()
            .map(|spec| (spec.addr.clone(), Lane::default()))
            .collect();

        Self {
            ring: HashRing::new(&servers),
            tracker: FailureTracker::new(&servers, &config, events.clone(), timer_tx),
            connections,
            lanes,
            retired: Vec::new(),
            pending: HashMap::new(),
            next_request: 0,
            redundancy: config.redundancy,
            max_key_size: config.max_key_size,
            options,
            events,
            requests,
            completion_tx,
            completions,
            timers,
        }
    }

    async fn run(mut self) {
        info!(servers = self.ring.len(), "dispatcher started");
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request).await {
                            return;
                        }
                    }
                    // Every client handle was dropped.
                    None => break,
                },
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
                Some(fired) = self.timers.recv() => self.tracker.on_timer(fired),
            }
        }
        self.shutdown().await;
    }

    /// Returns `false` once shutdown has completed.
    async fn handle_request(&mut self, request: ClientRequest) -> bool {
        match request {
            ClientRequest::Execute {
                command,
                respond_to,
            } => self.start(command, respond_to),
            ClientRequest::Lookup { key, respond_to } => {
                let _ = respond_to.send(self.ring.lookup(&key, self.redundancy.replicas()));
            }
            ClientRequest::Issue { server, respond_to } => {
                let _ = respond_to.send(self.tracker.snapshot(&server));
            }
            ClientRequest::Servers { respond_to } => {
                let mut servers: Vec<ServerId> = self.ring.servers().cloned().collect();
                servers.sort();
                let _ = respond_to.send(servers);
            }
            ClientRequest::Shutdown { respond_to } => {
                self.shutdown().await;
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    fn start(&mut self, command: Command, respond_to: Reply) {
        if let Err(err) = protocol::validate_key(command.key(), self.max_key_size) {
            let _ = respond_to.send(Err(err));
            return;
        }

        let fallbacks: VecDeque<ServerId> = self
            .ring
            .lookup(command.key(), self.redundancy.replicas())
            .into();
        let request = Request {
            command,
            fallbacks,
            last_error: None,
            removed: None,
            respond_to,
        };

        self.next_request += 1;
        let id = self.next_request;
        self.advance(id, request);
    }

    /// Moves the request to its next admissible candidate, or resolves it
    /// when none is left.
    fn advance(&mut self, id: RequestId, request: Request) {
        if let Err(request) = self.dispatch(id, request) {
            self.exhaust(request);
        }
    }

    /// Sends the request to the first admissible candidate, or queues it in
    /// that candidate's lane if a job is already out. Hands the request back
    /// when every candidate is rejected.
    fn dispatch(&mut self, id: RequestId, mut request: Request) -> Result<(), Request> {
        while let Some(server) = request.fallbacks.pop_front() {
            let admission = self.tracker.admit(&server);
            if admission != Admission::Admit {
                debug!(%server, ?admission, key = request.command.key(), "skipping server");
                continue;
            }

            let lane = self.lanes.entry(server.clone()).or_default();
            if lane.busy {
                lane.waiting.push_back(id);
                debug!(%server, id, queued = lane.waiting.len(), "server busy, request queued");
                self.pending.insert(id, request);
                return Ok(());
            }

            match self.send(&server, id, &request.command) {
                Ok(()) => {
                    self.pending.insert(id, request);
                    return Ok(());
                }
                Err(err) => self.note_failure(&server, err, &mut request),
            }
        }
        Err(request)
    }

    /// Hands one job to the server's connection task. A task that has
    /// stopped is replaced and the attempt counts as a failure.
    fn send(&mut self, server: &str, id: RequestId, command: &Command) -> Result<(), CacheError> {
        let Some(connection) = self.connections.get(server) else {
            return Err(CacheError::connection_lost(server));
        };
        let job = Job {
            request: id,
            command: command.clone(),
        };
        if connection.submit(job).is_err() {
            warn!(server, "connection task stopped, starting a new one");
            let connection =
                ServerConnection::spawn(server.to_string(), self.options, self.completion_tx.clone());
            self.connections.insert(server.to_string(), connection);
            return Err(CacheError::connection_lost(server));
        }

        self.lanes.entry(server.to_string()).or_default().busy = true;
        Ok(())
    }

    /// Charges a health failure on `server` to the tracker.
    fn note_failure(&mut self, server: &str, err: CacheError, request: &mut Request) {
        warn!(server, error = %err, key = request.command.key(), "request failed");
        if self.tracker.record_failure(server, &err) == FailureOutcome::Removed {
            self.remove_server(server);
            request.removed = Some(server.to_string());
        }
        request.last_error = Some(err);
    }

    /// Resolves a request that ran out of candidates.
    fn exhaust(&mut self, mut request: Request) {
        let Some(err) = request.last_error.take() else {
            debug!(key = request.command.key(), "no server available");
            request.resolve(Err(CacheError::ServerNotAvailable));
            return;
        };
        if let Some(server) = request.removed.take() {
            self.events.emit(HealthEvent::Failure {
                server,
                error: err.clone(),
            });
        }
        request.resolve(Err(err));
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            request: id,
            server,
            result,
        } = completion;
        if let Some(lane) = self.lanes.get_mut(&server) {
            lane.busy = false;
        }

        match self.pending.remove(&id) {
            Some(request) => self.settle(id, &server, request, result),
            None => debug!(%server, id, "completion for unknown request"),
        }
        self.pump(&server);
    }

    fn settle(
        &mut self,
        id: RequestId,
        server: &str,
        mut request: Request,
        result: Result<Response, CacheError>,
    ) {
        match result {
            Ok(response) => {
                self.tracker.record_success(server);
                request.resolve(Ok(response));
            }
            Err(err) if !err.is_health_failure() => request.resolve(Err(err)),
            Err(err) => {
                self.note_failure(server, err, &mut request);
                if !request.fallbacks.is_empty() {
                    debug!(server, id, "falling back to next server");
                }
                self.advance(id, request);
            }
        }
    }

    /// Sends the next waiting request to a server that has gone idle. Each
    /// one is admitted again first; rejected ones move on to their other
    /// candidates without touching the server.
    fn pump(&mut self, server: &str) {
        loop {
            let Some(lane) = self.lanes.get_mut(server) else {
                return;
            };
            if lane.busy {
                return;
            }
            let Some(id) = lane.waiting.pop_front() else {
                return;
            };
            let Some(mut request) = self.pending.remove(&id) else {
                continue;
            };

            let admission = self.tracker.admit(server);
            if admission != Admission::Admit {
                debug!(server, ?admission, id, "queued request no longer admitted");
                self.advance(id, request);
                continue;
            }
            match self.send(server, id, &request.command) {
                Ok(()) => {
                    self.pending.insert(id, request);
                }
                Err(err) => {
                    self.note_failure(server, err, &mut request);
                    self.advance(id, request);
                }
            }
        }
    }

    fn remove_server(&mut self, server: &str) {
        if !self.ring.contains(server) {
            return;
        }
        self.ring.remove(server);
        if let Some(connection) = self.connections.remove(server) {
            self.retired.push(connection.retire());
        }
        info!(server, remaining = self.ring.len(), "server removed from ring");
    }

    async fn shutdown(&mut self) {
        let pending = self.pending.len();
        for (_, request) in self.pending.drain() {
            request.resolve(Err(CacheError::ClientClosed));
        }
        self.lanes.clear();
        let timers = self.tracker.shutdown();

        for (_, connection) in self.connections.drain() {
            connection.close().await;
        }
        for task in self.retired.drain(..) {
            task.abort();
            let _ = task.await;
        }
        info!(pending, timers, "dispatcher stopped");
    }
}
