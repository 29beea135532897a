//! The central JSON-RPC switch.
//!
//! One dispatch task owns every routing table; per-stream reader tasks and
//! aggregation timers only feed it events through a single channel, so no
//! table needs a lock. Suspension points are the awaited reads and writes.

use crate::aggregate::{AggKey, Aggregation, Dispatch};
use crate::backend::{BackendId, BackendName};
use crate::policy::{BackendSeat, Disposition, Policy};
use crate::protocol::{self, RequestId};
use crate::wire::Wire;
use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

/// Target for protocol-event log lines; `chorus_log` gives these the `e` tag
/// and the `event` verbosity level enables exactly this target.
const WIRE_TARGET: &str = "chorus::wire";

/// Options that alter routing behavior.
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    /// Delay every client-bound message by this long (diagnostic aid).
    pub delay: Option<Duration>,
    /// Discard late contributions instead of re-sending aggregations.
    pub drop_tardy: bool,
}

/// One backend as wired into the router.
pub struct BackendLink {
    pub id: BackendId,
    pub name: BackendName,
    pub wire: Arc<dyn Wire>,
}

enum Event {
    Client(Result<Option<Value>>),
    Backend(BackendId, Result<Option<Value>>),
    Timeout(AggKey),
}

/// A client request that has been fanned out and not yet fully answered.
struct Inflight {
    method: String,
    params: Value,
    targets: HashSet<BackendId>,
}

/// A backend-originated request whose id was remapped before reaching the
/// client.
struct ServerRequest {
    original_id: RequestId,
    backend: BackendId,
    method: String,
    params: Value,
}

pub struct Router {
    client: Arc<dyn Wire>,
    links: Vec<BackendLink>,
    seats: Vec<BackendSeat>,
    policy: Box<dyn Policy>,
    options: RouterOptions,
    events: async_channel::Receiver<Event>,
    event_tx: async_channel::Sender<Event>,

    inflight: HashMap<RequestId, Inflight>,
    server_requests: HashMap<i64, ServerRequest>,
    next_remapped_id: i64,
    aggregations: HashMap<AggKey, Aggregation>,
    shutting_down: bool,
    client_open: bool,
    open_backends: usize,
}

impl Router {
    pub fn new(
        client: Arc<dyn Wire>,
        links: Vec<BackendLink>,
        policy: Box<dyn Policy>,
        options: RouterOptions,
    ) -> Self {
        let (event_tx, events) = async_channel::unbounded();
        let seats = links
            .iter()
            .map(|link| BackendSeat::new(link.id, link.name.clone()))
            .collect();
        let open_backends = links.len();

        Self {
            client,
            links,
            seats,
            policy,
            options,
            events,
            event_tx,
            inflight: HashMap::new(),
            server_requests: HashMap::new(),
            next_remapped_id: 0,
            aggregations: HashMap::new(),
            shutting_down: false,
            client_open: true,
            open_backends,
        }
    }

    /// Drive the multiplexer until the client disconnects and every backend
    /// drains. Errors on a backend crash or a client protocol error.
    pub async fn run(mut self) -> Result<()> {
        if let Some(primary) = self.links.first() {
            tracing::info!("Primary server: {}", primary.name);
        }
        if self.links.len() > 1 {
            let secondaries: Vec<String> =
                self.links[1..].iter().map(|link| link.name.get()).collect();
            tracing::info!("Secondary servers: {}", secondaries.join(", "));
        }
        if let Some(delay) = self.options.delay {
            tracing::info!("Delaying client-bound messages by {}ms", delay.as_millis());
        }

        // Reader tasks forward each stream into the event lane and stop at
        // end of stream; dropping them on exit cancels any stragglers.
        let mut readers = Vec::new();
        {
            let tx = self.event_tx.clone();
            let client = self.client.clone();
            readers.push(smol::spawn(async move {
                loop {
                    let next = client.recv().await;
                    let stop = !matches!(next, Ok(Some(_)));
                    if tx.send(Event::Client(next)).await.is_err() || stop {
                        break;
                    }
                }
            }));
        }
        for link in &self.links {
            let tx = self.event_tx.clone();
            let wire = link.wire.clone();
            let id = link.id;
            readers.push(smol::spawn(async move {
                loop {
                    let next = wire.recv().await;
                    let stop = !matches!(next, Ok(Some(_)));
                    if tx.send(Event::Backend(id, next)).await.is_err() || stop {
                        break;
                    }
                }
            }));
        }

        self.dispatch_loop().await
    }

    async fn dispatch_loop(&mut self) -> Result<()> {
        while self.client_open || self.open_backends > 0 {
            let Ok(event) = self.events.recv().await else {
                break;
            };
            match event {
                Event::Client(Ok(Some(message))) => self.on_client_message(message).await?,
                Event::Client(Ok(None)) => {
                    tracing::info!("Client disconnected");
                    self.client_open = false;
                    self.close_backends().await;
                }
                Event::Client(Err(error)) => {
                    self.close_backends().await;
                    bail!("client stream error: {error:#}");
                }
                Event::Backend(id, Ok(Some(message))) => {
                    self.on_backend_message(id, message).await?
                }
                Event::Backend(id, Ok(None)) => self.on_backend_eof(id)?,
                Event::Backend(id, Err(error)) => {
                    tracing::info!("[{}] stream error: {error:#}", self.links[id].name);
                    self.on_backend_eof(id)?;
                }
                Event::Timeout(key) => self.on_aggregation_timeout(key).await,
            }
        }
        Ok(())
    }

    async fn close_backends(&self) {
        for link in &self.links {
            link.wire.close().await;
        }
    }

    fn on_backend_eof(&mut self, id: BackendId) -> Result<()> {
        self.open_backends = self.open_backends.saturating_sub(1);
        if !self.shutting_down {
            bail!("server {} exited unexpectedly", self.links[id].name);
        }
        tracing::info!("[{}] exited", self.links[id].name);
        Ok(())
    }

    async fn on_client_message(&mut self, message: Value) -> Result<()> {
        let method = protocol::method(&message).map(str::to_owned);
        let id = protocol::request_id(&message);

        match (id, method) {
            (None, Some(method)) => self.on_client_notification(method, message).await,
            (Some(id), Some(method)) => self.on_client_request(id, method, message).await,
            (Some(id), None) => self.on_client_response(id, message).await,
            (None, None) => {
                tracing::warn!("Message from client with neither id nor method, dropping");
                Ok(())
            }
        }
    }

    async fn on_client_notification(&mut self, method: String, message: Value) -> Result<()> {
        log_wire_message("-->", &method, &message);
        self.policy
            .on_client_notification(&method, message.get("params"));

        if method == "textDocument/didOpen" || method == "textDocument/didChange" {
            // A fresh fan-out for this document supersedes whatever was
            // already sent; aggregations still pending are left to finish.
            self.aggregations
                .retain(|_, aggregation| aggregation.dispatched == Dispatch::Pending);
        }

        for link in &self.links {
            if let Err(error) = link.wire.send(&message).await {
                tracing::warn!("[{}] write failed: {error:#}", link.name);
            }
        }
        Ok(())
    }

    async fn on_client_request(
        &mut self,
        id: RequestId,
        method: String,
        mut message: Value,
    ) -> Result<()> {
        log_wire_message("-->", &method, &message);
        if method == "shutdown" {
            // Backend EOFs are expected from here on.
            self.shutting_down = true;
        }

        let targets = self
            .policy
            .on_client_request(&method, &mut message, &mut self.seats);

        for &target in &targets {
            let link = &self.links[target];
            log_wire_message(&format!("[{}] -->", link.name), &method, &message);
            if let Err(error) = link.wire.send(&message).await {
                tracing::warn!("[{}] write failed: {error:#}", link.name);
            }
        }

        let params = message.get("params").cloned().unwrap_or(Value::Null);
        self.inflight.insert(
            id,
            Inflight {
                method,
                params,
                targets: targets.into_iter().collect(),
            },
        );
        Ok(())
    }

    async fn on_client_response(&mut self, id: RequestId, mut message: Value) -> Result<()> {
        let entry = match &id {
            RequestId::Number(n) => self.server_requests.remove(n),
            RequestId::String(_) => None,
        };
        let Some(entry) = entry else {
            tracing::warn!("Unknown request for response with id={id}, dropping");
            return Ok(());
        };

        let (payload, is_error) = protocol::response_payload(&message);
        self.policy.on_client_response(
            &entry.method,
            &entry.params,
            payload,
            is_error,
            &self.seats[entry.backend],
        );

        message["id"] = serde_json::to_value(&entry.original_id)?;
        let link = &self.links[entry.backend];
        log_wire_message(&format!("[{}] s->", link.name), &entry.method, &message);
        if let Err(error) = link.wire.send(&message).await {
            tracing::warn!("[{}] write failed: {error:#}", link.name);
        }
        Ok(())
    }

    async fn on_backend_message(&mut self, from: BackendId, message: Value) -> Result<()> {
        let method = protocol::method(&message).map(str::to_owned);
        let id = protocol::request_id(&message);

        match (id, method) {
            (Some(id), Some(method)) => self.on_server_request(from, id, method, message).await,
            (Some(id), None) => self.on_server_response(from, id, message).await,
            (None, Some(method)) => self.on_server_notification(from, method, message).await,
            (None, None) => {
                tracing::info!(
                    "[{}] message with neither id nor method, dropping",
                    self.links[from].name
                );
                Ok(())
            }
        }
    }

    async fn on_server_request(
        &mut self,
        from: BackendId,
        id: RequestId,
        method: String,
        mut message: Value,
    ) -> Result<()> {
        log_wire_message(
            &format!("[{}] <-s", self.links[from].name),
            &method,
            &message,
        );
        self.policy
            .on_server_request(&method, message.get("params"), &self.seats[from]);

        // Give the request an id in our own namespace; the ids of N
        // backends would otherwise collide at the client.
        let remapped = self.next_remapped_id;
        self.next_remapped_id += 1;
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        self.server_requests.insert(
            remapped,
            ServerRequest {
                original_id: id,
                backend: from,
                method: method.clone(),
                params,
            },
        );

        message["id"] = json!(remapped);
        self.send_to_client(message, &method, "<-s").await;
        Ok(())
    }

    async fn on_server_response(
        &mut self,
        from: BackendId,
        id: RequestId,
        mut message: Value,
    ) -> Result<()> {
        let Some(inflight) = self.inflight.get(&id) else {
            tracing::info!("Dropping response to unknown {id}");
            return Ok(());
        };
        let method = inflight.method.clone();
        let request_params = inflight.params.clone();
        let targets = inflight.targets.clone();

        log_wire_message(
            &format!("[{}] <--", self.links[from].name),
            &method,
            &message,
        );

        let is_error = message.get("error").is_some();
        self.policy.on_server_response(
            &method,
            &request_params,
            &mut message,
            is_error,
            &mut self.seats,
            from,
        );

        // A request that targeted one backend needs no aggregation.
        if targets.len() == 1 {
            self.inflight.remove(&id);
            self.send_to_client(message, &method, "<--").await;
            return Ok(());
        }

        let (payload, _) = protocol::response_payload(&message);
        let payload = payload.cloned().unwrap_or(Value::Null);
        self.contribute(from, AggKey::Response(id.clone()), method, targets, Some(id), payload, is_error)
            .await;
        Ok(())
    }

    async fn on_server_notification(
        &mut self,
        from: BackendId,
        method: String,
        mut message: Value,
    ) -> Result<()> {
        let name = self.links[from].name.clone();
        log_wire_message(&format!("[{name}] <--"), &method, &message);
        self.policy
            .on_server_notification(&method, &mut message, &mut self.seats, from);

        match self
            .policy
            .notification_disposition(&method, message.get("params"))
        {
            Disposition::Drop => {
                tracing::info!("Dropping message from {name}: {method}");
            }
            Disposition::Forward => {
                self.send_to_client(message, &method, "<--").await;
            }
            Disposition::Aggregate(key) => {
                let payload = message.get("params").cloned().unwrap_or(Value::Null);
                let targets: HashSet<BackendId> = (0..self.links.len()).collect();
                self.contribute(from, key, method, targets, None, payload, false)
                    .await;
            }
        }
        Ok(())
    }

    /// Create, merge into, or late-handle the aggregation under `key`.
    async fn contribute(
        &mut self,
        from: BackendId,
        key: AggKey,
        method: String,
        targets: HashSet<BackendId>,
        id: Option<RequestId>,
        payload: Value,
        is_error: bool,
    ) {
        match self.aggregations.entry(key.clone()) {
            Entry::Vacant(slot) => {
                let mut outstanding = targets;
                outstanding.remove(&from);

                let timer = {
                    let tx = self.event_tx.clone();
                    let key = key.clone();
                    let timeout =
                        Duration::from_millis(self.policy.aggregation_timeout_ms(&method));
                    smol::spawn(async move {
                        smol::Timer::after(timeout).await;
                        let _ = tx.send(Event::Timeout(key)).await;
                    })
                };

                tracing::info!(
                    "Message from {} starts aggregation for {method}",
                    self.links[from].name
                );
                slot.insert(Aggregation {
                    outstanding,
                    id,
                    method,
                    aggregate: payload,
                    dispatched: Dispatch::Pending,
                    timer: Some(timer),
                });
            }
            Entry::Occupied(mut slot) => {
                let aggregation = slot.get_mut();
                if aggregation.dispatched != Dispatch::Pending {
                    tracing::info!(
                        "Tardy {} contribution to aggregation for {}",
                        self.links[from].name,
                        aggregation.method
                    );
                }

                aggregation.aggregate = self.policy.aggregate_payloads(
                    &aggregation.method,
                    std::mem::take(&mut aggregation.aggregate),
                    &payload,
                    is_error,
                    &self.seats,
                    from,
                );
                aggregation.outstanding.remove(&from);
                if !aggregation.outstanding.is_empty() {
                    return;
                }

                // Aggregation complete.
                match aggregation.dispatched {
                    Dispatch::TimedOut if self.options.drop_tardy => {
                        tracing::warn!(
                            "Dropping tardy message for previously timed-out aggregation for {}",
                            aggregation.method
                        );
                        return;
                    }
                    Dispatch::TimedOut => {
                        tracing::info!(
                            "Re-sending now-complete timed-out aggregation for {}",
                            aggregation.method
                        );
                    }
                    Dispatch::Dispatched if self.options.drop_tardy => {
                        tracing::info!(
                            "Dropping tardy message for previously completed aggregation for {}",
                            aggregation.method
                        );
                        return;
                    }
                    Dispatch::Dispatched => {
                        tracing::info!(
                            "Re-sending enhancement of previously completed aggregation for {}",
                            aggregation.method
                        );
                    }
                    Dispatch::Pending => {
                        tracing::info!("Completing aggregation for {}", aggregation.method);
                    }
                }

                aggregation.timer = None;
                let message = aggregation.reconstruct();
                let method = aggregation.method.clone();
                let request_id = aggregation.id.clone();
                aggregation.dispatched = Dispatch::Dispatched;

                self.send_to_client(message, &method, "<--").await;
                if let Some(request_id) = request_id {
                    self.inflight.remove(&request_id);
                }
            }
        }
    }

    async fn on_aggregation_timeout(&mut self, key: AggKey) {
        // The timer may have fired just as the aggregation completed or was
        // evicted; the dispatch flag guards against double sending.
        let Some(aggregation) = self.aggregations.get_mut(&key) else {
            return;
        };
        if aggregation.dispatched != Dispatch::Pending {
            return;
        }

        tracing::info!("Timeout for aggregation for {}", aggregation.method);
        aggregation.dispatched = Dispatch::TimedOut;
        aggregation.timer = None;
        let message = aggregation.reconstruct();
        let method = aggregation.method.clone();
        self.send_to_client(message, &method, "<--").await;
    }

    async fn send_to_client(&self, message: Value, method: &str, direction: &str) {
        if let Some(delay) = self.options.delay {
            let client = self.client.clone();
            let method = method.to_owned();
            let direction = direction.to_owned();
            smol::spawn(async move {
                smol::Timer::after(delay).await;
                log_wire_message(&direction, &method, &message);
                if let Err(error) = client.send(&message).await {
                    tracing::warn!("Client write failed: {error:#}");
                }
            })
            .detach();
        } else {
            log_wire_message(direction, method, &message);
            if let Err(error) = self.client.send(&message).await {
                tracing::warn!("Client write failed: {error:#}");
            }
        }
    }
}

/// Log one protocol event: direction, method (with id when present), and the
/// full message.
fn log_wire_message(direction: &str, method: &str, message: &Value) {
    let prefix = match protocol::request_id(message) {
        Some(id) => format!("{method}[{id}]"),
        None => method.to_owned(),
    };
    tracing::debug!(target: WIRE_TARGET, "{direction} {prefix} {message}");
}
