//! Service broker: the public entry point of a node.
//!
//! A [`ServiceBroker`] composes the registry, transit and circuit breaker of
//! one node. Calls go through a fixed pipeline:
//!
//! ```text
//!   call(action) ──► registry.get_endpoint ──► breaker.before_call
//!                         (strategy)                  │
//!                                   ┌─────────────────┴────────────┐
//!                                   ▼                              ▼
//!                           local handler                 transit.request
//!                                   └─────────────┬────────────────┘
//!                                                 ▼
//!                              breaker.success / breaker.failure
//!                                                 │ retryable and attempts left?
//!                                                 └──► new attempt, new request id
//! ```

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use crate::bus::LocalBus;
use crate::circuit_breaker::CircuitBreaker;
use crate::codec::{JsonCodec, PacketCodec};
use crate::config::BrokerConfig;
use crate::context::{CallOptions, Context};
use crate::error::MeshError;
use crate::packet::{EventPayload, PROTOCOL_VERSION};
use crate::provider::{Providers, TimeProvider, TokioProviders};
use crate::registry::{Endpoint, NodeId, Registry};
use crate::service::ServiceSchema;
use crate::transit::{ByteStream, ChunkSource, PongInfo, Response, Transit};
use crate::transport::Transporter;

/// One node of the mesh.
pub struct ServiceBroker<P: Providers = TokioProviders> {
    config: BrokerConfig,
    providers: P,
    registry: Rc<Registry>,
    transit: Rc<Transit<P>>,
    breaker: Rc<CircuitBreaker<P>>,
    started: Cell<bool>,
}

impl ServiceBroker<TokioProviders> {
    /// Broker on the Tokio runtime with the JSON codec.
    pub fn with_transporter(config: BrokerConfig, transporter: impl Transporter + 'static) -> Self {
        Self::new(
            config,
            Rc::new(transporter),
            Rc::new(JsonCodec),
            TokioProviders::new(),
        )
    }
}

impl<P: Providers> ServiceBroker<P> {
    /// Assemble a broker from its collaborators.
    pub fn new(
        config: BrokerConfig,
        transporter: Rc<dyn Transporter>,
        codec: Rc<dyn PacketCodec>,
        providers: P,
    ) -> Self {
        let bus = LocalBus::new();
        let registry = Rc::new(Registry::new(
            config.node_id.clone(),
            config.registry.clone(),
            bus.clone(),
        ));
        let transit = Transit::new(
            config.clone(),
            registry.clone(),
            transporter,
            codec,
            providers.clone(),
        );
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone(), providers.clone(), bus);
        Self {
            config,
            providers,
            registry,
            transit,
            breaker,
            started: Cell::new(false),
        }
    }

    /// Local node id.
    pub fn node_id(&self) -> &NodeId {
        self.registry.node_id()
    }

    /// Registry of this node.
    pub fn registry(&self) -> &Rc<Registry> {
        &self.registry
    }

    /// Transit of this node.
    pub fn transit(&self) -> &Rc<Transit<P>> {
        &self.transit
    }

    /// Circuit breaker store of this node.
    pub fn circuit_breaker(&self) -> &Rc<CircuitBreaker<P>> {
        &self.breaker
    }

    /// Local notification bus.
    pub fn bus(&self) -> &LocalBus {
        self.registry.bus()
    }

    /// Whether [`ServiceBroker::start`] ran.
    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    /// CPU usage advertised in heartbeats.
    pub fn set_cpu_usage(&self, cpu: Option<f64>) {
        self.transit.set_cpu_usage(cpu);
    }

    /// Connect to the cluster and start every timer.
    pub async fn start(&self) -> Result<(), MeshError> {
        if self.started.get() {
            return Ok(());
        }
        self.transit.connect().await?;
        self.breaker.start();
        self.started.set(true);
        tracing::info!(
            node_id = %self.node_id(),
            services = self.registry.services().list(true).len(),
            "broker started"
        );
        Ok(())
    }

    /// Leave the cluster. Pending calls fail with `RequestRejected`.
    pub async fn stop(&self) -> Result<(), MeshError> {
        if !self.started.replace(false) {
            return Ok(());
        }
        self.breaker.stop();
        self.transit.disconnect().await?;
        tracing::info!(node_id = %self.node_id(), "broker stopped");
        Ok(())
    }

    /// Register a local service; peers learn about it right away when the
    /// broker is running.
    pub async fn register_service(&self, schema: ServiceSchema) -> Result<(), MeshError> {
        self.registry.register_local_service(schema);
        if self.started.get() {
            self.transit.send_info(None).await?;
        }
        Ok(())
    }

    /// Unregister a local service by full name.
    pub async fn unregister_service(&self, full_name: &str) -> Result<bool, MeshError> {
        let removed = self.registry.unregister_local_service(full_name);
        if removed && self.started.get() {
            self.transit.send_info(None).await?;
        }
        Ok(removed)
    }

    /// Call `action`.
    pub async fn call(
        &self,
        action: &str,
        params: Value,
        opts: CallOptions,
    ) -> Result<Response, MeshError> {
        self.call_from(None, action, params, opts).await
    }

    /// Call `action` from inside a handler; the new context is a child of
    /// `parent`.
    pub async fn call_child(
        &self,
        parent: &Context,
        action: &str,
        params: Value,
        opts: CallOptions,
    ) -> Result<Response, MeshError> {
        self.call_from(Some(parent), action, params, opts).await
    }

    async fn call_from(
        &self,
        parent: Option<&Context>,
        action: &str,
        params: Value,
        mut opts: CallOptions,
    ) -> Result<Response, MeshError> {
        let mut stream = opts.stream.take();
        // A consumed stream cannot be replayed.
        let retries = if stream.is_some() {
            0
        } else {
            opts.retries.unwrap_or(self.config.retries)
        };

        let mut attempt = 0;
        loop {
            let mut ctx = match parent {
                Some(parent) => parent.child(action, params.clone()),
                None => Context::for_action(action, params.clone()),
            };
            ctx.meta.extend(opts.meta.clone());

            let endpoint = self
                .registry
                .get_endpoint(action, &ctx, opts.node_id.as_deref())?;
            ctx.timeout = opts
                .timeout
                .or_else(|| action_timeout(&endpoint))
                .or(self.config.request_timeout);
            self.breaker.before_call(&endpoint);
            tracing::trace!(action, node_id = %endpoint.id, request_id = %ctx.id, attempt, "calling");

            let result = if endpoint.local {
                self.call_local(&endpoint, ctx, stream.take()).await
            } else {
                self.transit.request(&endpoint, ctx, stream.take()).await
            };
            match result {
                Ok(response) => {
                    self.breaker.success(&endpoint);
                    return Ok(response);
                }
                Err(err) => {
                    self.breaker.failure(&endpoint, &err);
                    if attempt < retries && err.is_retryable() {
                        attempt += 1;
                        tracing::warn!(action, attempt, retries, error = %err, "retrying call");
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn call_local(
        &self,
        endpoint: &Endpoint,
        mut ctx: Context,
        stream: Option<ChunkSource>,
    ) -> Result<Response, MeshError> {
        let action = ctx.action.clone().unwrap_or_default();
        let handler = endpoint
            .action()
            .and_then(|definition| definition.handler.clone())
            .ok_or_else(|| MeshError::ServiceNotFound {
                action: action.clone(),
                node_id: Some(self.node_id().clone()),
            })?;
        ctx.node_id = Some(self.node_id().clone());
        ctx.stream = stream.map(ByteStream::local);

        let reply = match ctx.timeout {
            Some(timeout) => {
                let time = self.providers.time().clone();
                tokio::select! {
                    reply = handler.handle(ctx) => reply?,
                    _ = time.sleep(timeout) => {
                        return Err(MeshError::RequestTimeout {
                            action,
                            node_id: self.node_id().clone(),
                            elapsed: timeout,
                        });
                    }
                }
            }
            None => handler.handle(ctx).await?,
        };
        Ok(Response {
            data: reply.data,
            meta: reply.meta,
            stream: reply.stream.map(ByteStream::local),
        })
    }

    fn event_payload(&self, ctx: &Context, groups: Option<Vec<String>>, broadcast: bool) -> EventPayload {
        EventPayload {
            ver: PROTOCOL_VERSION.to_string(),
            sender: self.node_id().clone(),
            id: ctx.id.clone(),
            event: ctx.event.clone().unwrap_or_default(),
            data: ctx.params.clone(),
            groups,
            broadcast,
            meta: ctx.meta.clone(),
            level: ctx.level,
            parent_id: ctx.parent_id.clone(),
            request_id: ctx.request_id.clone(),
        }
    }

    /// Balanced emit: one handler per consumer group receives the event.
    ///
    /// With `groups`, only those groups are considered. Delivery to every
    /// chosen node is attempted; the first send error is returned.
    pub async fn emit(
        &self,
        event: &str,
        data: Value,
        groups: Option<Vec<String>>,
    ) -> Result<(), MeshError> {
        let ctx = Context::for_event(event, data);
        let picked = self.registry.events().balanced_endpoints(
            event,
            groups.as_deref(),
            &ctx,
            self.registry.prefer_local(),
        );
        let mut by_node: BTreeMap<NodeId, Vec<String>> = BTreeMap::new();
        for (endpoint, group) in picked {
            by_node.entry(endpoint.id.clone()).or_default().push(group);
        }
        if by_node.is_empty() {
            tracing::debug!(event, "no subscriber for event");
        }

        let mut first_error = None;
        for (node_id, node_groups) in by_node {
            let payload = self.event_payload(&ctx, Some(node_groups), false);
            if let Err(err) = self.deliver_event(&node_id, payload).await {
                tracing::warn!(event, node_id = %node_id, error = %err, "event delivery failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Broadcast: every node with a matching subscription receives the event
    /// once and runs all of its matching handlers.
    pub async fn broadcast(
        &self,
        event: &str,
        data: Value,
        groups: Option<Vec<String>>,
    ) -> Result<(), MeshError> {
        let ctx = Context::for_event(event, data);
        let nodes: BTreeSet<NodeId> = self
            .registry
            .events()
            .all_endpoints(event, groups.as_deref())
            .iter()
            .map(|endpoint| endpoint.id.clone())
            .collect();

        let mut first_error = None;
        for node_id in nodes {
            let payload = self.event_payload(&ctx, groups.clone(), true);
            if let Err(err) = self.deliver_event(&node_id, payload).await {
                tracing::warn!(event, node_id = %node_id, error = %err, "event delivery failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Run the local handlers of `event` only. Returns how many started.
    pub fn broadcast_local(&self, event: &str, data: Value, groups: Option<Vec<String>>) -> usize {
        let ctx = Context::for_event(event, data);
        let payload = self.event_payload(&ctx, groups, true);
        self.transit.deliver_local_event(&payload)
    }

    async fn deliver_event(&self, node_id: &str, payload: EventPayload) -> Result<(), MeshError> {
        if node_id == self.node_id() {
            self.transit.deliver_local_event(&payload);
            Ok(())
        } else {
            self.transit.send_event(node_id, payload).await
        }
    }

    /// Round trip to `node_id`.
    pub async fn ping(&self, node_id: &str, timeout: Duration) -> Result<PongInfo, MeshError> {
        self.transit.ping(node_id, timeout).await
    }
}

impl<P: Providers> std::fmt::Debug for ServiceBroker<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBroker")
            .field("node_id", self.node_id())
            .field("started", &self.started.get())
            .field("transit", &self.transit)
            .finish()
    }
}

/// Timeout declared on the action itself.
fn action_timeout(endpoint: &Endpoint) -> Option<Duration> {
    endpoint
        .action()
        .and_then(|definition| definition.descriptor.timeout)
        .map(Duration::from_millis)
}
