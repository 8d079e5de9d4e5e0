//! Transit: the packet protocol engine of one broker.
//!
//! Transit turns registry operations into packets and received packets into
//! registry updates. It owns the pending request table, the inbound stream
//! reassemblers, the outbound stream windows and every protocol timer.
//!
//! ```text
//!   transporter ──► inbox ──► receive loop ──► decode / version / validate
//!                                                   │
//!         ┌──────────────┬──────────────┬───────────┴───┬──────────────┐
//!         ▼              ▼              ▼               ▼              ▼
//!   DISCOVER/INFO   HEARTBEAT     REQUEST/RESPONSE    EVENT      PING/GOSSIP/ACK
//!   registry        liveness,     handlers, pending   local      latency, digests,
//!                   follow-ups    table, streams      handlers   stream windows
//! ```
//!
//! Timers started on [`Transit::connect`]:
//!
//! | loop              | interval                        |
//! |-------------------|---------------------------------|
//! | heartbeat         | `heartbeat_interval`            |
//! | liveness sweep    | `heartbeat_interval`            |
//! | offline cleanup   | 30s, if cleanup is enabled      |
//! | gossip            | `gossip_interval`, if non-zero  |
//! | latency pings     | `latency_ping_interval`, if set |

pub mod pending;
pub mod stream;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::rc::{Rc, Weak};
use std::time::Duration;

use lru::LruCache;
use rand::prelude::IndexedRandom;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::bus::LocalEvent;
use crate::codec::PacketCodec;
use crate::config::BrokerConfig;
use crate::context::{new_context_id, Context};
use crate::error::MeshError;
use crate::packet::{
    DisconnectPayload, DiscoverPayload, EventPayload, HeartbeatPayload, Meta, Packet,
    PacketPayload, PingPayload, PongPayload, RequestPayload, ResponsePayload, StreamAckPayload,
    PROTOCOL_VERSION,
};
use crate::provider::{Providers, TaskProvider, TaskSet, TimeProvider};
use crate::registry::{Endpoint, HeartbeatOutcome, NodeId, Registry};
use crate::service::Reply;
use crate::transport::{IncomingMessage, Topic, Transporter};

use stream::{Fragment, PushOutcome, SendWindow, StreamReassembler, STREAM_CANCELLED};

pub use pending::{PendingRequests, Response, ResponseReceiver};
pub use stream::{chunk_channel, ByteStream, ChunkSource};

/// How often offline nodes are checked for expiry.
const OFFLINE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Action name reported by ping timeouts.
const PING_ACTION: &str = "$node.ping";

/// How many closed inbound stream ids are remembered to drop late fragments.
const CLOSED_STREAM_MEMORY: usize = 1024;

/// Result of a PING round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct PongInfo {
    /// Answering node.
    pub node_id: NodeId,
    /// Round-trip time.
    pub elapsed: Duration,
    /// Estimated clock difference in milliseconds (remote minus local).
    pub time_diff_ms: i64,
}

type ChunkReceiver = mpsc::UnboundedReceiver<Result<Vec<u8>, MeshError>>;

#[derive(Debug)]
struct IncomingStream {
    node_id: NodeId,
    reassembler: StreamReassembler,
    /// Taken when the header arrives.
    receiver: Option<ChunkReceiver>,
}

#[derive(Debug)]
struct PendingPing {
    node_id: NodeId,
    started: Duration,
    sender: oneshot::Sender<PongInfo>,
}

/// Direction of an outbound stream.
#[derive(Debug, Clone)]
enum StreamDirection {
    Request { action: String, level: u32 },
    Response,
}

/// Protocol engine of one broker.
pub struct Transit<P: Providers> {
    config: BrokerConfig,
    registry: Rc<Registry>,
    transporter: Rc<dyn Transporter>,
    codec: Rc<dyn PacketCodec>,
    providers: P,
    pending: PendingRequests,
    incoming: RefCell<HashMap<String, IncomingStream>>,
    closed_streams: RefCell<LruCache<String, ()>>,
    windows: RefCell<HashMap<String, Rc<SendWindow>>>,
    pings: RefCell<HashMap<String, PendingPing>>,
    cpu: Cell<Option<f64>>,
    connected: Cell<bool>,
    tasks: TaskSet,
    me: Weak<Self>,
}

impl<P: Providers> Transit<P> {
    /// Create a transit bound to `registry`.
    pub fn new(
        config: BrokerConfig,
        registry: Rc<Registry>,
        transporter: Rc<dyn Transporter>,
        codec: Rc<dyn PacketCodec>,
        providers: P,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            config,
            registry,
            transporter,
            codec,
            providers,
            pending: PendingRequests::new(),
            incoming: RefCell::new(HashMap::new()),
            closed_streams: RefCell::new(LruCache::new(
                NonZeroUsize::new(CLOSED_STREAM_MEMORY).unwrap_or(NonZeroUsize::MIN),
            )),
            windows: RefCell::new(HashMap::new()),
            pings: RefCell::new(HashMap::new()),
            cpu: Cell::new(None),
            connected: Cell::new(false),
            tasks: TaskSet::new(),
            me: me.clone(),
        })
    }

    /// Local node id.
    pub fn node_id(&self) -> &NodeId {
        self.registry.node_id()
    }

    /// Pending request table.
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Whether [`Transit::connect`] succeeded and no disconnect happened since.
    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    /// CPU usage reported in heartbeats.
    pub fn set_cpu_usage(&self, cpu: Option<f64>) {
        self.cpu.set(cpu);
    }

    /// Inbound streams not yet finished.
    pub fn open_streams(&self) -> usize {
        self.incoming.borrow().len()
    }

    /// Outbound streams still being sent.
    pub fn outbound_streams(&self) -> usize {
        self.windows.borrow().len()
    }

    fn now(&self) -> Duration {
        self.providers.time().now()
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.tasks.push(self.providers.task().spawn_task(name, future));
    }

    fn spawn_periodic<F, Fut>(&self, name: &str, interval: Duration, tick: F)
    where
        F: Fn(Rc<Self>) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        if interval.is_zero() {
            return;
        }
        let me = self.me.clone();
        let time = self.providers.time().clone();
        self.spawn(name, async move {
            loop {
                time.sleep(interval).await;
                let Some(transit) = me.upgrade() else {
                    break;
                };
                tick(transit).await;
            }
        });
    }

    // -- lifecycle ------------------------------------------------------

    /// Connect the transporter, start the timers and announce this node.
    pub async fn connect(&self) -> Result<(), MeshError> {
        let (inbox, mut rx) = mpsc::unbounded_channel::<IncomingMessage>();
        self.transporter.connect(inbox).await?;
        self.connected.set(true);

        let me = self.me.clone();
        self.spawn("transit_receive", async move {
            while let Some(message) = rx.recv().await {
                let Some(transit) = me.upgrade() else {
                    break;
                };
                transit.handle_message(message).await;
            }
        });
        self.start_timers();

        self.send_info(None).await?;
        self.discover(None).await?;
        tracing::info!(node_id = %self.node_id(), namespace = %self.config.namespace, "transit connected");
        Ok(())
    }

    fn start_timers(&self) {
        let heartbeat = self.config.heartbeat_interval;
        self.spawn_periodic("transit_heartbeat", heartbeat, |transit| async move {
            if let Err(err) = transit.send_heartbeat().await {
                tracing::warn!(error = %err, "failed to send heartbeat");
            }
        });
        self.spawn_periodic("transit_liveness", heartbeat, |transit| async move {
            transit.check_remote_nodes();
        });

        let cleanup = self.config.clean_offline_nodes_timeout;
        if !cleanup.is_zero() {
            self.spawn_periodic(
                "transit_offline_cleanup",
                OFFLINE_CHECK_INTERVAL.min(cleanup),
                move |transit| async move {
                    transit.registry.check_offline_nodes(transit.now(), cleanup);
                },
            );
        }

        self.spawn_periodic("transit_gossip", self.config.gossip_interval, |transit| async move {
            transit.gossip_once().await;
        });

        let latency = self.config.latency_ping_interval;
        self.spawn_periodic("transit_latency", latency, move |transit| async move {
            for node_id in transit.registry.nodes().remote_ids(true) {
                let pinger = transit.clone();
                transit.spawn("transit_latency_ping", async move {
                    if let Err(err) = pinger.ping(&node_id, latency).await {
                        tracing::debug!(node_id = %node_id, error = %err, "latency ping failed");
                    }
                });
            }
        });
    }

    /// Announce departure, stop every timer and fail everything in flight.
    pub async fn disconnect(&self) -> Result<(), MeshError> {
        if !self.connected.replace(false) {
            return Ok(());
        }
        let goodbye = PacketPayload::Disconnect(DisconnectPayload::new(self.node_id().clone()));
        if let Err(err) = self.publish(Packet::broadcast(goodbye)).await {
            tracing::warn!(error = %err, "failed to announce disconnect");
        }
        let result = self.transporter.disconnect().await;

        self.tasks.abort_all();
        let rejected = self.pending.reject_all("transit stopped");
        for (id, mut stream) in self.incoming.borrow_mut().drain() {
            stream.reassembler.fail(MeshError::RequestRejected {
                action: id,
                node_id: stream.node_id,
                reason: "transit stopped".to_string(),
            });
        }
        for (_, window) in self.windows.borrow_mut().drain() {
            window.close();
        }
        self.pings.borrow_mut().clear();

        tracing::info!(node_id = %self.node_id(), rejected, "transit disconnected");
        result.map_err(MeshError::from)
    }

    // -- publishing -----------------------------------------------------

    /// Encode and publish `packet`.
    pub async fn publish(&self, packet: Packet) -> Result<(), MeshError> {
        let kind = packet.packet_type();
        let namespace = self.config.namespace.clone();
        let topic = match &packet.target {
            Some(target) => Topic::targeted(namespace, kind, target.clone()),
            None => Topic::broadcast(namespace, kind),
        };
        let bytes = self.codec.serialize(&packet)?;
        tracing::trace!(topic = %topic, bytes = bytes.len(), "publishing packet");
        self.transporter.send(&topic, bytes).await?;
        Ok(())
    }

    /// Send our INFO to `target`, or to everyone.
    pub async fn send_info(&self, target: Option<&str>) -> Result<(), MeshError> {
        let payload = PacketPayload::Info(self.registry.local_info());
        let packet = match target {
            Some(target) => Packet::to(target, payload),
            None => Packet::broadcast(payload),
        };
        self.publish(packet).await
    }

    /// Ask `target`, or everyone, for INFO.
    pub async fn discover(&self, target: Option<&str>) -> Result<(), MeshError> {
        let payload = PacketPayload::Discover(DiscoverPayload::new(self.node_id().clone()));
        let packet = match target {
            Some(target) => Packet::to(target, payload),
            None => Packet::broadcast(payload),
        };
        self.publish(packet).await
    }

    /// Broadcast a heartbeat carrying our info seq.
    pub async fn send_heartbeat(&self) -> Result<(), MeshError> {
        let payload = HeartbeatPayload::new(
            self.node_id().clone(),
            self.cpu.get(),
            self.registry.local_seq(),
        );
        self.publish(Packet::broadcast(PacketPayload::Heartbeat(payload))).await
    }

    /// Send an EVENT to one node.
    pub async fn send_event(&self, target: &str, payload: EventPayload) -> Result<(), MeshError> {
        tracing::debug!(node_id = %target, event = %payload.event, "sending event");
        self.publish(Packet::to(target, PacketPayload::Event(payload))).await
    }

    // -- liveness -------------------------------------------------------

    /// Disconnect nodes whose heartbeats stopped.
    pub fn check_remote_nodes(&self) {
        let now = self.now();
        for node_id in self.registry.check_remote_nodes(now, self.config.heartbeat_timeout) {
            self.node_lost(&node_id);
        }
    }

    /// Fail everything tied to `node_id`.
    fn node_lost(&self, node_id: &str) {
        self.pending.reject_node(node_id);

        let lost: Vec<String> = self
            .incoming
            .borrow()
            .iter()
            .filter(|(_, s)| s.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in lost {
            if let Some(mut stream) = self.incoming.borrow_mut().remove(&id) {
                stream.reassembler.fail(MeshError::NodeUnavailable {
                    node_id: node_id.to_string(),
                });
            }
        }

        self.windows.borrow_mut().retain(|_, window| {
            if window.node_id == node_id {
                window.close();
                false
            } else {
                true
            }
        });
        self.pings.borrow_mut().retain(|_, ping| ping.node_id != node_id);
    }

    async fn gossip_once(&self) {
        let peers = self.registry.nodes().remote_ids(true);
        let Some(peer) = peers.choose(&mut rand::rng()).cloned() else {
            return;
        };
        let request = self.registry.gossip_request();
        tracing::trace!(node_id = %peer, "sending gossip digest");
        if let Err(err) = self
            .publish(Packet::to(peer, PacketPayload::GossipRequest(request)))
            .await
        {
            tracing::debug!(error = %err, "gossip request failed");
        }
    }

    // -- receiving ------------------------------------------------------

    async fn handle_message(&self, message: IncomingMessage) {
        let packet = match self.codec.deserialize(&message.bytes, message.kind) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(kind = %message.kind, error = %err, "dropping undecodable packet");
                return;
            }
        };
        if packet.version() != PROTOCOL_VERSION {
            let err = MeshError::ProtocolVersionMismatch {
                node_id: packet.sender().to_string(),
                actual: packet.version().to_string(),
                expected: PROTOCOL_VERSION.to_string(),
            };
            tracing::warn!(kind = %message.kind, error = %err, "dropping packet");
            return;
        }
        if let Err(reason) = packet.validate() {
            let err = MeshError::MalformedPacket {
                kind: message.kind.to_string(),
                reason,
            };
            tracing::warn!(node_id = %packet.sender(), error = %err, "dropping packet");
            return;
        }

        tracing::debug!(kind = %message.kind, node_id = %packet.sender(), "packet received");
        if let Err(err) = self.dispatch(packet).await {
            tracing::warn!(kind = %message.kind, error = %err, "failed to handle packet");
        }
    }

    async fn dispatch(&self, packet: Packet) -> Result<(), MeshError> {
        let now = self.now();
        match packet.payload {
            PacketPayload::Discover(p) => self.send_info(Some(&p.sender)).await,
            PacketPayload::Info(p) => {
                self.registry.process_node_info(&p, now);
                Ok(())
            }
            PacketPayload::Disconnect(p) => {
                self.registry.node_disconnected(&p.sender, false, now);
                self.node_lost(&p.sender);
                Ok(())
            }
            PacketPayload::Heartbeat(p) => match self.registry.heartbeat_received(&p, now) {
                HeartbeatOutcome::UnknownNode
                | HeartbeatOutcome::OfflineNode
                | HeartbeatOutcome::MissedInfo => {
                    tracing::debug!(node_id = %p.sender, seq = p.seq, "heartbeat needs INFO, discovering");
                    self.discover(Some(&p.sender)).await
                }
                HeartbeatOutcome::Ignored | HeartbeatOutcome::Refreshed => Ok(()),
            },
            PacketPayload::Request(p) => {
                self.handle_request(p);
                Ok(())
            }
            PacketPayload::Response(p) => {
                self.handle_response(p);
                Ok(())
            }
            PacketPayload::Event(p) => {
                self.deliver_local_event(&p);
                Ok(())
            }
            PacketPayload::Ping(p) => {
                let pong = PongPayload {
                    ver: PROTOCOL_VERSION.to_string(),
                    sender: self.node_id().clone(),
                    time: p.time,
                    id: p.id,
                    arrived: self.providers.time().wall_clock_ms(),
                };
                self.publish(Packet::to(p.sender, PacketPayload::Pong(pong))).await
            }
            PacketPayload::Pong(p) => {
                self.handle_pong(p);
                Ok(())
            }
            PacketPayload::GossipRequest(p) => {
                if !self.registry.nodes().has(&p.sender) {
                    self.discover(Some(&p.sender)).await?;
                }
                let response = self.registry.gossip_response(&p);
                self.publish(Packet::to(p.sender, PacketPayload::GossipResponse(response)))
                    .await
            }
            PacketPayload::GossipResponse(p) => {
                for node_id in self.registry.apply_gossip_response(&p, now) {
                    self.node_lost(&node_id);
                }
                Ok(())
            }
            PacketPayload::StreamAck(p) => {
                match self.windows.borrow().get(&p.id) {
                    Some(window) if window.node_id != p.sender => {
                        tracing::debug!(stream_id = %p.id, node_id = %p.sender, "discarding stream ack from unexpected node");
                    }
                    Some(window) if p.seq == STREAM_CANCELLED => {
                        tracing::debug!(stream_id = %p.id, node_id = %p.sender, "stream consumer went away");
                        window.cancel();
                    }
                    Some(window) => window.ack(p.seq),
                    None => {}
                }
                Ok(())
            }
        }
    }

    // -- requests -------------------------------------------------------

    /// Send `ctx` to a remote endpoint and wait for the response.
    ///
    /// The pending entry is keyed by `ctx.id`. It settles exactly once: on
    /// RESPONSE, timeout, loss of the target node, publish failure or
    /// shutdown. Settling stops a request stream still being sent.
    pub async fn request(
        &self,
        endpoint: &Endpoint,
        ctx: Context,
        stream: Option<ChunkSource>,
    ) -> Result<Response, MeshError> {
        let target = endpoint.id.clone();
        let id = ctx.id.clone();
        let action = ctx.action.clone().unwrap_or_default();
        let receiver = self.pending.insert(id.clone(), target.clone(), action.clone(), self.now());

        if let Some(timeout) = ctx.timeout {
            let me = self.me.clone();
            let time = self.providers.time().clone();
            let timer_id = id.clone();
            let timer = self
                .providers
                .task()
                .spawn_task("transit_request_timeout", async move {
                    time.sleep(timeout).await;
                    if let Some(transit) = me.upgrade() {
                        transit.pending.timeout(&timer_id, transit.now());
                    }
                });
            self.pending.set_timer(&id, timer);
        }

        let payload = RequestPayload {
            ver: PROTOCOL_VERSION.to_string(),
            sender: self.node_id().clone(),
            id: id.clone(),
            action: action.clone(),
            params: ctx.params,
            meta: Some(ctx.meta),
            timeout: ctx.timeout.map(|t| t.as_millis() as u64),
            level: ctx.level,
            parent_id: ctx.parent_id,
            request_id: ctx.request_id,
            caller: ctx.caller,
            stream: stream.is_some(),
            seq: stream.as_ref().map(|_| 0),
            chunk: None,
            stream_error: None,
        };
        tracing::debug!(request_id = %id, node_id = %target, action = %action, "sending request");

        match self.publish(Packet::to(target.clone(), PacketPayload::Request(payload))).await {
            Err(err) => {
                self.pending.settle(&id, Err(err));
            }
            Ok(()) => {
                if let Some(source) = stream {
                    let me = self.me.clone();
                    let direction = StreamDirection::Request {
                        action: action.clone(),
                        level: ctx.level,
                    };
                    let (stream_target, stream_id) = (target.clone(), id.clone());
                    let pump = self
                        .providers
                        .task()
                        .spawn_task("transit_request_stream", async move {
                            let Some(transit) = me.upgrade() else {
                                return;
                            };
                            if let Err(err) = transit
                                .pump_stream(&stream_target, &stream_id, source, direction)
                                .await
                            {
                                transit.pending.settle(&stream_id, Err(err));
                            }
                        });
                    self.pending.set_stream(&id, pump);
                }
            }
        }

        receiver.await.unwrap_or_else(|_| {
            Err(MeshError::RequestRejected {
                action,
                node_id: target,
                reason: "pending entry dropped".to_string(),
            })
        })
    }

    fn handle_request(&self, payload: RequestPayload) {
        if let Some(seq) = payload.seq.filter(|seq| *seq > 0) {
            let fragment = if payload.stream {
                Fragment::Chunk(payload.chunk.unwrap_or_default())
            } else {
                Fragment::End(
                    payload
                        .stream_error
                        .map(|err| MeshError::from_payload(err, &payload.sender)),
                )
            };
            self.push_fragment(&payload.id, &payload.sender, seq, fragment, true);
            return;
        }

        let stream = payload
            .stream
            .then(|| self.attach_incoming(&payload.id, &payload.sender));
        let ctx = Context::from_request(&payload, stream);
        let me = self.me.clone();
        self.spawn("transit_request_handler", async move {
            if let Some(transit) = me.upgrade() {
                transit.execute_request(ctx).await;
            }
        });
    }

    async fn execute_request(&self, ctx: Context) {
        let id = ctx.id.clone();
        let caller = ctx.node_id.clone().unwrap_or_default();
        let action = ctx.action.clone().unwrap_or_default();
        let meta = ctx.meta.clone();
        let streamed = ctx.stream.is_some();

        let handler = match self.registry.local_action(&action) {
            Some(def) if def.descriptor.protected => {
                tracing::warn!(request_id = %id, node_id = %caller, action = %action, "refusing remote call to protected action");
                None
            }
            Some(def) => def.handler.clone(),
            None => None,
        };
        let result = match (handler, ctx.timeout) {
            (Some(handler), Some(timeout)) => {
                let time = self.providers.time().clone();
                tokio::select! {
                    result = handler.handle(ctx) => result,
                    _ = time.sleep(timeout) => {
                        tracing::debug!(request_id = %id, action = %action, ?timeout, "abandoning handler past the caller's timeout");
                        Err(MeshError::RequestTimeout {
                            action: action.clone(),
                            node_id: self.node_id().clone(),
                            elapsed: timeout,
                        })
                    }
                }
            }
            (Some(handler), None) => handler.handle(ctx).await,
            (None, _) => Err(MeshError::ServiceNotFound {
                action: action.clone(),
                node_id: Some(self.node_id().clone()),
            }),
        };
        if streamed {
            self.close_incoming(&id);
        }
        if let Err(err) = &result {
            tracing::debug!(request_id = %id, action = %action, error = %err, "action failed");
        }
        if let Err(err) = self.send_response(&caller, &id, result, meta).await {
            tracing::warn!(request_id = %id, node_id = %caller, error = %err, "failed to send response");
        }
    }

    async fn send_response(
        &self,
        target: &str,
        id: &str,
        result: Result<Reply, MeshError>,
        mut meta: Meta,
    ) -> Result<(), MeshError> {
        let mut payload = ResponsePayload {
            ver: PROTOCOL_VERSION.to_string(),
            sender: self.node_id().clone(),
            id: id.to_string(),
            success: true,
            data: None,
            error: None,
            meta: None,
            stream: false,
            seq: None,
            chunk: None,
        };
        let stream = match result {
            Ok(reply) => {
                meta.extend(reply.meta);
                payload.data = Some(reply.data);
                payload.meta = Some(meta);
                payload.stream = reply.stream.is_some();
                payload.seq = reply.stream.as_ref().map(|_| 0);
                reply.stream
            }
            Err(err) => {
                payload.success = false;
                payload.error = Some(err.to_payload(self.node_id()));
                payload.meta = Some(meta);
                None
            }
        };
        self.publish(Packet::to(target, PacketPayload::Response(payload))).await?;
        if let Some(source) = stream {
            self.pump_stream(target, id, source, StreamDirection::Response).await?;
        }
        Ok(())
    }

    fn handle_response(&self, payload: ResponsePayload) {
        match self.pending.node_of(&payload.id) {
            Some(node_id) if node_id != payload.sender => {
                tracing::warn!(
                    request_id = %payload.id,
                    node_id = %payload.sender,
                    expected = %node_id,
                    "dropping response from unexpected node"
                );
                return;
            }
            _ => {}
        }

        if let Some(seq) = payload.seq.filter(|seq| *seq > 0) {
            let fragment = if payload.stream {
                Fragment::Chunk(payload.chunk.unwrap_or_default())
            } else {
                Fragment::End(
                    payload
                        .error
                        .map(|err| MeshError::from_payload(err, &payload.sender)),
                )
            };
            let known = self.pending.contains(&payload.id);
            self.push_fragment(&payload.id, &payload.sender, seq, fragment, known);
            return;
        }

        if !self.pending.contains(&payload.id) {
            tracing::debug!(request_id = %payload.id, node_id = %payload.sender, "discarding orphan response");
            return;
        }
        let result = if payload.success {
            let stream = payload
                .stream
                .then(|| self.attach_incoming(&payload.id, &payload.sender));
            Ok(Response {
                data: payload.data.unwrap_or(Value::Null),
                meta: payload.meta.unwrap_or_default(),
                stream,
            })
        } else {
            Err(match payload.error {
                Some(err) => MeshError::from_payload(err, &payload.sender),
                None => MeshError::handler("response failed without an error"),
            })
        };
        self.pending.settle(&payload.id, result);
    }

    // -- streams --------------------------------------------------------

    fn new_incoming(&self, node_id: &str) -> IncomingStream {
        let (tx, rx) = mpsc::unbounded_channel();
        IncomingStream {
            node_id: node_id.to_string(),
            reassembler: StreamReassembler::new(self.config.stream_window, tx),
            receiver: Some(rx),
        }
    }

    /// Hand the consumer side of stream `id` out; fragments may already be
    /// buffered.
    fn attach_incoming(&self, id: &str, node_id: &str) -> ByteStream {
        let receiver = {
            let mut incoming = self.incoming.borrow_mut();
            let entry = incoming
                .entry(id.to_string())
                .or_insert_with(|| self.new_incoming(node_id));
            let receiver = entry.receiver.take();
            if entry.reassembler.is_done() {
                incoming.remove(id);
            }
            receiver
        };
        let receiver = receiver.unwrap_or_else(|| {
            tracing::warn!(stream_id = %id, "duplicate stream header");
            mpsc::unbounded_channel().1
        });

        let me = self.me.clone();
        let (ack_node, ack_id) = (node_id.to_string(), id.to_string());
        ByteStream::remote(receiver, move |seq| {
            if let Some(transit) = me.upgrade() {
                if seq == STREAM_CANCELLED {
                    transit.close_incoming(&ack_id);
                }
                transit.send_stream_ack(ack_node.clone(), ack_id.clone(), seq);
            }
        })
    }

    /// Forget inbound stream `id`. Fragments still in flight for it are
    /// dropped on arrival.
    fn close_incoming(&self, id: &str) {
        self.closed_streams.borrow_mut().put(id.to_string(), ());
        if self.incoming.borrow_mut().remove(id).is_some() {
            tracing::debug!(stream_id = %id, "inbound stream closed before its end");
        }
    }

    fn push_fragment(&self, id: &str, node_id: &str, seq: u64, fragment: Fragment, may_open: bool) {
        let mut incoming = self.incoming.borrow_mut();
        if !incoming.contains_key(id) {
            if !may_open || self.closed_streams.borrow().contains(id) {
                tracing::debug!(stream_id = %id, seq, "discarding orphan stream fragment");
                return;
            }
            incoming.insert(id.to_string(), self.new_incoming(node_id));
        }
        let Some(entry) = incoming.get_mut(id) else {
            return;
        };
        let outcome = entry.reassembler.push(seq, fragment);
        if outcome == PushOutcome::Failed {
            tracing::warn!(stream_id = %id, node_id = %node_id, seq, "stream failed");
        }
        if outcome != PushOutcome::Open && entry.receiver.is_none() {
            incoming.remove(id);
        }
    }

    fn send_stream_ack(&self, target: NodeId, id: String, seq: u64) {
        let me = self.me.clone();
        self.spawn("transit_stream_ack", async move {
            let Some(transit) = me.upgrade() else {
                return;
            };
            let ack = StreamAckPayload {
                ver: PROTOCOL_VERSION.to_string(),
                sender: transit.node_id().clone(),
                id,
                seq,
            };
            if let Err(err) = transit
                .publish(Packet::to(target, PacketPayload::StreamAck(ack)))
                .await
            {
                tracing::debug!(error = %err, "failed to acknowledge stream chunk");
            }
        });
    }

    async fn pump_stream(
        &self,
        target: &str,
        id: &str,
        mut source: ChunkSource,
        direction: StreamDirection,
    ) -> Result<(), MeshError> {
        let window = Rc::new(SendWindow::new(target.to_string(), self.config.stream_window));
        self.windows.borrow_mut().insert(id.to_string(), window.clone());
        // Also runs when the pumping task is aborted.
        let _registered = WindowGuard {
            windows: &self.windows,
            id,
            window: window.clone(),
        };
        self.pump_chunks(target, id, &mut source, &direction, &window).await
    }

    async fn pump_chunks(
        &self,
        target: &str,
        id: &str,
        source: &mut ChunkSource,
        direction: &StreamDirection,
        window: &SendWindow,
    ) -> Result<(), MeshError> {
        let mut seq = 0;
        let mut failure = None;
        while let Some(item) = source.recv().await {
            match item {
                Ok(chunk) => {
                    seq += 1;
                    if !window.wait_for_slot(seq).await {
                        if window.is_cancelled() {
                            tracing::debug!(stream_id = %id, chunks = seq - 1, "stream cancelled by consumer");
                            return Ok(());
                        }
                        return Err(MeshError::NodeUnavailable {
                            node_id: target.to_string(),
                        });
                    }
                    let packet = self.stream_fragment(direction, target, id, seq, Fragment::Chunk(chunk));
                    self.publish(packet).await?;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        tracing::trace!(stream_id = %id, chunks = seq, "stream complete");
        let packet = self.stream_fragment(direction, target, id, seq + 1, Fragment::End(failure));
        self.publish(packet).await
    }

    fn stream_fragment(
        &self,
        direction: &StreamDirection,
        target: &str,
        id: &str,
        seq: u64,
        fragment: Fragment,
    ) -> Packet {
        let sender = self.node_id().clone();
        let (open, chunk, error) = match fragment {
            Fragment::Chunk(bytes) => (true, Some(bytes), None),
            Fragment::End(err) => (false, None, err.map(|e| e.to_payload(&sender))),
        };
        let payload = match direction {
            StreamDirection::Request { action, level } => PacketPayload::Request(RequestPayload {
                ver: PROTOCOL_VERSION.to_string(),
                sender,
                id: id.to_string(),
                action: action.clone(),
                params: Value::Null,
                meta: None,
                timeout: None,
                level: *level,
                parent_id: None,
                request_id: None,
                caller: None,
                stream: open,
                seq: Some(seq),
                chunk,
                stream_error: error,
            }),
            StreamDirection::Response => PacketPayload::Response(ResponsePayload {
                ver: PROTOCOL_VERSION.to_string(),
                sender,
                id: id.to_string(),
                success: error.is_none(),
                data: None,
                error,
                meta: None,
                stream: open,
                seq: Some(seq),
                chunk,
            }),
        };
        Packet::to(target, payload)
    }

    // -- events ---------------------------------------------------------

    /// Run every local handler subscribed to the event in its groups.
    ///
    /// Handlers run as tasks; their errors are logged. Returns how many were
    /// started.
    pub fn deliver_local_event(&self, payload: &EventPayload) -> usize {
        let handlers = self
            .registry
            .events()
            .local_handlers(&payload.event, payload.groups.as_deref());
        let mut started = 0;
        for definition in handlers {
            let Some(handler) = definition.handler.clone() else {
                continue;
            };
            let ctx = Context::from_event(payload);
            let event = payload.event.clone();
            let group = definition.group.clone();
            self.spawn("transit_event_handler", async move {
                if let Err(err) = handler.handle(ctx).await {
                    tracing::warn!(event = %event, group = %group, error = %err, "event handler failed");
                }
            });
            started += 1;
        }
        started
    }

    // -- ping -----------------------------------------------------------

    /// Measure the round trip to `node_id`.
    pub async fn ping(&self, node_id: &str, timeout: Duration) -> Result<PongInfo, MeshError> {
        let id = new_context_id();
        let (sender, receiver) = oneshot::channel();
        self.pings.borrow_mut().insert(
            id.clone(),
            PendingPing {
                node_id: node_id.to_string(),
                started: self.now(),
                sender,
            },
        );
        let ping = PingPayload {
            ver: PROTOCOL_VERSION.to_string(),
            sender: self.node_id().clone(),
            time: self.providers.time().wall_clock_ms(),
            id: id.clone(),
        };
        if let Err(err) = self.publish(Packet::to(node_id, PacketPayload::Ping(ping))).await {
            self.pings.borrow_mut().remove(&id);
            return Err(err);
        }

        let time = self.providers.time().clone();
        tokio::select! {
            pong = receiver => pong.map_err(|_| MeshError::NodeUnavailable {
                node_id: node_id.to_string(),
            }),
            _ = time.sleep(timeout) => {
                self.pings.borrow_mut().remove(&id);
                Err(MeshError::RequestTimeout {
                    action: PING_ACTION.to_string(),
                    node_id: node_id.to_string(),
                    elapsed: timeout,
                })
            }
        }
    }

    fn handle_pong(&self, payload: PongPayload) {
        let ping = {
            let mut pings = self.pings.borrow_mut();
            match pings.get(&payload.id) {
                Some(ping) if ping.node_id == payload.sender => pings.remove(&payload.id),
                _ => None,
            }
        };
        let Some(ping) = ping else {
            tracing::debug!(node_id = %payload.sender, "discarding unsolicited pong");
            return;
        };

        let elapsed = self.now().saturating_sub(ping.started);
        let half_trip = (elapsed.as_millis() / 2) as i64;
        let time_diff_ms = payload.arrived as i64 - (payload.time as i64 + half_trip);
        self.registry.record_latency(&payload.sender, elapsed);
        self.registry.bus().emit(LocalEvent::NodePong {
            node_id: payload.sender.clone(),
            elapsed,
            time_diff_ms,
        });
        let _ = ping.sender.send(PongInfo {
            node_id: payload.sender,
            elapsed,
            time_diff_ms,
        });
    }
}

/// Unregisters an outbound window when its pump ends.
struct WindowGuard<'a> {
    windows: &'a RefCell<HashMap<String, Rc<SendWindow>>>,
    id: &'a str,
    window: Rc<SendWindow>,
}

impl Drop for WindowGuard<'_> {
    fn drop(&mut self) {
        self.window.close();
        let mut windows = self.windows.borrow_mut();
        if windows.get(self.id).is_some_and(|w| Rc::ptr_eq(w, &self.window)) {
            windows.remove(self.id);
        }
    }
}

impl<P: Providers> std::fmt::Debug for Transit<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transit")
            .field("node_id", self.node_id())
            .field("connected", &self.connected.get())
            .field("pending", &self.pending.len())
            .field("streams", &self.incoming.borrow().len())
            .finish()
    }
}

impl<P: Providers> Drop for Transit<P> {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::codec::JsonCodec;
    use crate::config::RegistryConfig;
    use crate::packet::InfoPayload;
    use crate::provider::TokioProviders;
    use crate::transport::InMemoryHub;
    use crate::PacketType;

    fn transit(hub: &InMemoryHub, node_id: &str) -> Rc<Transit<TokioProviders>> {
        let registry = Rc::new(Registry::new(node_id, RegistryConfig::default(), LocalBus::new()));
        Transit::new(
            BrokerConfig::local_cluster(node_id),
            registry,
            Rc::new(hub.transporter(node_id)),
            Rc::new(JsonCodec),
            TokioProviders::new(),
        )
    }

    async fn run_local<F: Future<Output = ()>>(f: F) {
        tokio::task::LocalSet::new().run_until(f).await;
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_discovers_peers() {
        run_local(async {
            let hub = InMemoryHub::new();
            let a = transit(&hub, "a");
            let b = transit(&hub, "b");
            a.connect().await.expect("connect a");
            b.connect().await.expect("connect b");
            settle().await;

            assert!(a.registry.nodes().has("b"));
            assert!(b.registry.nodes().has("a"));
            a.disconnect().await.expect("disconnect");
            settle().await;
            assert_eq!(b.registry.nodes().online_count(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_packets_with_other_protocol_version_are_dropped() {
        run_local(async {
            let hub = InMemoryHub::new();
            let a = transit(&hub, "a");
            a.connect().await.expect("connect");

            let raw = hub.transporter("old");
            let (inbox, _rx) = mpsc::unbounded_channel();
            raw.connect(inbox).await.expect("connect raw");
            let mut info = InfoPayload {
                ver: "3".to_string(),
                ..a.registry.local_info()
            };
            info.sender = "old".to_string();
            info.instance_id = "old-instance".to_string();
            let bytes = JsonCodec
                .serialize(&Packet::broadcast(PacketPayload::Info(info.clone())))
                .expect("encode");
            raw.send(&Topic::broadcast("", PacketType::Info), bytes)
                .await
                .expect("send");
            raw.send(&Topic::broadcast("", PacketType::Info), b"{not json".to_vec())
                .await
                .expect("send");
            settle().await;
            assert!(!a.registry.nodes().has("old"));

            info.ver = PROTOCOL_VERSION.to_string();
            let bytes = JsonCodec
                .serialize(&Packet::broadcast(PacketPayload::Info(info)))
                .expect("encode");
            raw.send(&Topic::broadcast("", PacketType::Info), bytes)
                .await
                .expect("send");
            settle().await;
            assert!(a.registry.nodes().has("old"));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_from_unknown_node_triggers_discover() {
        run_local(async {
            let hub = InMemoryHub::new();
            let a = transit(&hub, "a");
            let b = transit(&hub, "b");
            a.connect().await.expect("connect a");
            // b joins while partitioned: its INFO and DISCOVER are lost.
            hub.set_partitioned("b", true);
            b.connect().await.expect("connect b");
            hub.set_partitioned("b", false);
            settle().await;
            assert!(!a.registry.nodes().has("b"));

            b.send_heartbeat().await.expect("heartbeat");
            settle().await;
            assert!(a.registry.nodes().has("b"));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_is_swept() {
        run_local(async {
            let hub = InMemoryHub::new();
            let a = transit(&hub, "a");
            let b = transit(&hub, "b");
            a.connect().await.expect("connect a");
            b.connect().await.expect("connect b");
            settle().await;

            hub.set_partitioned("b", true);
            tokio::time::sleep(Duration::from_secs(5)).await;
            let node = a.registry.nodes().get("b").expect("known");
            assert!(!node.borrow().available);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_measures_round_trip() {
        run_local(async {
            let hub = InMemoryHub::new();
            let a = transit(&hub, "a");
            let b = transit(&hub, "b");
            a.connect().await.expect("connect a");
            b.connect().await.expect("connect b");
            settle().await;

            let pong = a.ping("b", Duration::from_secs(1)).await.expect("pong");
            assert_eq!(pong.node_id, "b");
            let node = a.registry.nodes().get("b").expect("known");
            assert!(node.borrow().avg_latency_ms().is_some());

            hub.set_partitioned("b", true);
            let err = a.ping("b", Duration::from_secs(1)).await.expect_err("timeout");
            assert!(matches!(err, MeshError::RequestTimeout { .. }));
        })
        .await;
    }
}
