// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Branch-keyed transaction registry.
//!
//! The manager owns every live transaction, feeds it events and performs the
//! actions its state machine returns. Actions are always computed while the
//! registry entry is locked and applied after the lock is released; nothing
//! awaits while holding an entry.
//!
//! Timer callbacks only post a command to the manager's loop, so the timer
//! dispatcher never runs SIP logic itself. The same loop runs work that would
//! otherwise re-enter the manager from inside an action (transport failures,
//! hop failover, a CANCEL held until the first provisional).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use sip_core::{
    generate_branch, is_rfc3261_branch, replace_top_via, top_via, Method, Request, Response,
    SipUri, ViaHeader,
};
use sip_parse::serialize_response;
use sip_transport::TransportKind;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    fsm::{
        ClientAction, ClientEvent, ClientTransactionFsm, ServerAction, ServerEvent,
        ServerTransactionFsm, TerminateReason,
    },
    hops::{Hop, HopBlacklist, Resolver, DEFAULT_BLACKLIST_DURATION},
    metrics::{TransactionMetrics, TransactionOutcome},
    request_branch,
    requests::build_cancel,
    timer_queue::{TimerHandle, TimerQueue},
    timers::{TimerDefaults, TransportAwareTimers},
    ClientState, Role, ServerState, TransactionKey, TransactionTimer,
};

/// Branch some legacy user agents put on every ACK.
const LEGACY_ACK_BRANCH: &str = "0";

/// Caps on live transactions per role.
///
/// Without a cap a peer can exhaust memory by sending requests with unique
/// branches. Requests over the server cap are answered 503 statelessly;
/// sends over the client cap fail with [`TransactionError::LimitReached`].
///
/// ```
/// use sip_transaction::TransactionLimits;
///
/// assert_eq!(TransactionLimits::default().max_server_transactions, 10_000);
/// assert_eq!(TransactionLimits::small().max_client_transactions, 1_000);
/// assert_eq!(TransactionLimits::carrier_grade().max_server_transactions, 500_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionLimits {
    pub max_server_transactions: usize,
    pub max_client_transactions: usize,
}

impl Default for TransactionLimits {
    fn default() -> Self {
        Self::new(10_000, 10_000)
    }
}

impl TransactionLimits {
    pub fn new(max_server: usize, max_client: usize) -> Self {
        Self {
            max_server_transactions: max_server,
            max_client_transactions: max_client,
        }
    }

    /// Testing only.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }

    pub fn small() -> Self {
        Self::new(1_000, 1_000)
    }

    pub fn medium() -> Self {
        Self::default()
    }

    pub fn large() -> Self {
        Self::new(100_000, 100_000)
    }

    pub fn carrier_grade() -> Self {
        Self::new(500_000, 500_000)
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub timers: TimerDefaults,
    pub limits: TransactionLimits,
    /// `host[:port]` for Vias the manager has to add itself.
    pub via_sent_by: SmolStr,
    pub blacklist_duration: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            timers: TimerDefaults::default(),
            limits: TransactionLimits::default(),
            via_sent_by: SmolStr::new("127.0.0.1:5060"),
            blacklist_duration: DEFAULT_BLACKLIST_DURATION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// The request has no top Via branch.
    MissingBranch,
    /// The target URI is not a SIP or SIPS URI.
    UnsupportedUri(String),
    /// Every resolved hop is blacklisted, or none were returned.
    NoHops,
    Resolve(String),
    LimitReached { role: Role },
    /// The transaction has already terminated.
    NotFound,
    Transport(String),
    /// Only INVITE transactions can be cancelled.
    NotInvite,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBranch => write!(f, "request has no Via branch"),
            Self::UnsupportedUri(uri) => write!(f, "unsupported target URI: {}", uri),
            Self::NoHops => write!(f, "no usable next hop"),
            Self::Resolve(e) => write!(f, "next-hop resolution failed: {}", e),
            Self::LimitReached { role } => {
                write!(f, "{} transaction limit reached", role.as_str())
            }
            Self::NotFound => write!(f, "transaction not found"),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::NotInvite => write!(f, "only INVITE transactions can be cancelled"),
        }
    }
}

impl std::error::Error for TransactionError {}

/// Where a transaction's messages go.
#[derive(Debug, Clone)]
pub struct TransportContext {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    /// Writer of the connection a request arrived on (stream transports).
    pub stream: Option<mpsc::Sender<Bytes>>,
}

impl TransportContext {
    pub fn new(
        transport: TransportKind,
        peer: SocketAddr,
        stream: Option<mpsc::Sender<Bytes>>,
    ) -> Self {
        Self {
            transport,
            peer,
            stream,
        }
    }
}

impl From<Hop> for TransportContext {
    fn from(hop: Hop) -> Self {
        Self::new(hop.transport, hop.addr, None)
    }
}

/// Puts serialized messages on the wire.
#[async_trait]
pub trait TransportDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<()>;
}

/// Outcome callbacks for a client transaction.
///
/// `on_response` runs once per response received (provisionals, then the
/// final, then any 2xx retransmissions). `on_timeout` or `on_error` runs at
/// most once, and only when no final response arrived on any hop.
#[async_trait]
pub trait ClientTransactionListener: Send + Sync + 'static {
    async fn on_response(&self, response: &Response);
    async fn on_timeout(&self);
    async fn on_error(&self, error: &TransactionError);
}

/// Invoked with the key and Call-ID of every transaction that terminates.
pub type TerminationHook = Arc<dyn Fn(&TransactionKey, &SmolStr) + Send + Sync>;

/// What the transaction layer made of an inbound request.
#[derive(Clone)]
pub enum Inbound {
    /// A new request. Answer it through `transaction`.
    Deliver {
        request: Request,
        transaction: ServerTransactionHandle,
    },
    /// An ACK outside any transaction (the ACK for a 2xx).
    ForwardAck(Request),
    /// A CANCEL for an INVITE still in `Proceeding`. The CANCEL itself has
    /// been answered 200; the INVITE still needs its final response.
    Cancelled {
        cancel: Request,
        invite: ServerTransactionHandle,
    },
    /// Consumed by the transaction layer (retransmission, ACK for a non-2xx,
    /// CANCEL answered without upper-layer involvement).
    Absorbed,
    Dropped { reason: &'static str },
    /// Refused with 503 because the server transaction limit was reached.
    Rejected,
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inbound::Deliver { request, .. } => write!(f, "Deliver({})", request.method()),
            Inbound::ForwardAck(_) => write!(f, "ForwardAck"),
            Inbound::Cancelled { .. } => write!(f, "Cancelled"),
            Inbound::Absorbed => write!(f, "Absorbed"),
            Inbound::Dropped { reason } => write!(f, "Dropped({reason})"),
            Inbound::Rejected => write!(f, "Rejected"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ScheduledTimer {
    handle: TimerHandle,
    seq: u64,
}

type TimerSlots = HashMap<TransactionTimer, ScheduledTimer>;

fn cancel_slot(queue: &TimerQueue, timers: &mut TimerSlots, timer: TransactionTimer) {
    if let Some(slot) = timers.remove(&timer) {
        queue.cancel(slot.handle);
    }
}

fn cancel_slots(queue: &TimerQueue, timers: &mut TimerSlots) {
    for (_, slot) in timers.drain() {
        queue.cancel(slot.handle);
    }
}

struct ServerEntry {
    fsm: ServerTransactionFsm,
    ctx: TransportContext,
    timers: TimerSlots,
    request: Request,
    call_id: SmolStr,
    cancelled: bool,
}

struct ClientEntry {
    fsm: ClientTransactionFsm,
    ctx: TransportContext,
    timers: TimerSlots,
    method: Method,
    call_id: SmolStr,
    shared: Arc<ClientShared>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelState {
    None,
    /// Requested before any provisional; sent when the first one arrives.
    Pending,
    Sent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Timeout,
    Transport,
}

/// State shared by every attempt of one outbound request.
struct ClientShared {
    listener: Arc<dyn ClientTransactionListener>,
    request: Request,
    key: Mutex<Option<TransactionKey>>,
    hop: Mutex<Option<Hop>>,
    remaining: Mutex<VecDeque<Hop>>,
    cancel: Mutex<CancelState>,
    last_error: Mutex<Option<String>>,
}

impl ClientShared {
    fn new(
        listener: Arc<dyn ClientTransactionListener>,
        request: Request,
        remaining: VecDeque<Hop>,
    ) -> Arc<Self> {
        Arc::new(Self {
            listener,
            request,
            key: Mutex::new(None),
            hop: Mutex::new(None),
            remaining: Mutex::new(remaining),
            cancel: Mutex::new(CancelState::None),
            last_error: Mutex::new(None),
        })
    }

    fn current_key(&self) -> Option<TransactionKey> {
        self.key.lock().clone()
    }

    fn take_pending_cancel(&self) -> bool {
        let mut cancel = self.cancel.lock();
        if *cancel == CancelState::Pending {
            *cancel = CancelState::Sent;
            return true;
        }
        false
    }

    fn cancel_requested(&self) -> bool {
        *self.cancel.lock() != CancelState::None
    }
}

/// Logs the outcome of CANCELs the manager sends on a handle's behalf.
struct CancelLogger {
    branch: SmolStr,
}

#[async_trait]
impl ClientTransactionListener for CancelLogger {
    async fn on_response(&self, response: &Response) {
        debug!(branch = %self.branch, code = response.code(), "CANCEL answered");
    }

    async fn on_timeout(&self) {
        warn!(branch = %self.branch, "CANCEL timed out");
    }

    async fn on_error(&self, error: &TransactionError) {
        warn!(branch = %self.branch, %error, "CANCEL failed");
    }
}

enum ManagerCommand {
    TimerFired {
        role: Role,
        key: TransactionKey,
        timer: TransactionTimer,
        seq: u64,
    },
    TransportError {
        role: Role,
        key: TransactionKey,
        error: String,
    },
    Failover {
        shared: Arc<ClientShared>,
        failure: Failure,
        responded: bool,
    },
    SendCancel {
        shared: Arc<ClientShared>,
    },
}

struct ManagerInner {
    dispatcher: Arc<dyn TransportDispatcher>,
    resolver: Arc<dyn Resolver>,
    server: DashMap<TransactionKey, ServerEntry>,
    client: DashMap<TransactionKey, ClientEntry>,
    timers: TimerQueue,
    timer_seq: AtomicU64,
    cmd_tx: mpsc::UnboundedSender<ManagerCommand>,
    config: ManagerConfig,
    metrics: TransactionMetrics,
    blacklist: HopBlacklist,
    on_terminated: RwLock<Option<TerminationHook>>,
}

/// Owns SIP transactions and applies their actions. Cheap to clone.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

impl TransactionManager {
    /// Must be called inside a tokio runtime.
    pub fn new(dispatcher: Arc<dyn TransportDispatcher>, resolver: Arc<dyn Resolver>) -> Self {
        Self::with_config(dispatcher, resolver, ManagerConfig::default())
    }

    pub fn with_config(
        dispatcher: Arc<dyn TransportDispatcher>,
        resolver: Arc<dyn Resolver>,
        config: ManagerConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            dispatcher,
            resolver,
            server: DashMap::new(),
            client: DashMap::new(),
            timers: TimerQueue::new(),
            timer_seq: AtomicU64::new(0),
            cmd_tx,
            blacklist: HopBlacklist::new(config.blacklist_duration),
            config,
            metrics: TransactionMetrics::new(),
            on_terminated: RwLock::new(None),
        });
        tokio::spawn(run_commands(Arc::downgrade(&inner), cmd_rx));
        Self { inner }
    }

    pub fn metrics(&self) -> &TransactionMetrics {
        &self.inner.metrics
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn blacklist(&self) -> &HopBlacklist {
        &self.inner.blacklist
    }

    /// The queue driving transaction timers, shared with upper layers.
    pub fn timer_queue(&self) -> TimerQueue {
        self.inner.timers.clone()
    }

    pub fn set_termination_hook(&self, hook: TerminationHook) {
        *self.inner.on_terminated.write() = Some(hook);
    }

    pub fn server_count(&self) -> usize {
        self.inner.server.len()
    }

    pub fn client_count(&self) -> usize {
        self.inner.client.len()
    }

    pub fn server_state(&self, key: &TransactionKey) -> Option<ServerState> {
        self.inner.server.get(key).map(|entry| entry.fsm.state)
    }

    pub fn client_state(&self, key: &TransactionKey) -> Option<ClientState> {
        self.inner.client.get(key).map(|entry| entry.fsm.state)
    }

    /// Matches an inbound request against the server table.
    pub async fn receive_request(&self, request: Request, ctx: TransportContext) -> Inbound {
        let Some(branch) = request_branch(&request) else {
            debug!(method = %request.method(), peer = %ctx.peer, "request without Via branch dropped");
            return Inbound::Dropped {
                reason: "missing branch",
            };
        };

        let method = request.method().clone();
        if !is_rfc3261_branch(&branch) {
            if !(method == Method::Ack && branch == LEGACY_ACK_BRANCH) {
                warn!(%method, %branch, peer = %ctx.peer, "dropping request with non-RFC 3261 branch");
                return Inbound::Dropped {
                    reason: "non-RFC 3261 branch",
                };
            }
            debug!(peer = %ctx.peer, "accepting legacy ACK branch");
        }

        match method {
            Method::Ack => self.receive_ack(&branch, request).await,
            Method::Cancel => self.receive_cancel(&branch, request, ctx).await,
            _ => {
                let key = TransactionKey::server(&branch, &method);
                if self.absorb_retransmission(&key).await {
                    return Inbound::Absorbed;
                }
                if self.server_full() {
                    self.reject(&request, &ctx).await;
                    return Inbound::Rejected;
                }
                match self.create_server(key.clone(), request.clone(), ctx).await {
                    Created::New => Inbound::Deliver {
                        request,
                        transaction: self.server_handle(key),
                    },
                    Created::Existing => Inbound::Absorbed,
                }
            }
        }
    }

    async fn receive_ack(&self, branch: &str, request: Request) -> Inbound {
        let key = TransactionKey::server(branch, &Method::Invite);
        let actions = {
            let Some(mut entry) = self.inner.server.get_mut(&key) else {
                return Inbound::ForwardAck(request);
            };
            if entry.fsm.state == ServerState::Accepted {
                // ACK for a 2xx travelling on the INVITE's branch.
                return Inbound::ForwardAck(request);
            }
            entry.fsm.on_event(ServerEvent::Ack)
        };
        self.apply_server_actions(&key, actions).await;
        Inbound::Absorbed
    }

    async fn receive_cancel(&self, branch: &str, request: Request, ctx: TransportContext) -> Inbound {
        let cancel_key = TransactionKey::server(branch, &Method::Cancel);
        if self.absorb_retransmission(&cancel_key).await {
            return Inbound::Absorbed;
        }
        if self.server_full() {
            self.reject(&request, &ctx).await;
            return Inbound::Rejected;
        }

        let invite_key = TransactionKey::server(branch, &Method::Invite);
        let invite_state = {
            match self.inner.server.get_mut(&invite_key) {
                Some(mut entry) => {
                    let state = entry.fsm.state;
                    if state == ServerState::Proceeding {
                        entry.cancelled = true;
                    }
                    Some(state)
                }
                None => None,
            }
        };

        if let Created::Existing = self
            .create_server(cancel_key.clone(), request.clone(), ctx)
            .await
        {
            return Inbound::Absorbed;
        }

        let (code, reason) = match invite_state {
            Some(_) => (200, "OK"),
            None => (481, "Call/Transaction Does Not Exist"),
        };
        match request.response(code, reason) {
            Ok(response) => {
                if let Err(e) = self.server_handle(cancel_key).send_final(response).await {
                    debug!(%e, "CANCEL transaction ended before its response");
                }
            }
            Err(e) => warn!(%e, "failed to build CANCEL response"),
        }

        match invite_state {
            Some(ServerState::Proceeding) => Inbound::Cancelled {
                cancel: request,
                invite: self.server_handle(invite_key),
            },
            _ => Inbound::Absorbed,
        }
    }

    /// Feeds a retransmitted request to its live transaction, if any.
    async fn absorb_retransmission(&self, key: &TransactionKey) -> bool {
        let actions = {
            let Some(mut entry) = self.inner.server.get_mut(key) else {
                return false;
            };
            entry.fsm.on_event(ServerEvent::Retransmission)
        };
        self.note_retransmission(key, &actions);
        self.apply_server_actions(key, actions).await;
        true
    }

    fn note_retransmission(&self, key: &TransactionKey, actions: &[ServerAction]) {
        debug!(branch = %key.branch, "request retransmission absorbed");
        self.inner.metrics.record_absorbed();
        if actions
            .iter()
            .any(|a| matches!(a, ServerAction::Transmit { .. }))
        {
            if let Some(entry) = self.inner.server.get(key) {
                self.inner.metrics.record_retransmission(entry.ctx.transport);
            }
        }
    }

    fn server_full(&self) -> bool {
        self.inner.server.len() >= self.inner.config.limits.max_server_transactions
    }

    async fn reject(&self, request: &Request, ctx: &TransportContext) {
        self.inner.metrics.record_server_transaction_rejected();
        warn!(
            method = %request.method(),
            limit = self.inner.config.limits.max_server_transactions,
            "server transaction limit reached; answering 503"
        );
        match request.response(503, "Service Unavailable") {
            Ok(response) => {
                if let Err(e) = self.send_stateless(ctx, serialize_response(&response)).await {
                    warn!(%e, "failed to send 503");
                }
            }
            Err(e) => warn!(%e, "failed to build 503"),
        }
    }

    async fn create_server(
        &self,
        key: TransactionKey,
        request: Request,
        ctx: TransportContext,
    ) -> Created {
        let (created, actions) = match self.inner.server.entry(key.clone()) {
            // Lost a creation race with a retransmission.
            Entry::Occupied(mut occupied) => (
                Created::Existing,
                occupied.get_mut().fsm.on_event(ServerEvent::Retransmission),
            ),
            Entry::Vacant(vacant) => {
                let method = request.method().clone();
                let timers = TransportAwareTimers::with_defaults(ctx.transport, self.inner.config.timers);
                let mut fsm = ServerTransactionFsm::new(method.is_invite(), timers);
                let actions = fsm.on_event(ServerEvent::Request(request.clone()));
                self.inner
                    .metrics
                    .record_start(ctx.transport, method.as_str(), Role::Server);
                debug!(branch = %key.branch, %method, peer = %ctx.peer, "server transaction created");
                let call_id = request.headers.get("Call-ID").cloned().unwrap_or_default();
                vacant.insert(ServerEntry {
                    fsm,
                    ctx,
                    timers: HashMap::new(),
                    request,
                    call_id,
                    cancelled: false,
                });
                (Created::New, actions)
            }
        };
        if let Created::Existing = created {
            self.note_retransmission(&key, &actions);
        }
        self.apply_server_actions(&key, actions).await;
        created
    }

    fn server_handle(&self, key: TransactionKey) -> ServerTransactionHandle {
        ServerTransactionHandle {
            manager: self.clone(),
            key,
        }
    }

    /// Sends a response for a server transaction.
    pub async fn respond(
        &self,
        key: &TransactionKey,
        response: Response,
    ) -> Result<(), TransactionError> {
        let actions = {
            let Some(mut entry) = self.inner.server.get_mut(key) else {
                return Err(TransactionError::NotFound);
            };
            let event = if response.start.is_provisional() {
                ServerEvent::SendProvisional(response)
            } else {
                ServerEvent::SendFinal(response)
            };
            entry.fsm.on_event(event)
        };
        self.apply_server_actions(key, actions).await;
        Ok(())
    }

    /// Feeds a response into the matching client transaction.
    ///
    /// Returns `false` when no client transaction matches; such responses
    /// are left to the caller (stateless forwarding or drop).
    pub async fn receive_response(&self, response: Response) -> bool {
        let Some(key) = TransactionKey::for_response(&response) else {
            debug!(code = response.code(), "response without branch or CSeq");
            return false;
        };
        let actions = {
            let Some(mut entry) = self.inner.client.get_mut(&key) else {
                debug!(branch = %key.branch, code = response.code(), "no client transaction for response");
                return false;
            };
            let event = if response.start.is_provisional() {
                ClientEvent::Provisional(response)
            } else {
                ClientEvent::Final(response)
            };
            entry.fsm.on_event(event)
        };
        self.apply_client_actions(&key, actions).await;
        true
    }

    /// Sends `request` through a new client transaction.
    ///
    /// The next hop comes from the top Route URI, or the Request-URI when
    /// there is no Route. Hops are tried in resolver order, skipping
    /// blacklisted ones; a hop that times out or fails before any response
    /// is blacklisted and the request is retried on the next one with a
    /// fresh branch.
    pub async fn send(
        &self,
        request: Request,
        listener: Arc<dyn ClientTransactionListener>,
    ) -> Result<ClientTransactionHandle, TransactionError> {
        let target = route_target(&request)?;
        let hops = self
            .inner
            .resolver
            .resolve(&target)
            .await
            .map_err(|e| TransactionError::Resolve(e.to_string()))?;
        let mut hops: VecDeque<Hop> = self.inner.blacklist.filter(hops).into();
        let first = hops.pop_front().ok_or(TransactionError::NoHops)?;

        let shared = ClientShared::new(listener, request, hops);
        self.start_attempt(&shared, first).await?;
        Ok(ClientTransactionHandle {
            manager: self.clone(),
            shared,
        })
    }

    /// Sends `request` to an explicit destination, without failover.
    pub async fn send_to(
        &self,
        request: Request,
        ctx: TransportContext,
        listener: Arc<dyn ClientTransactionListener>,
    ) -> Result<ClientTransactionHandle, TransactionError> {
        let shared = ClientShared::new(listener, request, VecDeque::new());
        let stamped = self.stamp_branch(&shared.request, ctx.transport);
        self.start_client(&shared, stamped, ctx).await?;
        Ok(ClientTransactionHandle {
            manager: self.clone(),
            shared,
        })
    }

    /// Sends bytes outside any transaction (ACK for 2xx, 503 rejections).
    pub async fn send_stateless(&self, ctx: &TransportContext, payload: Bytes) -> Result<()> {
        self.inner.dispatcher.dispatch(ctx, payload).await
    }

    async fn start_attempt(
        &self,
        shared: &Arc<ClientShared>,
        hop: Hop,
    ) -> Result<TransactionKey, TransactionError> {
        *shared.hop.lock() = Some(hop);
        let stamped = self.stamp_branch(&shared.request, hop.transport);
        self.start_client(shared, stamped, hop.into()).await
    }

    /// Copies `request` with a fresh branch in its top Via.
    fn stamp_branch(&self, request: &Request, transport: TransportKind) -> Request {
        let branch = generate_branch();
        let mut request = request.clone();
        match top_via(&request.headers) {
            Some(mut via) => {
                via.set_branch(&branch);
                via.transport = SmolStr::new(transport.via_transport());
                replace_top_via(&mut request.headers, &via);
            }
            None => {
                let via = ViaHeader::new(
                    transport.via_transport(),
                    &self.inner.config.via_sent_by,
                    &branch,
                );
                request.headers.push_front("Via", via.to_string());
            }
        }
        request
    }

    async fn start_client(
        &self,
        shared: &Arc<ClientShared>,
        request: Request,
        ctx: TransportContext,
    ) -> Result<TransactionKey, TransactionError> {
        let branch = request_branch(&request).ok_or(TransactionError::MissingBranch)?;
        if self.inner.client.len() >= self.inner.config.limits.max_client_transactions {
            self.inner.metrics.record_client_transaction_rejected();
            warn!(
                limit = self.inner.config.limits.max_client_transactions,
                "client transaction limit reached"
            );
            return Err(TransactionError::LimitReached { role: Role::Client });
        }

        let method = request.method().clone();
        let key = TransactionKey::client(&branch, &method);
        let call_id = request.headers.get("Call-ID").cloned().unwrap_or_default();
        let timers = TransportAwareTimers::with_defaults(ctx.transport, self.inner.config.timers);
        let mut fsm = ClientTransactionFsm::new(method.is_invite(), timers);
        let actions = fsm.on_event(ClientEvent::Send(request));

        *shared.key.lock() = Some(key.clone());
        self.inner
            .metrics
            .record_start(ctx.transport, method.as_str(), Role::Client);
        debug!(branch = %key.branch, %method, peer = %ctx.peer, "client transaction started");
        self.inner.client.insert(
            key.clone(),
            ClientEntry {
                fsm,
                ctx,
                timers: HashMap::new(),
                method,
                call_id,
                shared: shared.clone(),
            },
        );
        self.apply_client_actions(&key, actions).await;
        Ok(key)
    }

    async fn send_cancel(&self, shared: &Arc<ClientShared>) {
        let Some(key) = shared.current_key() else {
            return;
        };
        let found = self.inner.client.get(&key).and_then(|entry| {
            entry
                .fsm
                .request()
                .map(|invite| (build_cancel(invite), entry.ctx.clone()))
        });
        let Some((cancel, ctx)) = found else {
            debug!(branch = %key.branch, "INVITE finished before CANCEL could be sent");
            return;
        };
        let listener = Arc::new(CancelLogger {
            branch: key.branch.clone(),
        });
        let cancel_shared = ClientShared::new(listener, cancel.clone(), VecDeque::new());
        info!(branch = %key.branch, "sending CANCEL");
        if let Err(e) = self.start_client(&cancel_shared, cancel, ctx).await {
            warn!(%e, branch = %key.branch, "failed to start CANCEL transaction");
        }
    }

    fn schedule_timer(&self, role: Role, key: &TransactionKey, timer: TransactionTimer, duration: Duration) {
        let seq = self.inner.timer_seq.fetch_add(1, Ordering::Relaxed);
        let cmd_tx = self.inner.cmd_tx.clone();
        let task_key = key.clone();
        let task = move || {
            let _ = cmd_tx.send(ManagerCommand::TimerFired {
                role,
                key: task_key,
                timer,
                seq,
            });
        };
        let queue = &self.inner.timers;
        // Armed under the entry lock so termination cannot miss the handle.
        let arm = |timers: &mut TimerSlots| {
            cancel_slot(queue, timers, timer);
            let handle = queue.schedule(duration, task);
            timers.insert(timer, ScheduledTimer { handle, seq });
        };
        match role {
            Role::Server => {
                if let Some(mut entry) = self.inner.server.get_mut(key) {
                    arm(&mut entry.timers);
                }
            }
            Role::Client => {
                if let Some(mut entry) = self.inner.client.get_mut(key) {
                    arm(&mut entry.timers);
                }
            }
        }
    }

    async fn on_timer(&self, role: Role, key: TransactionKey, timer: TransactionTimer, seq: u64) {
        match role {
            Role::Server => {
                let actions = {
                    let Some(mut entry) = self.inner.server.get_mut(&key) else {
                        return;
                    };
                    if entry.timers.get(&timer).map(|slot| slot.seq) != Some(seq) {
                        return;
                    }
                    entry.timers.remove(&timer);
                    if timer == TransactionTimer::G {
                        self.inner.metrics.record_retransmission(entry.ctx.transport);
                    }
                    entry.fsm.on_event(ServerEvent::TimerFired(timer))
                };
                self.inner.metrics.record_timer_fired(timer);
                debug!(branch = %key.branch, ?timer, "server timer fired");
                self.apply_server_actions(&key, actions).await;
            }
            Role::Client => {
                let actions = {
                    let Some(mut entry) = self.inner.client.get_mut(&key) else {
                        return;
                    };
                    if entry.timers.get(&timer).map(|slot| slot.seq) != Some(seq) {
                        return;
                    }
                    entry.timers.remove(&timer);
                    if matches!(timer, TransactionTimer::A | TransactionTimer::E) {
                        self.inner.metrics.record_retransmission(entry.ctx.transport);
                    }
                    entry.fsm.on_event(ClientEvent::TimerFired(timer))
                };
                self.inner.metrics.record_timer_fired(timer);
                debug!(branch = %key.branch, ?timer, "client timer fired");
                self.apply_client_actions(&key, actions).await;
            }
        }
    }

    async fn on_transport_error(&self, role: Role, key: TransactionKey, error: String) {
        match role {
            Role::Server => {
                let actions = {
                    let Some(mut entry) = self.inner.server.get_mut(&key) else {
                        return;
                    };
                    entry.fsm.on_event(ServerEvent::TransportError)
                };
                self.apply_server_actions(&key, actions).await;
            }
            Role::Client => {
                let actions = {
                    let Some(mut entry) = self.inner.client.get_mut(&key) else {
                        return;
                    };
                    *entry.shared.last_error.lock() = Some(error);
                    entry.fsm.on_event(ClientEvent::TransportError)
                };
                self.apply_client_actions(&key, actions).await;
            }
        }
    }

    async fn transmit(&self, role: Role, key: &TransactionKey, bytes: Bytes) {
        let ctx = match role {
            Role::Server => self.inner.server.get(key).map(|entry| entry.ctx.clone()),
            Role::Client => self.inner.client.get(key).map(|entry| entry.ctx.clone()),
        };
        let Some(ctx) = ctx else {
            return;
        };
        if let Err(e) = self.inner.dispatcher.dispatch(&ctx, bytes).await {
            warn!(%e, branch = %key.branch, role = role.as_str(), peer = %ctx.peer, "transport dispatch failed");
            let _ = self.inner.cmd_tx.send(ManagerCommand::TransportError {
                role,
                key: key.clone(),
                error: e.to_string(),
            });
        }
    }

    async fn apply_server_actions(&self, key: &TransactionKey, actions: Vec<ServerAction>) {
        for action in actions {
            match action {
                ServerAction::Transmit { bytes } => self.transmit(Role::Server, key, bytes).await,
                ServerAction::Schedule { timer, duration } => {
                    self.schedule_timer(Role::Server, key, timer, duration)
                }
                ServerAction::Cancel(timer) => {
                    if let Some(mut entry) = self.inner.server.get_mut(key) {
                        cancel_slot(&self.inner.timers, &mut entry.timers, timer);
                    }
                }
                ServerAction::Terminate { reason } => self.terminate_server(key, reason),
            }
        }
    }

    fn terminate_server(&self, key: &TransactionKey, reason: TerminateReason) {
        if let Some(mut entry) = self.inner.server.get_mut(key) {
            cancel_slots(&self.inner.timers, &mut entry.timers);
        }
        let Some((key, mut entry)) = self.inner.server.remove(key) else {
            return;
        };
        cancel_slots(&self.inner.timers, &mut entry.timers);
        let outcome = if entry.cancelled {
            TransactionOutcome::Cancelled
        } else {
            reason.outcome()
        };
        self.inner.metrics.record_complete(
            entry.ctx.transport,
            entry.request.method().as_str(),
            Role::Server,
            outcome,
        );
        debug!(branch = %key.branch, %reason, "server transaction terminated");
        self.notify_terminated(&key, &entry.call_id);
    }

    async fn apply_client_actions(&self, key: &TransactionKey, actions: Vec<ClientAction>) {
        let Some((shared, responded)) = self
            .inner
            .client
            .get(key)
            .map(|entry| (entry.shared.clone(), entry.fsm.responded()))
        else {
            return;
        };
        let mut failure = None;
        for action in actions {
            match action {
                ClientAction::Transmit { bytes } => self.transmit(Role::Client, key, bytes).await,
                ClientAction::Deliver(response) => {
                    let provisional = response.start.is_provisional();
                    shared.listener.on_response(&response).await;
                    if provisional && shared.take_pending_cancel() {
                        let _ = self.inner.cmd_tx.send(ManagerCommand::SendCancel {
                            shared: shared.clone(),
                        });
                    }
                }
                ClientAction::Schedule { timer, duration } => {
                    self.schedule_timer(Role::Client, key, timer, duration)
                }
                ClientAction::Cancel(timer) => {
                    if let Some(mut entry) = self.inner.client.get_mut(key) {
                        cancel_slot(&self.inner.timers, &mut entry.timers, timer);
                    }
                }
                ClientAction::Timeout => failure = Some(Failure::Timeout),
                ClientAction::TransportFailed => failure = Some(Failure::Transport),
                ClientAction::Terminate { reason } => self.terminate_client(key, reason),
            }
        }
        if let Some(failure) = failure {
            let _ = self.inner.cmd_tx.send(ManagerCommand::Failover {
                shared,
                failure,
                responded,
            });
        }
    }

    fn terminate_client(&self, key: &TransactionKey, reason: TerminateReason) {
        if let Some(mut entry) = self.inner.client.get_mut(key) {
            cancel_slots(&self.inner.timers, &mut entry.timers);
        }
        let Some((key, mut entry)) = self.inner.client.remove(key) else {
            return;
        };
        cancel_slots(&self.inner.timers, &mut entry.timers);
        self.inner.metrics.record_complete(
            entry.ctx.transport,
            entry.method.as_str(),
            Role::Client,
            reason.outcome(),
        );
        debug!(branch = %key.branch, %reason, "client transaction terminated");
        self.notify_terminated(&key, &entry.call_id);
    }

    fn notify_terminated(&self, key: &TransactionKey, call_id: &SmolStr) {
        let hook = self.inner.on_terminated.read().clone();
        if let Some(hook) = hook {
            hook(key, call_id);
        }
    }

    /// Retries on the next hop or reports the failure to the listener.
    async fn failover(&self, shared: Arc<ClientShared>, failure: Failure, responded: bool) {
        if !responded && !shared.cancel_requested() {
            let failed = *shared.hop.lock();
            if let Some(hop) = failed {
                self.inner.blacklist.insert(hop);
                info!(peer = %hop.addr, transport = hop.transport.as_str(), ?failure, "next hop blacklisted");
            }
            loop {
                let next = shared.remaining.lock().pop_front();
                let Some(next) = next else {
                    break;
                };
                if self.inner.blacklist.contains(&next) {
                    continue;
                }
                info!(peer = %next.addr, transport = next.transport.as_str(), "failing over to next hop");
                match self.start_attempt(&shared, next).await {
                    Ok(_) => return,
                    Err(e) => warn!(%e, peer = %next.addr, "failover attempt failed"),
                }
            }
        }
        match failure {
            Failure::Timeout => shared.listener.on_timeout().await,
            Failure::Transport => {
                let error = shared
                    .last_error
                    .lock()
                    .take()
                    .unwrap_or_else(|| "transport failure".to_owned());
                shared
                    .listener
                    .on_error(&TransactionError::Transport(error))
                    .await;
            }
        }
    }

    async fn handle_command(&self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::TimerFired {
                role,
                key,
                timer,
                seq,
            } => self.on_timer(role, key, timer, seq).await,
            ManagerCommand::TransportError { role, key, error } => {
                self.on_transport_error(role, key, error).await
            }
            ManagerCommand::Failover {
                shared,
                failure,
                responded,
            } => self.failover(shared, failure, responded).await,
            ManagerCommand::SendCancel { shared } => self.send_cancel(&shared).await,
        }
    }
}

enum Created {
    New,
    Existing,
}

async fn run_commands(inner: Weak<ManagerInner>, mut rx: mpsc::UnboundedReceiver<ManagerCommand>) {
    while let Some(cmd) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = TransactionManager { inner };
        tokio::spawn(async move {
            manager.handle_command(cmd).await;
        });
    }
}

/// Next-hop URI: the top Route entry, else the Request-URI.
fn route_target(request: &Request) -> Result<SipUri, TransactionError> {
    if let Some(route) = request.headers.list("Route").into_iter().next() {
        let uri = name_addr_uri(&route);
        return SipUri::parse(uri).ok_or_else(|| TransactionError::UnsupportedUri(uri.to_owned()));
    }
    request
        .uri()
        .as_sip()
        .cloned()
        .ok_or_else(|| TransactionError::UnsupportedUri(request.uri().to_string()))
}

fn name_addr_uri(value: &str) -> &str {
    let value = value.trim();
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.split(';').next().unwrap_or(value),
    }
}

/// Answers one server transaction.
#[derive(Clone)]
pub struct ServerTransactionHandle {
    manager: TransactionManager,
    key: TransactionKey,
}

impl ServerTransactionHandle {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn state(&self) -> Option<ServerState> {
        self.manager.server_state(&self.key)
    }

    /// The request that created the transaction, while it is alive.
    pub fn request(&self) -> Option<Request> {
        self.manager
            .inner
            .server
            .get(&self.key)
            .map(|entry| entry.request.clone())
    }

    pub fn transport(&self) -> Option<TransportContext> {
        self.manager
            .inner
            .server
            .get(&self.key)
            .map(|entry| entry.ctx.clone())
    }

    /// Sends a provisional or final response depending on its status code.
    pub async fn send_response(&self, response: Response) -> Result<(), TransactionError> {
        self.manager.respond(&self.key, response).await
    }

    pub async fn send_provisional(&self, response: Response) -> Result<(), TransactionError> {
        debug_assert!(response.start.is_provisional());
        self.manager.respond(&self.key, response).await
    }

    pub async fn send_final(&self, response: Response) -> Result<(), TransactionError> {
        debug_assert!(!response.start.is_provisional());
        self.manager.respond(&self.key, response).await
    }
}

/// Tracks one outbound request across failover attempts.
#[derive(Clone)]
pub struct ClientTransactionHandle {
    manager: TransactionManager,
    shared: Arc<ClientShared>,
}

impl ClientTransactionHandle {
    /// Key of the current attempt.
    pub fn key(&self) -> Option<TransactionKey> {
        self.shared.current_key()
    }

    pub fn state(&self) -> Option<ClientState> {
        self.key().and_then(|key| self.manager.client_state(&key))
    }

    /// Hop of the current attempt (`None` for explicit destinations).
    pub fn hop(&self) -> Option<Hop> {
        *self.shared.hop.lock()
    }

    /// Cancels a pending INVITE (RFC 3261 §9.1).
    ///
    /// Before any provisional response the CANCEL is held and sent when the
    /// first one arrives. After a final response this does nothing.
    pub async fn cancel(&self) -> Result<(), TransactionError> {
        if !self.shared.request.method().is_invite() {
            return Err(TransactionError::NotInvite);
        }
        let send_now = {
            let mut cancel = self.shared.cancel.lock();
            let state = self.state();
            match (*cancel, state) {
                (CancelState::Sent, _) => false,
                (_, Some(ClientState::Calling)) => {
                    *cancel = CancelState::Pending;
                    false
                }
                (_, Some(ClientState::Proceeding)) => {
                    *cancel = CancelState::Sent;
                    true
                }
                _ => false,
            }
        };
        if send_now {
            self.manager.send_cancel(&self.shared).await;
        }
        Ok(())
    }
}
