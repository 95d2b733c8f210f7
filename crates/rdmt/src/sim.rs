//! In-memory RDMA fabric for testing without hardware.
//!
//! A [`SimFabric`] is a shared network; every engine gets its own [`SimNode`]
//! from it, which implements [`TransportProvider`]. Operations complete
//! immediately and deterministically: a send either lands in the peer's
//! oldest posted receive or waits in the peer's unexpected-message queue,
//! and remote reads and writes copy bytes directly between registered
//! regions after key, rights and bounds checks.
//!
//! Fault injection hooks ([`SimFabric::fail_next`], [`SimFabric::fail_nth`],
//! [`SimFabric::fail_next_completions`]) and completion holding
//! ([`SimFabric::set_hold_completions`], [`SimFabric::release_held`]) exist
//! for error-path and ordering tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::buffer::MemoryRegion;
use crate::error::{CompletionCode, RdmtError, Result};
use crate::transport::{
    AccessFlags, BindTarget, CmEvent, CompletionEntry, ConnRequestInfo, CqHandle,
    EndpointHandle, LocalBuffer, OpKind, RemoteDescriptor, RemoteKey, TransportProvider,
    WaitOutcome,
};

/// Counters kept by the fabric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    /// Two-sided sends issued.
    pub sends: u64,
    /// Receives posted.
    pub recvs_posted: u64,
    /// Remote reads issued.
    pub reads: u64,
    /// Remote writes issued.
    pub writes: u64,
    /// Payload bytes moved by any operation.
    pub bytes_moved: u64,
    /// Connect attempts.
    pub connects: u64,
    /// Accepted connections.
    pub accepts: u64,
    /// Rejected connect requests.
    pub rejects: u64,
    /// Endpoints closed.
    pub endpoints_closed: u64,
    /// Completions delivered with an error.
    pub completion_errors: u64,
    /// Operations failed synchronously by fault injection.
    pub injected_failures: u64,
    /// Completions pushed past a queue's configured depth.
    pub cq_overflows: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
struct PostedRecv {
    region: MemoryRegion,
    offset: usize,
    len: usize,
    context: u64,
}

#[derive(Debug)]
enum Inbound {
    Message(Vec<u8>),
    WriteData { len: usize, data: u64 },
}

#[derive(Debug)]
struct SimEndpoint {
    node: u64,
    cq: Option<u64>,
    eq_bound: bool,
    enabled: bool,
    state: EndpointState,
    peer: Option<u64>,
    request: Option<u64>,
    recvs: VecDeque<PostedRecv>,
    unexpected: VecDeque<Inbound>,
}

#[derive(Debug)]
struct SimCq {
    node: u64,
    depth: usize,
    entries: VecDeque<CompletionEntry>,
    held: Vec<CompletionEntry>,
}

#[derive(Debug)]
struct SimRegion {
    node: u64,
    region: MemoryRegion,
    access: AccessFlags,
}

#[derive(Debug)]
struct PendingConnect {
    client_endpoint: u64,
    client_node: u64,
    server_node: u64,
}

#[derive(Debug, Default)]
struct FaultPlan {
    skip: usize,
    fail: usize,
}

#[derive(Debug, Default)]
struct FabricState {
    next_id: u64,
    node_names: HashMap<u64, String>,
    node_events: HashMap<u64, VecDeque<CmEvent>>,
    listeners: HashMap<String, u64>,
    endpoints: HashMap<u64, SimEndpoint>,
    cqs: HashMap<u64, SimCq>,
    regions: HashMap<u64, SimRegion>,
    requests: HashMap<u64, PendingConnect>,
    faults: HashMap<&'static str, FaultPlan>,
    fail_completions: usize,
    hold_completions: bool,
    stats: FabricStats,
}

impl FabricState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_fault(&mut self, op: &'static str) -> Result<()> {
        let fire = match self.faults.get_mut(op) {
            Some(plan) if plan.skip > 0 => {
                plan.skip -= 1;
                false
            }
            Some(plan) if plan.fail > 0 => {
                plan.fail -= 1;
                true
            }
            _ => false,
        };
        if fire {
            self.stats.injected_failures += 1;
            debug!(op, "injected failure");
            return Err(RdmtError::Provider {
                op,
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn take_completion_fault(&mut self) -> bool {
        if self.fail_completions > 0 {
            self.fail_completions -= 1;
            true
        } else {
            false
        }
    }

    fn endpoint(&self, node: u64, ep: EndpointHandle, op: &'static str) -> Result<&SimEndpoint> {
        match self.endpoints.get(&ep.0) {
            Some(e) if e.node == node => Ok(e),
            _ => Err(RdmtError::Provider {
                op,
                reason: format!("unknown endpoint {}", ep.0),
            }),
        }
    }

    fn endpoint_mut(
        &mut self,
        node: u64,
        ep: EndpointHandle,
        op: &'static str,
    ) -> Result<&mut SimEndpoint> {
        match self.endpoints.get_mut(&ep.0) {
            Some(e) if e.node == node => Ok(e),
            _ => Err(RdmtError::Provider {
                op,
                reason: format!("unknown endpoint {}", ep.0),
            }),
        }
    }

    fn connected_peer(&self, node: u64, ep: EndpointHandle, op: &'static str) -> Result<u64> {
        let endpoint = self.endpoint(node, ep, op)?;
        match (endpoint.state, endpoint.peer) {
            (EndpointState::Connected, Some(peer)) if self.endpoints.contains_key(&peer) => {
                Ok(peer)
            }
            _ => Err(RdmtError::Provider {
                op,
                reason: format!("endpoint {} is not connected", ep.0),
            }),
        }
    }

    fn push_event(&mut self, node: u64, event: CmEvent) {
        trace!(node, kind = ?event.kind(), "event queued");
        self.node_events.entry(node).or_default().push_back(event);
    }

    /// Queues a completion on the endpoint's bound queue.
    fn complete(&mut self, ep: u64, entry: CompletionEntry) {
        if entry.error.is_some() {
            self.stats.completion_errors += 1;
        }
        let cq_id = match self.endpoints.get(&ep).and_then(|e| e.cq) {
            Some(cq) => cq,
            None => {
                warn!(endpoint = ep, "completion for endpoint without queue dropped");
                return;
            }
        };
        let hold = self.hold_completions;
        let Some(cq) = self.cqs.get_mut(&cq_id) else {
            warn!(cq = cq_id, "completion for closed queue dropped");
            return;
        };
        if hold {
            cq.held.push(entry);
            return;
        }
        if cq.entries.len() >= cq.depth {
            self.stats.cq_overflows += 1;
        }
        cq.entries.push_back(entry);
    }

    /// Delivers an inbound message to the endpoint's oldest posted receive,
    /// or parks it in the unexpected queue.
    fn deliver(&mut self, ep: u64, inbound: Inbound) {
        let Some(endpoint) = self.endpoints.get_mut(&ep) else {
            return;
        };
        match endpoint.recvs.pop_front() {
            Some(recv) => {
                let entry = fill_recv(&recv, inbound);
                self.complete(ep, entry);
            }
            None => endpoint.unexpected.push_back(inbound),
        }
    }

    fn has_work(&self, node: u64) -> bool {
        self.node_events
            .get(&node)
            .map_or(false, |events| !events.is_empty())
            || self
                .cqs
                .values()
                .any(|cq| cq.node == node && !cq.entries.is_empty())
    }

    fn remote_region(
        &self,
        peer_node: u64,
        remote: &RemoteDescriptor,
        needed: AccessFlags,
        len: usize,
    ) -> Option<&SimRegion> {
        let region = self.regions.get(&remote.key.0)?;
        let end = (remote.addr as usize).checked_add(len)?;
        if region.node != peer_node
            || !region.access.contains(needed)
            || end > region.region.len()
            || len as u64 > remote.len
        {
            return None;
        }
        Some(region)
    }
}

fn fill_recv(recv: &PostedRecv, inbound: Inbound) -> CompletionEntry {
    match inbound {
        Inbound::Message(bytes) => {
            if bytes.len() > recv.len {
                return CompletionEntry::failed(recv.context, OpKind::Recv, CompletionCode::Truncated);
            }
            if !recv.region.write_at(recv.offset, &bytes) {
                return CompletionEntry::failed(recv.context, OpKind::Recv, CompletionCode::LocalError);
            }
            CompletionEntry::success(recv.context, OpKind::Recv, bytes.len())
        }
        Inbound::WriteData { len, data } => CompletionEntry {
            context: recv.context,
            op: OpKind::Recv,
            len,
            data: Some(data),
            error: None,
        },
    }
}

struct Shared {
    state: Mutex<FabricState>,
    ready: Condvar,
}

/// A simulated network shared by any number of nodes.
#[derive(Clone)]
pub struct SimFabric {
    shared: Arc<Shared>,
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFabric {
    /// Creates an empty fabric.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FabricState::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Attaches a new node.
    pub fn node(&self, name: &str) -> SimNode {
        let mut state = self.shared.state.lock();
        let id = state.alloc_id();
        state.node_names.insert(id, name.to_string());
        state.node_events.insert(id, VecDeque::new());
        debug!(node = id, name, "sim node attached");
        SimNode {
            fabric: self.clone(),
            id,
            name: name.to_string(),
        }
    }

    /// Makes the next `count` calls of `op` fail synchronously.
    ///
    /// `op` is the provider method name, e.g. `"post_send"` or `"enable"`.
    pub fn fail_next(&self, op: &'static str, count: usize) {
        let mut state = self.shared.state.lock();
        state.faults.insert(op, FaultPlan { skip: 0, fail: count });
    }

    /// Makes only the `n`-th next call of `op` (1-based) fail synchronously.
    pub fn fail_nth(&self, op: &'static str, n: usize) {
        let mut state = self.shared.state.lock();
        state.faults.insert(
            op,
            FaultPlan {
                skip: n.saturating_sub(1),
                fail: 1,
            },
        );
    }

    /// Makes the next `count` posted operations complete with
    /// [`CompletionCode::LocalError`] without transferring anything.
    pub fn fail_next_completions(&self, count: usize) {
        self.shared.state.lock().fail_completions = count;
    }

    /// While holding, completions are kept back instead of being queued.
    pub fn set_hold_completions(&self, hold: bool) {
        self.shared.state.lock().hold_completions = hold;
    }

    /// Queues every held completion, letting `reorder` permute each
    /// queue's held entries first.
    pub fn release_held<F>(&self, mut reorder: F)
    where
        F: FnMut(&mut Vec<CompletionEntry>),
    {
        let mut state = self.shared.state.lock();
        let mut overflows = 0;
        for cq in state.cqs.values_mut() {
            let mut held = std::mem::take(&mut cq.held);
            reorder(&mut held);
            for entry in held {
                if cq.entries.len() >= cq.depth {
                    overflows += 1;
                }
                cq.entries.push_back(entry);
            }
        }
        state.stats.cq_overflows += overflows;
        drop(state);
        self.shared.ready.notify_all();
    }

    /// Number of completions currently held back.
    pub fn held_completions(&self) -> usize {
        let state = self.shared.state.lock();
        state.cqs.values().map(|cq| cq.held.len()).sum()
    }

    /// Number of live memory registrations.
    pub fn registered_regions(&self) -> usize {
        self.shared.state.lock().regions.len()
    }

    /// Number of open endpoints.
    pub fn open_endpoints(&self) -> usize {
        self.shared.state.lock().endpoints.len()
    }

    /// Number of open completion queues.
    pub fn open_queues(&self) -> usize {
        self.shared.state.lock().cqs.len()
    }

    /// Snapshot of the fabric counters.
    pub fn stats(&self) -> FabricStats {
        self.shared.state.lock().stats.clone()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FabricState) -> Result<T>) -> Result<T> {
        let result = {
            let mut state = self.shared.state.lock();
            f(&mut state)
        };
        self.shared.ready.notify_all();
        result
    }
}

/// One engine's view of a [`SimFabric`].
#[derive(Clone)]
pub struct SimNode {
    fabric: SimFabric,
    id: u64,
    name: String,
}

impl SimNode {
    /// The node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fabric this node belongs to.
    pub fn fabric(&self) -> &SimFabric {
        &self.fabric
    }

    fn read_local(local: &LocalBuffer<'_>, op: &'static str) -> Result<Vec<u8>> {
        local
            .region
            .read_at(local.offset, local.len)
            .ok_or_else(|| RdmtError::Provider {
                op,
                reason: "local buffer out of bounds".into(),
            })
    }
}

impl std::fmt::Debug for SimNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl TransportProvider for SimNode {
    fn register_memory(&self, region: &MemoryRegion, access: AccessFlags) -> Result<RemoteKey> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("register_memory")?;
            let key = state.alloc_id();
            state.regions.insert(
                key,
                SimRegion {
                    node,
                    region: region.clone(),
                    access,
                },
            );
            Ok(RemoteKey(key))
        })
    }

    fn deregister_memory(&self, key: RemoteKey) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("deregister_memory")?;
            match state.regions.get(&key.0) {
                Some(region) if region.node == node => {
                    state.regions.remove(&key.0);
                    Ok(())
                }
                _ => Err(RdmtError::Provider {
                    op: "deregister_memory",
                    reason: format!("unknown key {}", key.0),
                }),
            }
        })
    }

    fn listen(&self, addr: &str) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("listen")?;
            match state.listeners.get(addr) {
                Some(owner) if *owner != node => Err(RdmtError::Provider {
                    op: "listen",
                    reason: format!("address {} already in use", addr),
                }),
                _ => {
                    state.listeners.insert(addr.to_string(), node);
                    Ok(())
                }
            }
        })
    }

    fn create_endpoint(&self, request: Option<ConnRequestInfo>) -> Result<EndpointHandle> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("create_endpoint")?;
            if let Some(info) = request {
                match state.requests.get(&info.0) {
                    Some(pending) if pending.server_node == node => {}
                    _ => {
                        return Err(RdmtError::Provider {
                            op: "create_endpoint",
                            reason: format!("unknown connect request {}", info.0),
                        })
                    }
                }
            }
            let id = state.alloc_id();
            state.endpoints.insert(
                id,
                SimEndpoint {
                    node,
                    cq: None,
                    eq_bound: false,
                    enabled: false,
                    state: EndpointState::Idle,
                    peer: None,
                    request: request.map(|r| r.0),
                    recvs: VecDeque::new(),
                    unexpected: VecDeque::new(),
                },
            );
            Ok(EndpointHandle(id))
        })
    }

    fn open_completion_queue(&self, depth: usize) -> Result<CqHandle> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("open_completion_queue")?;
            if depth == 0 {
                return Err(RdmtError::Provider {
                    op: "open_completion_queue",
                    reason: "depth must be > 0".into(),
                });
            }
            let id = state.alloc_id();
            state.cqs.insert(
                id,
                SimCq {
                    node,
                    depth,
                    entries: VecDeque::new(),
                    held: Vec::new(),
                },
            );
            Ok(CqHandle(id))
        })
    }

    fn bind(&self, endpoint: EndpointHandle, target: BindTarget) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("bind")?;
            if let BindTarget::CompletionQueue(cq) = target {
                match state.cqs.get(&cq.0) {
                    Some(q) if q.node == node => {}
                    _ => {
                        return Err(RdmtError::Provider {
                            op: "bind",
                            reason: format!("unknown completion queue {}", cq.0),
                        })
                    }
                }
            }
            let ep = state.endpoint_mut(node, endpoint, "bind")?;
            match target {
                BindTarget::CompletionQueue(cq) => ep.cq = Some(cq.0),
                BindTarget::EventQueue => ep.eq_bound = true,
            }
            Ok(())
        })
    }

    fn enable(&self, endpoint: EndpointHandle) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("enable")?;
            let ep = state.endpoint_mut(node, endpoint, "enable")?;
            if ep.cq.is_none() || !ep.eq_bound {
                return Err(RdmtError::Provider {
                    op: "enable",
                    reason: "endpoint must be bound to a completion queue and the event queue"
                        .into(),
                });
            }
            ep.enabled = true;
            Ok(())
        })
    }

    fn connect(&self, endpoint: EndpointHandle, addr: &str, param: &[u8]) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("connect")?;
            state.stats.connects += 1;
            let ep = state.endpoint(node, endpoint, "connect")?;
            if !ep.enabled || ep.state != EndpointState::Idle {
                return Err(RdmtError::Provider {
                    op: "connect",
                    reason: "endpoint not enabled or already connecting".into(),
                });
            }
            let server_node = *state.listeners.get(addr).ok_or_else(|| RdmtError::Provider {
                op: "connect",
                reason: format!("no listener at {}", addr),
            })?;

            let info = state.alloc_id();
            state.requests.insert(
                info,
                PendingConnect {
                    client_endpoint: endpoint.0,
                    client_node: node,
                    server_node,
                },
            );
            state.endpoint_mut(node, endpoint, "connect")?.state = EndpointState::Connecting;
            state.push_event(
                server_node,
                CmEvent::ConnRequest {
                    info: ConnRequestInfo(info),
                    payload: param.to_vec(),
                },
            );
            Ok(())
        })
    }

    fn accept(&self, endpoint: EndpointHandle, param: &[u8]) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("accept")?;
            let ep = state.endpoint(node, endpoint, "accept")?;
            if !ep.enabled {
                return Err(RdmtError::Provider {
                    op: "accept",
                    reason: "endpoint not enabled".into(),
                });
            }
            let info = ep.request.ok_or_else(|| RdmtError::Provider {
                op: "accept",
                reason: "endpoint was not created for a connect request".into(),
            })?;
            let pending = state.requests.remove(&info).ok_or_else(|| RdmtError::Provider {
                op: "accept",
                reason: format!("connect request {} is gone", info),
            })?;
            let client_alive = matches!(
                state.endpoints.get(&pending.client_endpoint),
                Some(client) if client.state == EndpointState::Connecting
            );
            if !client_alive {
                return Err(RdmtError::Provider {
                    op: "accept",
                    reason: "connecting peer went away".into(),
                });
            }

            if let Some(server_ep) = state.endpoints.get_mut(&endpoint.0) {
                server_ep.state = EndpointState::Connected;
                server_ep.peer = Some(pending.client_endpoint);
            }
            if let Some(client_ep) = state.endpoints.get_mut(&pending.client_endpoint) {
                client_ep.state = EndpointState::Connected;
                client_ep.peer = Some(endpoint.0);
            }
            state.stats.accepts += 1;
            state.push_event(
                pending.client_node,
                CmEvent::Established {
                    endpoint: EndpointHandle(pending.client_endpoint),
                    payload: param.to_vec(),
                },
            );
            state.push_event(
                node,
                CmEvent::Established {
                    endpoint,
                    payload: Vec::new(),
                },
            );
            Ok(())
        })
    }

    fn reject(&self, request: ConnRequestInfo) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("reject")?;
            match state.requests.get(&request.0) {
                Some(pending) if pending.server_node == node => {}
                _ => {
                    return Err(RdmtError::Provider {
                        op: "reject",
                        reason: format!("unknown connect request {}", request.0),
                    })
                }
            }
            if let Some(pending) = state.requests.remove(&request.0) {
                state.stats.rejects += 1;
                if let Some(client) = state.endpoints.get_mut(&pending.client_endpoint) {
                    client.state = EndpointState::Disconnected;
                }
                state.push_event(
                    pending.client_node,
                    CmEvent::Shutdown {
                        endpoint: EndpointHandle(pending.client_endpoint),
                    },
                );
            }
            Ok(())
        })
    }

    fn post_send(
        &self,
        endpoint: EndpointHandle,
        local: LocalBuffer<'_>,
        context: u64,
    ) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("post_send")?;
            let peer = state.connected_peer(node, endpoint, "post_send")?;
            let bytes = Self::read_local(&local, "post_send")?;
            state.stats.sends += 1;
            if state.take_completion_fault() {
                state.complete(
                    endpoint.0,
                    CompletionEntry::failed(context, OpKind::Send, CompletionCode::LocalError),
                );
                return Ok(());
            }
            let len = bytes.len();
            state.stats.bytes_moved += len as u64;
            state.deliver(peer, Inbound::Message(bytes));
            state.complete(endpoint.0, CompletionEntry::success(context, OpKind::Send, len));
            Ok(())
        })
    }

    fn post_recv(
        &self,
        endpoint: EndpointHandle,
        local: LocalBuffer<'_>,
        context: u64,
    ) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("post_recv")?;
            let ep = state.endpoint(node, endpoint, "post_recv")?;
            if !ep.enabled || ep.state == EndpointState::Disconnected {
                return Err(RdmtError::Provider {
                    op: "post_recv",
                    reason: "endpoint not enabled".into(),
                });
            }
            if local.offset.checked_add(local.len).map_or(true, |end| end > local.region.len()) {
                return Err(RdmtError::Provider {
                    op: "post_recv",
                    reason: "local buffer out of bounds".into(),
                });
            }
            state.stats.recvs_posted += 1;
            if state.take_completion_fault() {
                state.complete(
                    endpoint.0,
                    CompletionEntry::failed(context, OpKind::Recv, CompletionCode::LocalError),
                );
                return Ok(());
            }
            let recv = PostedRecv {
                region: local.region.clone(),
                offset: local.offset,
                len: local.len,
                context,
            };
            let ep = state.endpoint_mut(node, endpoint, "post_recv")?;
            match ep.unexpected.pop_front() {
                Some(inbound) => {
                    let entry = fill_recv(&recv, inbound);
                    state.complete(endpoint.0, entry);
                }
                None => ep.recvs.push_back(recv),
            }
            Ok(())
        })
    }

    fn post_read(
        &self,
        endpoint: EndpointHandle,
        local: LocalBuffer<'_>,
        remote: RemoteDescriptor,
        context: u64,
    ) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("post_read")?;
            let peer = state.connected_peer(node, endpoint, "post_read")?;
            let peer_node = state.endpoints.get(&peer).map(|e| e.node).unwrap_or_default();
            state.stats.reads += 1;
            if state.take_completion_fault() {
                state.complete(
                    endpoint.0,
                    CompletionEntry::failed(context, OpKind::Read, CompletionCode::LocalError),
                );
                return Ok(());
            }
            let len = remote.len as usize;
            let bytes = match state.remote_region(peer_node, &remote, AccessFlags::REMOTE_READ, len)
            {
                Some(region) => region.region.read_at(remote.addr as usize, len),
                None => None,
            };
            let entry = match bytes {
                Some(bytes) if bytes.len() <= local.len && local.region.write_at(local.offset, &bytes) => {
                    state.stats.bytes_moved += len as u64;
                    CompletionEntry::success(context, OpKind::Read, len)
                }
                _ => CompletionEntry::failed(context, OpKind::Read, CompletionCode::RemoteAccess),
            };
            state.complete(endpoint.0, entry);
            Ok(())
        })
    }

    fn post_write(
        &self,
        endpoint: EndpointHandle,
        local: LocalBuffer<'_>,
        remote: RemoteDescriptor,
        remote_data: Option<u64>,
        context: u64,
    ) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("post_write")?;
            let peer = state.connected_peer(node, endpoint, "post_write")?;
            let peer_node = state.endpoints.get(&peer).map(|e| e.node).unwrap_or_default();
            let bytes = Self::read_local(&local, "post_write")?;
            state.stats.writes += 1;
            if state.take_completion_fault() {
                state.complete(
                    endpoint.0,
                    CompletionEntry::failed(context, OpKind::Write, CompletionCode::LocalError),
                );
                return Ok(());
            }
            let written = match state.remote_region(
                peer_node,
                &remote,
                AccessFlags::REMOTE_WRITE,
                bytes.len(),
            ) {
                Some(region) => region.region.write_at(remote.addr as usize, &bytes),
                None => false,
            };
            if !written {
                state.complete(
                    endpoint.0,
                    CompletionEntry::failed(context, OpKind::Write, CompletionCode::RemoteAccess),
                );
                return Ok(());
            }
            let len = bytes.len();
            state.stats.bytes_moved += len as u64;
            if let Some(data) = remote_data {
                state.deliver(peer, Inbound::WriteData { len, data });
            }
            state.complete(endpoint.0, CompletionEntry::success(context, OpKind::Write, len));
            Ok(())
        })
    }

    fn poll_completion(&self, cq: CqHandle) -> Result<Option<CompletionEntry>> {
        let node = self.id;
        let mut state = self.fabric.shared.state.lock();
        state.check_fault("poll_completion")?;
        match state.cqs.get_mut(&cq.0) {
            Some(q) if q.node == node => Ok(q.entries.pop_front()),
            _ => Err(RdmtError::Provider {
                op: "poll_completion",
                reason: format!("unknown completion queue {}", cq.0),
            }),
        }
    }

    fn poll_event(&self) -> Result<Option<CmEvent>> {
        let mut state = self.fabric.shared.state.lock();
        Ok(state
            .node_events
            .get_mut(&self.id)
            .and_then(|events| events.pop_front()))
    }

    fn close_endpoint(&self, endpoint: EndpointHandle) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("close_endpoint")?;
            state.endpoint(node, endpoint, "close_endpoint")?;
            let Some(ep) = state.endpoints.remove(&endpoint.0) else {
                return Ok(());
            };
            state.stats.endpoints_closed += 1;
            // a connect still waiting for accept dies with its endpoint
            state
                .requests
                .retain(|_, pending| pending.client_endpoint != endpoint.0);
            if let Some(peer_id) = ep.peer {
                if let Some(peer) = state.endpoints.get_mut(&peer_id) {
                    peer.peer = None;
                    peer.state = EndpointState::Disconnected;
                    let peer_node = peer.node;
                    state.push_event(
                        peer_node,
                        CmEvent::Shutdown {
                            endpoint: EndpointHandle(peer_id),
                        },
                    );
                }
            }
            Ok(())
        })
    }

    fn close_queue(&self, cq: CqHandle) -> Result<()> {
        let node = self.id;
        self.fabric.with_state(|state| {
            state.check_fault("close_queue")?;
            match state.cqs.get(&cq.0) {
                Some(q) if q.node == node => {
                    state.cqs.remove(&cq.0);
                    for ep in state.endpoints.values_mut() {
                        if ep.cq == Some(cq.0) {
                            ep.cq = None;
                        }
                    }
                    Ok(())
                }
                _ => Err(RdmtError::Provider {
                    op: "close_queue",
                    reason: format!("unknown completion queue {}", cq.0),
                }),
            }
        })
    }

    fn wait(&self, timeout: Duration) -> Result<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.fabric.shared.state.lock();
        loop {
            if state.has_work(self.id) {
                return Ok(WaitOutcome::Ready);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            self.fabric
                .shared
                .ready
                .wait_for(&mut state, deadline - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        fabric: SimFabric,
        server: SimNode,
        client: SimNode,
        server_ep: EndpointHandle,
        client_ep: EndpointHandle,
        server_cq: CqHandle,
        client_cq: CqHandle,
    }

    fn endpoint(node: &SimNode, request: Option<ConnRequestInfo>) -> (EndpointHandle, CqHandle) {
        let ep = node.create_endpoint(request).unwrap();
        node.bind(ep, BindTarget::EventQueue).unwrap();
        let cq = node.open_completion_queue(16).unwrap();
        node.bind(ep, BindTarget::CompletionQueue(cq)).unwrap();
        node.enable(ep).unwrap();
        (ep, cq)
    }

    fn connected_pair() -> Pair {
        let fabric = SimFabric::new();
        let server = fabric.node("server");
        let client = fabric.node("client");
        server.listen("sim:1").unwrap();

        let (client_ep, client_cq) = endpoint(&client, None);
        client.connect(client_ep, "sim:1", b"hi").unwrap();

        let info = match server.poll_event().unwrap() {
            Some(CmEvent::ConnRequest { info, payload }) => {
                assert_eq!(payload, b"hi");
                info
            }
            other => panic!("unexpected event {:?}", other),
        };
        let (server_ep, server_cq) = endpoint(&server, Some(info));
        server.accept(server_ep, b"ok").unwrap();

        match client.poll_event().unwrap() {
            Some(CmEvent::Established { endpoint, payload }) => {
                assert_eq!(endpoint, client_ep);
                assert_eq!(payload, b"ok");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            server.poll_event().unwrap(),
            Some(CmEvent::Established { .. })
        ));

        Pair {
            fabric,
            server,
            client,
            server_ep,
            client_ep,
            server_cq,
            client_cq,
        }
    }

    fn buf(region: &MemoryRegion, offset: usize, len: usize) -> LocalBuffer<'_> {
        LocalBuffer {
            region,
            offset,
            len,
        }
    }

    #[test]
    fn test_send_matches_posted_recv() {
        let p = connected_pair();
        let src = MemoryRegion::new(16);
        let dst = MemoryRegion::new(16);
        src.write_at(0, b"ping");

        p.server.post_recv(p.server_ep, buf(&dst, 0, 16), 11).unwrap();
        p.client.post_send(p.client_ep, buf(&src, 0, 4), 22).unwrap();

        let sent = p.client.poll_completion(p.client_cq).unwrap().unwrap();
        assert_eq!(sent, CompletionEntry::success(22, OpKind::Send, 4));
        let recvd = p.server.poll_completion(p.server_cq).unwrap().unwrap();
        assert_eq!(recvd, CompletionEntry::success(11, OpKind::Recv, 4));
        assert_eq!(dst.read_at(0, 4).unwrap(), b"ping");
    }

    #[test]
    fn test_unexpected_message_waits_for_recv() {
        let p = connected_pair();
        let src = MemoryRegion::new(8);
        let dst = MemoryRegion::new(8);
        src.write_at(0, b"early");
        p.client.post_send(p.client_ep, buf(&src, 0, 5), 1).unwrap();
        assert!(p.server.poll_completion(p.server_cq).unwrap().is_none());

        p.server.post_recv(p.server_ep, buf(&dst, 0, 8), 2).unwrap();
        let entry = p.server.poll_completion(p.server_cq).unwrap().unwrap();
        assert_eq!(entry.context, 2);
        assert_eq!(dst.read_at(0, 5).unwrap(), b"early");
    }

    #[test]
    fn test_oversized_message_truncates() {
        let p = connected_pair();
        let src = MemoryRegion::new(32);
        let dst = MemoryRegion::new(8);
        p.server.post_recv(p.server_ep, buf(&dst, 0, 8), 5).unwrap();
        p.client.post_send(p.client_ep, buf(&src, 0, 32), 6).unwrap();
        let entry = p.server.poll_completion(p.server_cq).unwrap().unwrap();
        assert_eq!(entry.error, Some(CompletionCode::Truncated));
    }

    #[test]
    fn test_remote_write_with_data_consumes_recv() {
        let p = connected_pair();
        let target = MemoryRegion::new(64);
        let key = p.client.register_memory(&target, AccessFlags::ALL).unwrap();
        p.client.post_recv(p.client_ep, buf(&target, 0, 64), 7).unwrap();

        let src = MemoryRegion::new(64);
        src.write_at(0, b"bulk data");
        let remote = RemoteDescriptor {
            addr: 16,
            len: 64,
            key,
        };
        p.server
            .post_write(p.server_ep, buf(&src, 0, 9), remote, Some(9), 8)
            .unwrap();

        let done = p.server.poll_completion(p.server_cq).unwrap().unwrap();
        assert_eq!(done, CompletionEntry::success(8, OpKind::Write, 9));
        let recv = p.client.poll_completion(p.client_cq).unwrap().unwrap();
        assert_eq!(recv.context, 7);
        assert_eq!(recv.data, Some(9));
        assert_eq!(target.read_at(16, 9).unwrap(), b"bulk data");
    }

    #[test]
    fn test_remote_read() {
        let p = connected_pair();
        let exposed = MemoryRegion::new(32);
        exposed.write_at(4, b"secret");
        let key = p.server.register_memory(&exposed, AccessFlags::ALL).unwrap();

        let local = MemoryRegion::new(32);
        let remote = RemoteDescriptor { addr: 4, len: 6, key };
        p.client.post_read(p.client_ep, buf(&local, 0, 32), remote, 3).unwrap();
        let entry = p.client.poll_completion(p.client_cq).unwrap().unwrap();
        assert_eq!(entry, CompletionEntry::success(3, OpKind::Read, 6));
        assert_eq!(local.read_at(0, 6).unwrap(), b"secret");
    }

    #[test]
    fn test_remote_access_checks() {
        let p = connected_pair();
        let read_only = MemoryRegion::new(16);
        let key = p
            .server
            .register_memory(&read_only, AccessFlags::LOCAL_READ | AccessFlags::REMOTE_READ)
            .unwrap();
        let src = MemoryRegion::new(16);

        // no write permission
        let remote = RemoteDescriptor { addr: 0, len: 16, key };
        p.client
            .post_write(p.client_ep, buf(&src, 0, 4), remote, None, 1)
            .unwrap();
        let entry = p.client.poll_completion(p.client_cq).unwrap().unwrap();
        assert_eq!(entry.error, Some(CompletionCode::RemoteAccess));

        // out of bounds
        let remote = RemoteDescriptor { addr: 12, len: 8, key };
        p.client.post_read(p.client_ep, buf(&src, 0, 16), remote, 2).unwrap();
        let entry = p.client.poll_completion(p.client_cq).unwrap().unwrap();
        assert_eq!(entry.error, Some(CompletionCode::RemoteAccess));

        // a key of our own node is not the peer's
        let own = p.client.register_memory(&src, AccessFlags::ALL).unwrap();
        let remote = RemoteDescriptor { addr: 0, len: 4, key: own };
        p.client.post_read(p.client_ep, buf(&src, 0, 16), remote, 3).unwrap();
        let entry = p.client.poll_completion(p.client_cq).unwrap().unwrap();
        assert_eq!(entry.error, Some(CompletionCode::RemoteAccess));
        assert_eq!(p.fabric.stats().completion_errors, 3);
    }

    #[test]
    fn test_reject_sends_shutdown() {
        let fabric = SimFabric::new();
        let server = fabric.node("server");
        let client = fabric.node("client");
        server.listen("sim:2").unwrap();
        let (ep, _cq) = endpoint(&client, None);
        client.connect(ep, "sim:2", &[]).unwrap();
        let info = match server.poll_event().unwrap() {
            Some(CmEvent::ConnRequest { info, .. }) => info,
            other => panic!("unexpected event {:?}", other),
        };
        server.reject(info).unwrap();
        assert_eq!(
            client.poll_event().unwrap(),
            Some(CmEvent::Shutdown { endpoint: ep })
        );
        assert!(server.reject(info).is_err());
    }

    #[test]
    fn test_connect_without_listener_fails() {
        let fabric = SimFabric::new();
        let client = fabric.node("client");
        let (ep, _cq) = endpoint(&client, None);
        assert!(client.connect(ep, "sim:nowhere", &[]).is_err());
    }

    #[test]
    fn test_enable_requires_binding() {
        let fabric = SimFabric::new();
        let node = fabric.node("n");
        let ep = node.create_endpoint(None).unwrap();
        assert!(node.enable(ep).is_err());
        node.bind(ep, BindTarget::EventQueue).unwrap();
        assert!(node.enable(ep).is_err());
    }

    #[test]
    fn test_close_endpoint_notifies_peer() {
        let p = connected_pair();
        p.client.close_endpoint(p.client_ep).unwrap();
        assert_eq!(
            p.server.poll_event().unwrap(),
            Some(CmEvent::Shutdown {
                endpoint: p.server_ep
            })
        );
        let src = MemoryRegion::new(4);
        assert!(p.server.post_send(p.server_ep, buf(&src, 0, 4), 1).is_err());
        assert!(p.client.close_endpoint(p.client_ep).is_err());
        assert_eq!(p.fabric.stats().endpoints_closed, 1);
    }

    #[test]
    fn test_fault_injection() {
        let p = connected_pair();
        let src = MemoryRegion::new(4);
        p.fabric.fail_next("post_send", 1);
        assert!(p.client.post_send(p.client_ep, buf(&src, 0, 4), 1).is_err());
        assert!(p.client.post_send(p.client_ep, buf(&src, 0, 4), 2).is_ok());

        p.fabric.fail_nth("post_send", 2);
        assert!(p.client.post_send(p.client_ep, buf(&src, 0, 4), 3).is_ok());
        assert!(p.client.post_send(p.client_ep, buf(&src, 0, 4), 4).is_err());
        assert_eq!(p.fabric.stats().injected_failures, 2);

        p.fabric.fail_next_completions(1);
        p.client.post_send(p.client_ep, buf(&src, 0, 4), 5).unwrap();
        let mut entries = Vec::new();
        while let Some(e) = p.client.poll_completion(p.client_cq).unwrap() {
            entries.push(e);
        }
        let failed = entries.iter().find(|e| e.context == 5).unwrap();
        assert_eq!(failed.error, Some(CompletionCode::LocalError));
    }

    #[test]
    fn test_hold_and_release_reorders() {
        let p = connected_pair();
        let src = MemoryRegion::new(4);
        p.fabric.set_hold_completions(true);
        for ctx in 1..=3 {
            p.client.post_send(p.client_ep, buf(&src, 0, 4), ctx).unwrap();
        }
        assert!(p.client.poll_completion(p.client_cq).unwrap().is_none());
        assert_eq!(p.fabric.held_completions(), 3);

        p.fabric.set_hold_completions(false);
        p.fabric.release_held(|held| held.reverse());
        let order: Vec<u64> = std::iter::from_fn(|| p.client.poll_completion(p.client_cq).unwrap())
            .map(|e| e.context)
            .collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_wait_times_out_and_wakes() {
        let p = connected_pair();
        assert_eq!(
            p.server.wait(Duration::from_millis(5)).unwrap(),
            WaitOutcome::TimedOut
        );

        let client = p.client.clone();
        let client_ep = p.client_ep;
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let src = MemoryRegion::new(4);
            client.post_send(client_ep, buf(&src, 0, 4), 1).unwrap();
        });
        let dst = MemoryRegion::new(4);
        p.server.post_recv(p.server_ep, buf(&dst, 0, 4), 9).unwrap();
        assert_eq!(
            p.server.wait(Duration::from_secs(5)).unwrap(),
            WaitOutcome::Ready
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_listen_address_conflict() {
        let fabric = SimFabric::new();
        let a = fabric.node("a");
        let b = fabric.node("b");
        a.listen("sim:3").unwrap();
        a.listen("sim:3").unwrap();
        assert!(b.listen("sim:3").is_err());
    }
}
