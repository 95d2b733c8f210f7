//! Connection lifecycle and the live connection set.
//!
//! A connection owns one command slot, one bulk slot, an endpoint and a
//! completion queue. Setup acquires them in a fixed order and releases
//! everything already acquired, in reverse, when a step fails. Teardown
//! always runs to completion; provider errors while closing are logged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::buffer::{BufferClass, BufferPool, BufferSlot};
use crate::error::{RdmtError, Result};
use crate::protocol::{Handshake, InitiatorState, OneSidedOp, ResponderState};
use crate::transport::{
    BindTarget, ConnRequestInfo, CqHandle, EndpointHandle, OpKind, TransportProvider,
};

/// Identifier of a connection, unique within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnState {
    /// Server side: born from a connect request on the listening endpoint.
    Listening,
    /// Resources acquired; the connect request is issued or validated.
    ConnectRequested,
    /// Connect or accept issued, waiting for the established event.
    Establishing,
    /// Ready for protocol traffic.
    Established,
    /// Draining and cancelling outstanding requests.
    Closing,
    /// Resources released.
    Closed,
}

impl ConnState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Listening, ConnectRequested)
                | (ConnectRequested, Establishing)
                | (Establishing, Established)
                | (Listening | ConnectRequested | Establishing | Established, Closing)
                | (Closing, Closed)
        )
    }
}

/// Which side of the command protocol a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Client side: issues GET and PUT.
    Initiator,
    /// Server side: answers commands.
    Responder,
}

/// One connection and the resources it owns.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    role: Role,
    state: ConnState,
    endpoint: Option<EndpointHandle>,
    cq: Option<CqHandle>,
    cmd: Option<BufferSlot>,
    bulk: Option<BufferSlot>,
    was_established: bool,
    pub(crate) credits: u32,
    pub(crate) peer: Option<Handshake>,
    pub(crate) initiator: InitiatorState,
    pub(crate) responder: ResponderState,
    pub(crate) one_sided: Option<OneSidedOp>,
    pub(crate) staged_len: usize,
}

impl Connection {
    /// Connection id.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Protocol role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The endpoint, until teardown.
    pub fn endpoint(&self) -> Option<EndpointHandle> {
        self.endpoint
    }

    /// The completion queue, until teardown.
    pub fn cq(&self) -> Option<CqHandle> {
        self.cq
    }

    /// Remaining command credits.
    pub fn credits(&self) -> u32 {
        self.credits
    }

    /// The peer's handshake record, once received.
    pub fn peer(&self) -> Option<&Handshake> {
        self.peer.as_ref()
    }

    /// Whether the connection ever reached `Established`.
    pub fn was_established(&self) -> bool {
        self.was_established
    }

    /// The slot of `class` owned by this connection.
    pub fn slot(&self, class: BufferClass) -> Result<&BufferSlot> {
        let slot = match class {
            BufferClass::Command => self.cmd.as_ref(),
            BufferClass::Bulk => self.bulk.as_ref(),
        };
        slot.ok_or(RdmtError::InvalidState {
            conn_id: self.id.0,
            state: self.state,
            op: "access slot",
        })
    }

    /// Whether an operation of kind `op` may be posted in the current state.
    ///
    /// Everything is allowed once established; before that only receives may
    /// be posted, so the server can arm its command receive before accepting.
    pub fn may_post(&self, op: OpKind) -> bool {
        match self.state {
            ConnState::Established => true,
            ConnState::ConnectRequested | ConnState::Establishing => op == OpKind::Recv,
            _ => false,
        }
    }
}

#[derive(Default)]
struct Acquired {
    cmd: Option<BufferSlot>,
    bulk: Option<BufferSlot>,
    endpoint: Option<EndpointHandle>,
    cq: Option<CqHandle>,
}

impl Acquired {
    fn rollback<P: TransportProvider>(self, provider: &P, pool: &mut BufferPool<P>) {
        if let Some(cq) = self.cq {
            if let Err(e) = provider.close_queue(cq) {
                warn!("rollback: close completion queue failed: {}", e);
            }
        }
        if let Some(ep) = self.endpoint {
            if let Err(e) = provider.close_endpoint(ep) {
                warn!("rollback: close endpoint failed: {}", e);
            }
        }
        if let Some(slot) = self.bulk {
            pool.free(slot);
        }
        if let Some(slot) = self.cmd {
            pool.free(slot);
        }
    }
}

/// Resource parameters for a new connection.
#[derive(Debug, Clone, Copy)]
pub struct SetupParams {
    /// Protocol role.
    pub role: Role,
    /// Pending connect request (server side).
    pub request: Option<ConnRequestInfo>,
    /// Completion queue depth.
    pub cq_depth: usize,
    /// Starting credits.
    pub credits: u32,
}

/// The live connection set.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    conns: BTreeMap<ConnId, Connection>,
    next_id: u64,
    listening: Option<String>,
}

impl ConnectionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts listening on `addr`.
    pub fn listen<P: TransportProvider>(&mut self, provider: &P, addr: &str) -> Result<()> {
        provider.listen(addr)?;
        info!(addr, "listening");
        self.listening = Some(addr.to_string());
        Ok(())
    }

    /// The address being listened on.
    pub fn listening(&self) -> Option<&str> {
        self.listening.as_deref()
    }

    /// Acquires every resource of a new connection and adds it to the set.
    ///
    /// Order: command slot, bulk slot, endpoint, event-queue bind, completion
    /// queue, completion-queue bind, enable. On failure everything acquired is
    /// released in reverse order and the live set is unchanged.
    pub fn setup<P: TransportProvider>(
        &mut self,
        provider: &P,
        pool: &mut BufferPool<P>,
        params: SetupParams,
    ) -> Result<ConnId> {
        let mut acquired = Acquired::default();
        match Self::acquire(provider, pool, &params, &mut acquired) {
            Ok(()) => {}
            Err(e) => {
                warn!(role = ?params.role, "connection setup failed: {}", e);
                acquired.rollback(provider, pool);
                return Err(e);
            }
        }

        self.next_id += 1;
        let id = ConnId(self.next_id);
        let state = match params.role {
            Role::Initiator => ConnState::ConnectRequested,
            Role::Responder => ConnState::Listening,
        };
        self.conns.insert(
            id,
            Connection {
                id,
                role: params.role,
                state,
                endpoint: acquired.endpoint,
                cq: acquired.cq,
                cmd: acquired.cmd,
                bulk: acquired.bulk,
                was_established: false,
                credits: params.credits,
                peer: None,
                initiator: InitiatorState::Idle,
                responder: ResponderState::Idle,
                one_sided: None,
                staged_len: 0,
            },
        );
        debug!(conn = %id, role = ?params.role, ?state, "connection set up");
        Ok(id)
    }

    fn acquire<P: TransportProvider>(
        provider: &P,
        pool: &mut BufferPool<P>,
        params: &SetupParams,
        acquired: &mut Acquired,
    ) -> Result<()> {
        acquired.cmd = Some(pool.allocate(BufferClass::Command).ok_or(
            RdmtError::PoolExhausted {
                class: BufferClass::Command,
            },
        )?);
        acquired.bulk = Some(
            pool.allocate(BufferClass::Bulk)
                .ok_or(RdmtError::PoolExhausted {
                    class: BufferClass::Bulk,
                })?,
        );
        let ep = provider
            .create_endpoint(params.request)
            .map_err(|e| e.at_setup("create endpoint"))?;
        acquired.endpoint = Some(ep);
        provider
            .bind(ep, BindTarget::EventQueue)
            .map_err(|e| e.at_setup("bind event queue"))?;
        let cq = provider
            .open_completion_queue(params.cq_depth)
            .map_err(|e| e.at_setup("open completion queue"))?;
        acquired.cq = Some(cq);
        provider
            .bind(ep, BindTarget::CompletionQueue(cq))
            .map_err(|e| e.at_setup("bind completion queue"))?;
        provider
            .enable(ep)
            .map_err(|e| e.at_setup("enable endpoint"))?;
        Ok(())
    }

    /// Borrows a live connection.
    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    /// Mutably borrows a live connection.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// Live connection ids in insertion order.
    pub fn ids(&self) -> Vec<ConnId> {
        self.conns.keys().copied().collect()
    }

    /// Live connections in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    /// Finds the connection owning `endpoint`.
    pub fn find_by_endpoint(&self, endpoint: EndpointHandle) -> Option<ConnId> {
        self.conns
            .values()
            .find(|c| c.endpoint == Some(endpoint))
            .map(|c| c.id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// True when no connection is live.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Moves a connection to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, id: ConnId, next: ConnState) -> Result<()> {
        let conn = self
            .conns
            .get_mut(&id)
            .ok_or(RdmtError::UnknownConnection { conn_id: id.0 })?;
        if !conn.state.can_transition(next) {
            return Err(RdmtError::InvalidState {
                conn_id: id.0,
                state: conn.state,
                op: "transition",
            });
        }
        debug!(conn = %id, from = ?conn.state, to = ?next, "state transition");
        conn.state = next;
        if next == ConnState::Established {
            conn.was_established = true;
        }
        Ok(())
    }

    /// Releases every resource of a `Closing` connection and removes it.
    ///
    /// The endpoint is closed before the completion queue, and slots go back
    /// to the pool only after both. Slots of an endpoint that failed to close
    /// may still back posted receives, so they stay out of the pool. Provider
    /// failures are logged and do not stop removal.
    pub fn finish_close<P: TransportProvider>(
        &mut self,
        provider: &P,
        pool: &mut BufferPool<P>,
        id: ConnId,
    ) -> Option<Connection> {
        let mut conn = self.conns.remove(&id)?;
        if conn.state != ConnState::Closing {
            warn!(conn = %id, state = ?conn.state, "releasing a connection that was not closing");
        }
        let mut quiesced = true;
        if let Some(ep) = conn.endpoint.take() {
            if let Err(e) = provider.close_endpoint(ep) {
                warn!(conn = %id, "close endpoint failed: {}", e);
                quiesced = false;
            }
        }
        if let Some(cq) = conn.cq.take() {
            if let Err(e) = provider.close_queue(cq) {
                warn!(conn = %id, "close completion queue failed: {}", e);
            }
        }
        if quiesced {
            if let Some(slot) = conn.cmd.take() {
                pool.free(slot);
            }
            if let Some(slot) = conn.bulk.take() {
                pool.free(slot);
            }
        } else {
            warn!(conn = %id, "keeping buffer slots of an endpoint that did not close");
        }
        conn.state = ConnState::Closed;
        info!(conn = %id, role = ?conn.role, "connection closed");
        Some(conn)
    }
}
