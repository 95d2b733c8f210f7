//! The engine: one per node, driving every connection from a single thread.
//!
//! [`Engine::run_once`] is the whole event loop body. It waits on the provider
//! (the only place it blocks), feeds connection-management events to the
//! connection manager, drains every live completion queue through the
//! dispatcher, runs each request's continuation, fires due timers and sweeps
//! zero-count tasks. Observable results are queued as [`EngineEvent`]s.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::buffer::{BufferClass, BufferPool, BufferPoolConfig, BufferPoolStats};
use crate::config::RdmtConfig;
use crate::connection::{ConnId, ConnState, ConnectionManager, Role, SetupParams};
use crate::dispatch;
use crate::error::{CompletionCode, ErrorKind, RdmtError, Result};
use crate::metrics::EngineMetrics;
use crate::protocol::{
    self, Context, Handshake, InitiatorPhase, ResponderPhase, ResponderState, COMMAND_SIZE,
};
use crate::request::{Request, RequestId, RequestPayload, RequestTable};
use crate::task::{TaskCallback, TaskContext, TaskId, TaskOutcome, TaskStatus, TaskTable};
use crate::transport::{CmEvent, ConnRequestInfo, EndpointHandle, OpKind, TransportProvider, WaitOutcome};

/// Something observable that happened inside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A connection reached `Established`.
    Connected {
        /// The connection.
        conn: ConnId,
        /// Its protocol role.
        role: Role,
    },
    /// A connection could not be set up; everything acquired was released.
    SetupFailed {
        /// The connection, if it had been added to the live set.
        conn: Option<ConnId>,
        /// Why setup failed.
        reason: String,
    },
    /// A connection was torn down.
    Closed {
        /// The connection.
        conn: ConnId,
        /// Requests resolved from completions drained during close.
        resolved: usize,
        /// Requests cancelled during close.
        cancelled: usize,
    },
    /// A GET finished on the initiator side.
    GetCompleted {
        /// The connection.
        conn: ConnId,
        /// The handle returned by [`Engine::get`].
        request: RequestId,
        /// Bytes received.
        len: usize,
        /// Outcome.
        result: CompletionCode,
    },
    /// A PUT finished on the initiator side.
    PutCompleted {
        /// The connection.
        conn: ConnId,
        /// The handle returned by [`Engine::put`].
        request: RequestId,
        /// Bytes sent.
        len: usize,
        /// Outcome.
        result: CompletionCode,
    },
    /// The responder answered a GET.
    GetServed {
        /// The connection.
        conn: ConnId,
        /// Bytes written to the initiator.
        len: usize,
    },
    /// The responder received a PUT payload, now staged for later GETs.
    PutReceived {
        /// The connection.
        conn: ConnId,
        /// Bytes received.
        len: usize,
    },
    /// A one-sided remote read or write finished.
    OneSidedCompleted {
        /// The connection.
        conn: ConnId,
        /// The request.
        request: RequestId,
        /// Read or write.
        op: OpKind,
        /// Bytes transferred.
        len: usize,
        /// Outcome.
        result: CompletionCode,
    },
    /// A timer fired.
    TimerFired {
        /// The timer request.
        request: RequestId,
    },
    /// A task's callback ran.
    TaskCompleted(TaskOutcome),
    /// The peer violated the protocol; the connection is being torn down.
    ProtocolViolation {
        /// The connection.
        conn: ConnId,
        /// Description of the violation.
        reason: String,
    },
}

/// What one [`Engine::run_once`] iteration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Connection-management events processed.
    pub events: usize,
    /// Completions dispatched.
    pub completions: usize,
    /// Timers fired.
    pub timers: usize,
    /// The wait ended by timeout.
    pub timed_out: bool,
}

/// The request/response engine.
pub struct Engine<P: TransportProvider> {
    provider: Arc<P>,
    config: RdmtConfig,
    pool: BufferPool<P>,
    manager: ConnectionManager,
    requests: RequestTable,
    tasks: TaskTable,
    metrics: Arc<EngineMetrics>,
    events: Vec<EngineEvent>,
    pending_close: Vec<ConnId>,
    shut_down: bool,
}

impl<P: TransportProvider> Engine<P> {
    /// Creates an engine, registering its buffer pool with `provider`.
    pub fn new(provider: Arc<P>, config: RdmtConfig) -> Result<Self> {
        config.validate()?;
        let pool = BufferPool::new(
            provider.clone(),
            BufferPoolConfig {
                capacity: config.max_connections,
                command_size: COMMAND_SIZE,
                bulk_size: config.bulk_size,
            },
        )?;
        info!(
            max_connections = config.max_connections,
            bulk_size = config.bulk_size,
            "engine started"
        );
        Ok(Self {
            provider,
            config,
            pool,
            manager: ConnectionManager::new(),
            requests: RequestTable::new(),
            tasks: TaskTable::new(),
            metrics: Arc::new(EngineMetrics::new()),
            events: Vec::new(),
            pending_close: Vec::new(),
            shut_down: false,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &RdmtConfig {
        &self.config
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Starts accepting connections on `addr`.
    pub fn listen(&mut self, addr: &str) -> Result<()> {
        self.manager.listen(&*self.provider, addr)
    }

    /// Opens a connection to `addr`. It becomes usable once a
    /// [`EngineEvent::Connected`] event for it is reported.
    pub fn connect(&mut self, addr: &str) -> Result<ConnId> {
        let id = match self.manager.setup(
            &*self.provider,
            &mut self.pool,
            SetupParams {
                role: Role::Initiator,
                request: None,
                cq_depth: self.config.cq_depth,
                credits: self.config.initial_credits,
            },
        ) {
            Ok(id) => id,
            Err(e) => {
                self.metrics.inc_setup_failures();
                return Err(e);
            }
        };

        let handshake = self.local_handshake().encode();
        let endpoint = self.manager.get(id).and_then(|c| c.endpoint());
        let connected = match endpoint {
            Some(ep) => self.provider.connect(ep, addr, &handshake),
            None => Err(RdmtError::UnknownConnection { conn_id: id.0 }),
        };
        if let Err(e) = connected {
            self.metrics.inc_setup_failures();
            self.release_unestablished(id);
            return Err(e.at_setup("connect"));
        }
        self.manager.transition(id, ConnState::Establishing)?;
        debug!(conn = %id, addr, "connect issued");
        Ok(id)
    }

    /// Closes a connection: completions already queued are dispatched,
    /// everything else outstanding is cancelled, then its resources return.
    pub fn close(&mut self, conn: ConnId) -> Result<()> {
        match self.manager.get(conn).map(|c| c.state()) {
            None => Err(RdmtError::UnknownConnection { conn_id: conn.0 }),
            Some(ConnState::Closing) | Some(ConnState::Closed) => Ok(()),
            Some(_) => {
                self.close_connection(conn);
                Ok(())
            }
        }
    }

    /// Starts a GET of up to `len` bytes (`0` for the whole staged payload).
    /// The returned id is reported again in [`EngineEvent::GetCompleted`].
    pub fn get(&mut self, conn: ConnId, len: usize, task: Option<TaskId>) -> Result<RequestId> {
        self.with_protocol(conn, task, |ctx, c, slot| protocol::start_get(ctx, c, len, slot))
    }

    /// Starts a PUT of `data`.
    pub fn put(&mut self, conn: ConnId, data: &[u8], task: Option<TaskId>) -> Result<RequestId> {
        self.with_protocol(conn, task, |ctx, c, slot| protocol::start_put(ctx, c, data, slot))
    }

    /// Reads `len` bytes at offset `remote_addr` of the peer's bulk region into
    /// this connection's bulk slot. Read the bytes with [`Engine::bulk_contents`].
    pub fn read_remote(
        &mut self,
        conn: ConnId,
        remote_addr: u64,
        len: usize,
        task: Option<TaskId>,
    ) -> Result<RequestId> {
        self.with_protocol(conn, task, |ctx, c, slot| {
            protocol::start_one_sided(ctx, c, OpKind::Read, remote_addr, len, slot)
        })
    }

    /// Writes `data` to offset `remote_addr` of the peer's bulk region.
    pub fn write_remote(
        &mut self,
        conn: ConnId,
        remote_addr: u64,
        data: &[u8],
        task: Option<TaskId>,
    ) -> Result<RequestId> {
        self.with_protocol(conn, task, |ctx, c, slot| {
            if c.role() == Role::Initiator
                && c.state() == ConnState::Established
                && c.one_sided.is_none()
                && c.initiator.is_idle()
            {
                ctx.pool.write(c.slot(BufferClass::Bulk)?, data)?;
            }
            protocol::start_one_sided(ctx, c, OpKind::Write, remote_addr, data.len(), slot)
        })
    }

    /// Stages the payload a responder returns to GETs on `conn`.
    pub fn stage_bulk(&mut self, conn: ConnId, data: &[u8]) -> Result<()> {
        let c = self
            .manager
            .get_mut(conn)
            .ok_or(RdmtError::UnknownConnection { conn_id: conn.0 })?;
        if matches!(c.responder, ResponderState::BulkInFlight { .. }) {
            return Err(RdmtError::Busy { conn_id: conn.0 });
        }
        self.pool.write(c.slot(BufferClass::Bulk)?, data)?;
        c.staged_len = data.len();
        Ok(())
    }

    /// Copies the first `len` bytes of the connection's bulk slot.
    pub fn bulk_contents(&self, conn: ConnId, len: usize) -> Result<Vec<u8>> {
        let c = self
            .manager
            .get(conn)
            .ok_or(RdmtError::UnknownConnection { conn_id: conn.0 })?;
        self.pool.read(c.slot(BufferClass::Bulk)?, len)
    }

    /// The payload a responder currently has staged on `conn`.
    pub fn staged(&self, conn: ConnId) -> Result<Vec<u8>> {
        let len = self
            .manager
            .get(conn)
            .ok_or(RdmtError::UnknownConnection { conn_id: conn.0 })?
            .staged_len;
        self.bulk_contents(conn, len)
    }

    /// Offset of the connection's bulk slot within this engine's bulk region.
    pub fn bulk_offset(&self, conn: ConnId) -> Result<u64> {
        let c = self
            .manager
            .get(conn)
            .ok_or(RdmtError::UnknownConnection { conn_id: conn.0 })?;
        Ok(c.slot(BufferClass::Bulk)?.offset() as u64)
    }

    /// Starts a timer that fires after `after`.
    pub fn start_timer(&mut self, after: Duration, task: Option<TaskId>) -> Result<RequestId> {
        let slot = task.map(|t| self.tasks.attach(t)).transpose()?;
        Ok(self.requests.insert(
            RequestPayload::Timer {
                deadline: Instant::now() + after,
            },
            slot,
        ))
    }

    /// Creates a task of `count` requests.
    pub fn create_task(&mut self, context: TaskContext, count: usize) -> TaskId {
        self.tasks.create(context, count)
    }

    /// Installs a task's completion callback.
    pub fn set_task_callback(&mut self, task: TaskId, callback: TaskCallback) -> Result<()> {
        self.tasks.set_callback(task, callback)
    }

    /// Resets a task for reuse with `count` requests.
    pub fn reset_task(&mut self, task: TaskId, count: usize) -> Result<()> {
        self.tasks.reset(task, count)
    }

    /// Removes a task.
    pub fn destroy_task(&mut self, task: TaskId) -> Result<()> {
        self.tasks.destroy(task)
    }

    /// Snapshot of a task.
    pub fn task_status(&self, task: TaskId) -> Result<TaskStatus> {
        self.tasks.status(task)
    }

    /// Runs one event-loop iteration, waiting at most `timeout`.
    pub fn run_once(&mut self, timeout: Duration) -> Result<LoopOutcome> {
        let mut outcome = LoopOutcome::default();
        let timeout = match self.requests.next_deadline() {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => timeout,
        };
        outcome.timed_out = self.provider.wait(timeout)? == WaitOutcome::TimedOut;

        while let Some(event) = self.provider.poll_event()? {
            outcome.events += 1;
            self.handle_event(event);
        }
        self.process_pending_close();

        let completed = dispatch::poll_all(
            &*self.provider,
            &self.manager,
            &mut self.requests,
            &self.metrics,
        );
        outcome.completions = completed.len();
        for (_, request) in completed {
            self.run_continuation(request);
        }
        self.process_pending_close();

        for id in self.requests.expired_timers(Instant::now()) {
            if let Some(request) = self.requests.take(id) {
                outcome.timers += 1;
                self.metrics.inc_timers_fired();
                self.events.push(EngineEvent::TimerFired { request: id });
                self.complete_task_slot(&request, CompletionCode::Success);
            }
        }

        for task_outcome in self.tasks.sweep() {
            self.metrics.inc_tasks_completed();
            self.events.push(EngineEvent::TaskCompleted(task_outcome));
        }
        Ok(outcome)
    }

    /// Takes every event queued since the last call.
    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Remaining credits of a connection.
    pub fn credits(&self, conn: ConnId) -> Result<u32> {
        self.manager
            .get(conn)
            .map(|c| c.credits())
            .ok_or(RdmtError::UnknownConnection { conn_id: conn.0 })
    }

    /// Lifecycle state of a live connection.
    pub fn state(&self, conn: ConnId) -> Option<ConnState> {
        self.manager.get(conn).map(|c| c.state())
    }

    /// Initiator phase of a live connection.
    pub fn initiator_phase(&self, conn: ConnId) -> Option<InitiatorPhase> {
        self.manager.get(conn).map(|c| c.initiator.phase())
    }

    /// Responder phase of a live connection.
    pub fn responder_phase(&self, conn: ConnId) -> Option<ResponderPhase> {
        self.manager.get(conn).map(|c| c.responder.phase())
    }

    /// Live connection ids in insertion order.
    pub fn connections(&self) -> Vec<ConnId> {
        self.manager.ids()
    }

    /// Number of pending requests.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Pending requests of one connection.
    pub fn pending_for(&self, conn: ConnId) -> usize {
        self.requests.pending_for(conn).len()
    }

    /// Buffer pool occupancy.
    pub fn pool_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    /// Closes every connection and releases the buffer pool.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for id in self.manager.ids() {
            if self.state(id) != Some(ConnState::Closing) {
                self.close_connection(id);
            }
        }
        self.pool.release();
        info!("engine shut down");
    }

    fn local_handshake(&self) -> Handshake {
        Handshake::new(
            self.pool.key(BufferClass::Bulk),
            self.pool.key(BufferClass::Command),
        )
    }

    fn context(&mut self) -> (&mut ConnectionManager, Context<'_, P>) {
        (
            &mut self.manager,
            Context {
                provider: &*self.provider,
                pool: &self.pool,
                requests: &mut self.requests,
                tasks: &mut self.tasks,
                metrics: &self.metrics,
                events: &mut self.events,
                pending_close: &mut self.pending_close,
                initial_credits: self.config.initial_credits,
            },
        )
    }

    fn with_protocol<F>(&mut self, conn: ConnId, task: Option<TaskId>, start: F) -> Result<RequestId>
    where
        F: FnOnce(
            &mut Context<'_, P>,
            &mut crate::connection::Connection,
            Option<crate::task::TaskSlot>,
        ) -> Result<RequestId>,
    {
        if self.manager.get(conn).is_none() {
            return Err(RdmtError::UnknownConnection { conn_id: conn.0 });
        }
        let slot = task.map(|t| self.tasks.attach(t)).transpose()?;
        let result = {
            let (manager, mut ctx) = self.context();
            match manager.get_mut(conn) {
                Some(c) => start(&mut ctx, c, slot),
                None => Err(RdmtError::UnknownConnection { conn_id: conn.0 }),
            }
        };
        if let Err(e) = &result {
            if let Some(slot) = slot {
                self.tasks.detach(slot);
            }
            debug!(conn = %conn, "request rejected: {}", e);
        }
        self.process_pending_close();
        result
    }

    fn complete_task_slot(&mut self, request: &Request, code: CompletionCode) {
        if let Some(slot) = request.task {
            if let Some(outcome) = self.tasks.complete(slot, code) {
                self.metrics.inc_tasks_completed();
                self.events.push(EngineEvent::TaskCompleted(outcome));
            }
        }
    }

    fn run_continuation(&mut self, request: Request) {
        let Some(conn) = request.conn() else {
            return;
        };
        let result = {
            let (manager, mut ctx) = self.context();
            match manager.get_mut(conn) {
                Some(c) => Ok(protocol::on_completion(&mut ctx, c, request)),
                None => Err(request),
            }
        };
        let result = match result {
            Ok(r) => r,
            Err(orphan) => {
                debug!(conn = %conn, request = %orphan.id, "completion for a released connection");
                let code = orphan.result;
                self.complete_task_slot(&orphan, code);
                Ok(())
            }
        };
        if let Err(e) = result {
            match e.kind() {
                ErrorKind::Protocol => debug!(conn = %conn, "continuation ended with {}", e),
                _ => warn!(conn = %conn, "continuation failed: {}", e),
            }
        }
    }

    fn handle_event(&mut self, event: CmEvent) {
        match event {
            CmEvent::ConnRequest { info, payload } => self.on_conn_request(info, &payload),
            CmEvent::Established { endpoint, payload } => self.on_established(endpoint, &payload),
            CmEvent::Shutdown { endpoint } => match self.manager.find_by_endpoint(endpoint) {
                Some(conn) => {
                    info!(conn = %conn, "peer shut down");
                    if self.state(conn) != Some(ConnState::Closing) {
                        if self.manager.get(conn).map_or(false, |c| !c.was_established()) {
                            self.metrics.inc_setup_failures();
                            self.events.push(EngineEvent::SetupFailed {
                                conn: Some(conn),
                                reason: "connection refused".into(),
                            });
                        }
                        self.close_connection(conn);
                    }
                }
                None => debug!(endpoint = endpoint.0, "shutdown for unknown endpoint"),
            },
        }
    }

    fn on_conn_request(&mut self, info: ConnRequestInfo, payload: &[u8]) {
        let setup = self.manager.setup(
            &*self.provider,
            &mut self.pool,
            SetupParams {
                role: Role::Responder,
                request: Some(info),
                cq_depth: self.config.cq_depth,
                credits: self.config.initial_credits,
            },
        );
        let conn = match setup {
            Ok(conn) => conn,
            Err(e) => {
                self.metrics.inc_setup_failures();
                if let Err(reject) = self.provider.reject(info) {
                    warn!("reject after failed setup: {}", reject);
                }
                self.events.push(EngineEvent::SetupFailed {
                    conn: None,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let peer = match Handshake::decode(payload) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(conn = %conn, "rejecting connect request: {}", e);
                self.metrics.inc_protocol_errors();
                if let Err(reject) = self.provider.reject(info) {
                    warn!(conn = %conn, "reject failed: {}", reject);
                }
                self.events.push(EngineEvent::ProtocolViolation {
                    conn,
                    reason: e.to_string(),
                });
                self.release_unestablished(conn);
                return;
            }
        };

        if let Err(e) = self.accept(conn, peer) {
            warn!(conn = %conn, "accept failed: {}", e);
            self.metrics.inc_setup_failures();
            self.events.push(EngineEvent::SetupFailed {
                conn: Some(conn),
                reason: e.to_string(),
            });
            if let Err(reject) = self.provider.reject(info) {
                debug!(conn = %conn, "reject after failed accept: {}", reject);
            }
            self.close_connection(conn);
        }
    }

    fn accept(&mut self, conn: ConnId, peer: Handshake) -> Result<()> {
        self.manager.transition(conn, ConnState::ConnectRequested)?;
        {
            let (manager, mut ctx) = self.context();
            let c = manager
                .get_mut(conn)
                .ok_or(RdmtError::UnknownConnection { conn_id: conn.0 })?;
            c.peer = Some(peer);
            protocol::arm_command_recv(&mut ctx, c)?;
        }
        let endpoint = self
            .manager
            .get(conn)
            .and_then(|c| c.endpoint())
            .ok_or(RdmtError::UnknownConnection { conn_id: conn.0 })?;
        self.provider
            .accept(endpoint, &self.local_handshake().encode())?;
        self.manager.transition(conn, ConnState::Establishing)?;
        debug!(conn = %conn, "accept issued");
        Ok(())
    }

    fn on_established(&mut self, endpoint: EndpointHandle, payload: &[u8]) {
        let Some(conn) = self.manager.find_by_endpoint(endpoint) else {
            debug!(endpoint = endpoint.0, "established event for unknown endpoint");
            return;
        };
        let Some(role) = self.manager.get(conn).map(|c| c.role()) else {
            return;
        };
        if role == Role::Initiator {
            match Handshake::decode(payload) {
                Ok(peer) => {
                    if let Some(c) = self.manager.get_mut(conn) {
                        c.peer = Some(peer);
                    }
                }
                Err(e) => {
                    warn!(conn = %conn, "server handshake rejected: {}", e);
                    self.metrics.inc_protocol_errors();
                    self.events.push(EngineEvent::ProtocolViolation {
                        conn,
                        reason: e.to_string(),
                    });
                    self.close_connection(conn);
                    return;
                }
            }
        }
        match self.manager.transition(conn, ConnState::Established) {
            Ok(()) => {
                self.metrics.connection_opened();
                info!(conn = %conn, ?role, "connection established");
                self.events.push(EngineEvent::Connected { conn, role });
            }
            Err(e) => warn!(conn = %conn, "unexpected established event: {}", e),
        }
    }

    fn process_pending_close(&mut self) {
        while !self.pending_close.is_empty() {
            let batch = std::mem::take(&mut self.pending_close);
            for conn in batch {
                match self.state(conn) {
                    None | Some(ConnState::Closing) | Some(ConnState::Closed) => {}
                    Some(_) => self.close_connection(conn),
                }
            }
        }
    }

    /// Tears down a connection that never carried traffic.
    fn release_unestablished(&mut self, conn: ConnId) {
        if self.manager.transition(conn, ConnState::Closing).is_ok() {
            self.manager
                .finish_close(&*self.provider, &mut self.pool, conn);
        }
    }

    fn close_connection(&mut self, conn: ConnId) {
        if let Err(e) = self.manager.transition(conn, ConnState::Closing) {
            debug!(conn = %conn, "close skipped: {}", e);
            return;
        }
        let was_established = self
            .manager
            .get(conn)
            .map_or(false, |c| c.was_established());

        // completions that are already queued resolve normally
        let drained: Vec<Request> = match self.manager.get(conn).and_then(|c| c.cq()) {
            Some(cq) => {
                dispatch::poll(&*self.provider, conn, cq, &mut self.requests, &self.metrics)
                    .collect()
            }
            None => Vec::new(),
        };
        let resolved = drained.len();
        for request in drained {
            self.run_continuation(request);
        }

        let pending = self.requests.pending_for(conn);
        let cancelled = pending.len();
        for id in pending {
            if let Some(mut request) = self.requests.take(id) {
                request.result = CompletionCode::Cancelled;
                self.run_continuation(request);
            }
        }
        self.metrics.add_requests_cancelled(cancelled as u64);

        self.manager
            .finish_close(&*self.provider, &mut self.pool, conn);
        if was_established {
            self.metrics.connection_closed();
        }
        info!(conn = %conn, resolved, cancelled, "connection torn down");
        self.events.push(EngineEvent::Closed {
            conn,
            resolved,
            cancelled,
        });
        // a teardown requested while closing refers to this connection
        self.pending_close.retain(|c| *c != conn);
    }
}

impl<P: TransportProvider> Drop for Engine<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<P: TransportProvider> std::fmt::Debug for Engine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("connections", &self.manager.len())
            .field("pending_requests", &self.requests.len())
            .field("tasks", &self.tasks.len())
            .field("pool", &self.pool.stats())
            .finish()
    }
}
