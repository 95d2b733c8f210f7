//! GET/PUT command protocol.
//!
//! Wire formats are fixed-size little-endian records:
//!
//! ```text
//! handshake: magic:u64 | bulk_key:u64 | cmd_key:u64      (24 bytes)
//! command:   type:u64  | length:u64   | remote_addr:u64  (24 bytes)
//! ```
//!
//! The handshake travels in the connect/accept parameter data. Commands
//! travel in the command slot; payloads move through the bulk slot.
//!
//! An initiator runs at most one exchange at a time and only while it holds
//! a credit. A GET posts a bulk receive, then sends the command; the
//! responder answers with a remote write into the initiator's bulk slot that
//! carries the payload length as remote completion data. A PUT stages the
//! payload, sends the command, and sends the bulk slot once the command send
//! has completed; the responder receives it into its own bulk slot.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffer::{BufferClass, BufferPool};
use crate::connection::{ConnId, Connection, ConnState, Role};
use crate::engine::EngineEvent;
use crate::error::{CompletionCode, RdmtError, Result};
use crate::metrics::EngineMetrics;
use crate::request::{Request, RequestId, RequestPayload, RequestTable, Step};
use crate::task::{TaskSlot, TaskTable};
use crate::transport::{OpKind, RemoteDescriptor, RemoteKey, TransportProvider};

/// Protocol magic carried in the handshake.
pub const MAGIC: u64 = 0x524D_4454_0000_0001;

/// Encoded size of a [`Command`].
pub const COMMAND_SIZE: usize = 24;

/// Encoded size of a [`Handshake`].
pub const HANDSHAKE_SIZE: usize = 24;

/// Command type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum CommandType {
    /// Fetch the responder's staged payload.
    Get = 0,
    /// Deliver a payload to the responder.
    Put = 1,
}

impl TryFrom<u64> for CommandType {
    type Error = RdmtError;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(CommandType::Get),
            1 => Ok(CommandType::Put),
            other => Err(RdmtError::UnknownCommand(other)),
        }
    }
}

/// A command message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// GET or PUT.
    pub kind: CommandType,
    /// Requested (GET) or supplied (PUT) payload length.
    pub length: u64,
    /// Offset of the sender's bulk slot in its registered bulk region.
    pub remote_addr: u64,
}

impl Command {
    /// Encodes the command.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMMAND_SIZE);
        buf.put_u64_le(self.kind as u64);
        buf.put_u64_le(self.length);
        buf.put_u64_le(self.remote_addr);
        buf.freeze()
    }

    /// Decodes a command, rejecting short input and unknown types.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < COMMAND_SIZE {
            return Err(RdmtError::InvalidMessage {
                reason: format!("command needs {} bytes, got {}", COMMAND_SIZE, buf.len()),
            });
        }
        let kind = CommandType::try_from(buf.get_u64_le())?;
        let length = buf.get_u64_le();
        let remote_addr = buf.get_u64_le();
        Ok(Self {
            kind,
            length,
            remote_addr,
        })
    }
}

/// Record exchanged at connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol magic.
    pub magic: u64,
    /// Remote key of the sender's bulk region.
    pub bulk_key: RemoteKey,
    /// Remote key of the sender's command region.
    pub cmd_key: RemoteKey,
}

impl Handshake {
    /// A handshake advertising the given keys.
    pub fn new(bulk_key: RemoteKey, cmd_key: RemoteKey) -> Self {
        Self {
            magic: MAGIC,
            bulk_key,
            cmd_key,
        }
    }

    /// Encodes the handshake.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_SIZE);
        buf.put_u64_le(self.magic);
        buf.put_u64_le(self.bulk_key.0);
        buf.put_u64_le(self.cmd_key.0);
        buf.freeze()
    }

    /// Decodes and validates a handshake.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HANDSHAKE_SIZE {
            return Err(RdmtError::InvalidMessage {
                reason: format!("handshake needs {} bytes, got {}", HANDSHAKE_SIZE, buf.len()),
            });
        }
        let magic = buf.get_u64_le();
        if magic != MAGIC {
            return Err(RdmtError::HandshakeMismatch {
                expected: MAGIC,
                got: magic,
            });
        }
        Ok(Self {
            magic,
            bulk_key: RemoteKey(buf.get_u64_le()),
            cmd_key: RemoteKey(buf.get_u64_le()),
        })
    }
}

/// Observable phase of the initiator side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiatorPhase {
    /// No exchange in flight.
    Idle,
    /// Waiting for the command send to complete.
    CommandSent,
    /// Command delivered, waiting for the bulk transfer.
    AwaitBulk,
    /// Both halves finished; the exchange is being resolved.
    Done,
}

/// An exchange in flight on the initiator side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Handle returned to the caller.
    pub id: RequestId,
    /// GET or PUT.
    pub kind: CommandType,
    /// Requested or staged length.
    pub len: usize,
    /// Task slot to report into.
    pub task: Option<TaskSlot>,
    command_done: bool,
    bulk_done: bool,
    received: usize,
}

/// Initiator state of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InitiatorState {
    /// Ready for a new exchange.
    #[default]
    Idle,
    /// An exchange is in flight.
    Busy(Exchange),
}

impl InitiatorState {
    /// The current phase.
    pub fn phase(&self) -> InitiatorPhase {
        match self {
            InitiatorState::Idle => InitiatorPhase::Idle,
            InitiatorState::Busy(ex) if !ex.command_done => InitiatorPhase::CommandSent,
            InitiatorState::Busy(ex) if !ex.bulk_done => InitiatorPhase::AwaitBulk,
            InitiatorState::Busy(_) => InitiatorPhase::Done,
        }
    }

    /// True when no exchange is in flight.
    pub fn is_idle(&self) -> bool {
        matches!(self, InitiatorState::Idle)
    }
}

/// Observable phase of the responder side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponderPhase {
    /// Command receive armed.
    Idle,
    /// A command arrived and is being handled.
    CommandReceived,
    /// The reply write or the PUT payload receive is in flight.
    BulkInFlight,
    /// The bulk transfer finished; re-arming.
    ReplySent,
}

/// Responder state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponderState {
    /// Command receive armed (or not yet armed).
    #[default]
    Idle,
    /// Handling a decoded command.
    CommandReceived(Command),
    /// Bulk transfer of `len` bytes in flight.
    BulkInFlight {
        /// The command being served.
        kind: CommandType,
        /// Bytes in flight.
        len: usize,
    },
    /// Bulk transfer finished.
    ReplySent {
        /// The command served.
        kind: CommandType,
        /// Bytes transferred.
        len: usize,
    },
}

impl ResponderState {
    /// The current phase.
    pub fn phase(&self) -> ResponderPhase {
        match self {
            ResponderState::Idle => ResponderPhase::Idle,
            ResponderState::CommandReceived(_) => ResponderPhase::CommandReceived,
            ResponderState::BulkInFlight { .. } => ResponderPhase::BulkInFlight,
            ResponderState::ReplySent { .. } => ResponderPhase::ReplySent,
        }
    }
}

/// A one-sided remote read or write in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OneSidedOp {
    /// Request id.
    pub id: RequestId,
    /// Read or write.
    pub op: OpKind,
    /// Bytes requested.
    pub len: usize,
    /// Task slot to report into.
    pub task: Option<TaskSlot>,
}

enum Post {
    Send { class: BufferClass, len: usize },
    Recv { class: BufferClass, len: usize },
    Read { len: usize, remote: RemoteDescriptor },
    Write { len: usize, remote: RemoteDescriptor, data: Option<u64> },
}

impl Post {
    fn op(&self) -> OpKind {
        match self {
            Post::Send { .. } => OpKind::Send,
            Post::Recv { .. } => OpKind::Recv,
            Post::Read { .. } => OpKind::Read,
            Post::Write { .. } => OpKind::Write,
        }
    }
}

/// Engine state the protocol needs while driving one connection.
pub(crate) struct Context<'a, P: TransportProvider> {
    pub provider: &'a P,
    pub pool: &'a BufferPool<P>,
    pub requests: &'a mut RequestTable,
    pub tasks: &'a mut TaskTable,
    pub metrics: &'a EngineMetrics,
    pub events: &'a mut Vec<EngineEvent>,
    pub pending_close: &'a mut Vec<ConnId>,
    pub initial_credits: u32,
}

impl<'a, P: TransportProvider> Context<'a, P> {
    fn post(&mut self, conn: &Connection, post: Post, step: Step) -> Result<RequestId> {
        let op = post.op();
        if !conn.may_post(op) {
            return Err(RdmtError::InvalidState {
                conn_id: conn.id().0,
                state: conn.state(),
                op: "post",
            });
        }
        let endpoint = conn.endpoint().ok_or(RdmtError::InvalidState {
            conn_id: conn.id().0,
            state: conn.state(),
            op: "post",
        })?;
        let bytes = match &post {
            Post::Send { len, .. }
            | Post::Recv { len, .. }
            | Post::Read { len, .. }
            | Post::Write { len, .. } => *len,
        };
        let id = self.requests.insert(
            RequestPayload::Network {
                conn: conn.id(),
                op,
                step,
                bytes,
            },
            None,
        );
        let class = match &post {
            Post::Send { class, .. } | Post::Recv { class, .. } => *class,
            Post::Read { .. } | Post::Write { .. } => BufferClass::Bulk,
        };
        let posted = conn.slot(class).and_then(|slot| {
            let local = self.pool.local(slot, bytes)?;
            match post {
                Post::Send { .. } => self.provider.post_send(endpoint, local, id.0),
                Post::Recv { .. } => self.provider.post_recv(endpoint, local, id.0),
                Post::Read { remote, .. } => self.provider.post_read(endpoint, local, remote, id.0),
                Post::Write { remote, data, .. } => {
                    self.provider.post_write(endpoint, local, remote, data, id.0)
                }
            }
        });
        if let Err(e) = posted {
            self.requests.take(id);
            return Err(e);
        }
        Ok(id)
    }

    fn complete_task(&mut self, slot: Option<TaskSlot>, code: CompletionCode) {
        let Some(slot) = slot else { return };
        if let Some(outcome) = self.tasks.complete(slot, code) {
            self.metrics.inc_tasks_completed();
            self.events.push(EngineEvent::TaskCompleted(outcome));
        }
    }

    fn teardown(&mut self, conn: ConnId) {
        if !self.pending_close.contains(&conn) {
            self.pending_close.push(conn);
        }
    }

    fn violation(&mut self, conn: &Connection, err: RdmtError) -> RdmtError {
        warn!(conn = %conn.id(), "protocol violation: {}", err);
        self.metrics.inc_protocol_errors();
        self.events.push(EngineEvent::ProtocolViolation {
            conn: conn.id(),
            reason: err.to_string(),
        });
        self.teardown(conn.id());
        err
    }
}

fn check_initiator(conn: &Connection, op: &'static str) -> Result<()> {
    if conn.role() != Role::Initiator || conn.state() != ConnState::Established {
        return Err(RdmtError::InvalidState {
            conn_id: conn.id().0,
            state: conn.state(),
            op,
        });
    }
    if !conn.initiator.is_idle() || conn.one_sided.is_some() {
        return Err(RdmtError::Busy {
            conn_id: conn.id().0,
        });
    }
    Ok(())
}

fn take_credit<P: TransportProvider>(ctx: &mut Context<'_, P>, conn: &Connection) -> Result<()> {
    if conn.credits == 0 {
        return Err(ctx.violation(
            conn,
            RdmtError::OutOfCredits {
                conn_id: conn.id().0,
            },
        ));
    }
    Ok(())
}

fn bulk_capacity(conn: &Connection) -> Result<usize> {
    conn.slot(BufferClass::Bulk).map(|slot| slot.len())
}

/// Starts a GET of up to `len` bytes; `0` asks for the whole staged payload.
pub(crate) fn start_get<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    len: usize,
    task: Option<TaskSlot>,
) -> Result<RequestId> {
    check_initiator(conn, "get")?;
    let capacity = bulk_capacity(conn)?;
    if len > capacity {
        return Err(RdmtError::OutOfBounds {
            offset: 0,
            len,
            capacity,
        });
    }
    take_credit(ctx, conn)?;

    let command = Command {
        kind: CommandType::Get,
        // zero asks for everything staged, bounded by this slot
        length: (if len == 0 { capacity } else { len }) as u64,
        remote_addr: conn.slot(BufferClass::Bulk)?.offset() as u64,
    };
    ctx.pool
        .write(conn.slot(BufferClass::Command)?, &command.encode())?;

    ctx.post(
        conn,
        Post::Recv {
            class: BufferClass::Bulk,
            len: capacity,
        },
        Step::BulkReceived,
    )?;
    let id = match ctx.post(
        conn,
        Post::Send {
            class: BufferClass::Command,
            len: COMMAND_SIZE,
        },
        Step::CommandSent,
    ) {
        Ok(id) => id,
        Err(e) => {
            // the bulk receive is already posted and can only be cancelled
            warn!(conn = %conn.id(), "GET command send rejected: {}", e);
            ctx.teardown(conn.id());
            return Err(e);
        }
    };

    conn.credits -= 1;
    conn.initiator = InitiatorState::Busy(Exchange {
        id,
        kind: CommandType::Get,
        len,
        task,
        command_done: false,
        bulk_done: false,
        received: 0,
    });
    debug!(conn = %conn.id(), request = %id, len, "GET started");
    Ok(id)
}

/// Starts a PUT of `data`.
pub(crate) fn start_put<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    data: &[u8],
    task: Option<TaskSlot>,
) -> Result<RequestId> {
    check_initiator(conn, "put")?;
    let capacity = bulk_capacity(conn)?;
    if data.len() > capacity {
        return Err(RdmtError::OutOfBounds {
            offset: 0,
            len: data.len(),
            capacity,
        });
    }
    take_credit(ctx, conn)?;

    ctx.pool.write(conn.slot(BufferClass::Bulk)?, data)?;
    let command = Command {
        kind: CommandType::Put,
        length: data.len() as u64,
        remote_addr: conn.slot(BufferClass::Bulk)?.offset() as u64,
    };
    ctx.pool
        .write(conn.slot(BufferClass::Command)?, &command.encode())?;
    let id = ctx.post(
        conn,
        Post::Send {
            class: BufferClass::Command,
            len: COMMAND_SIZE,
        },
        Step::CommandSent,
    )?;

    conn.credits -= 1;
    conn.initiator = InitiatorState::Busy(Exchange {
        id,
        kind: CommandType::Put,
        len: data.len(),
        task,
        command_done: false,
        bulk_done: false,
        received: 0,
    });
    debug!(conn = %conn.id(), request = %id, len = data.len(), "PUT started");
    Ok(id)
}

/// Starts a one-sided read (into the local bulk slot) or write (from it)
/// against offset `remote_addr` of the peer's bulk region.
pub(crate) fn start_one_sided<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    op: OpKind,
    remote_addr: u64,
    len: usize,
    task: Option<TaskSlot>,
) -> Result<RequestId> {
    let name = if op == OpKind::Read { "read_remote" } else { "write_remote" };
    check_initiator(conn, name)?;
    let capacity = bulk_capacity(conn)?;
    if len > capacity {
        return Err(RdmtError::OutOfBounds {
            offset: 0,
            len,
            capacity,
        });
    }
    let peer = conn.peer.ok_or(RdmtError::InvalidState {
        conn_id: conn.id().0,
        state: conn.state(),
        op: name,
    })?;
    let remote = RemoteDescriptor {
        addr: remote_addr,
        len: len as u64,
        key: peer.bulk_key,
    };
    let post = match op {
        OpKind::Read => Post::Read { len, remote },
        _ => Post::Write {
            len,
            remote,
            data: None,
        },
    };
    let id = ctx.post(conn, post, Step::OneSided)?;
    conn.one_sided = Some(OneSidedOp { id, op, len, task });
    Ok(id)
}

/// Posts the command receive a responder waits on.
pub(crate) fn arm_command_recv<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
) -> Result<()> {
    ctx.post(
        conn,
        Post::Recv {
            class: BufferClass::Command,
            len: COMMAND_SIZE,
        },
        Step::CommandReceived,
    )?;
    conn.responder = ResponderState::Idle;
    Ok(())
}

/// Runs the continuation of a resolved request.
///
/// Returns an error when the request revealed a failure; connection teardown,
/// when needed, has already been scheduled through the context.
pub(crate) fn on_completion<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    request: Request,
) -> Result<()> {
    let Some(step) = request.step() else {
        return Ok(());
    };
    match step {
        Step::CommandSent => command_sent(ctx, conn, &request),
        Step::BulkReceived => bulk_received(ctx, conn, &request),
        Step::BulkSent => bulk_sent(ctx, conn, &request),
        Step::CommandReceived => command_received(ctx, conn, &request),
        Step::ReplyWritten => reply_written(ctx, conn, &request),
        Step::PutPayloadReceived => put_payload_received(ctx, conn, &request),
        Step::OneSided => one_sided_done(ctx, conn, &request),
    }
}

fn exchange_mut<'c>(conn: &'c mut Connection, request: &Request) -> Option<&'c mut Exchange> {
    let id = conn.id();
    match &mut conn.initiator {
        InitiatorState::Busy(ex) => Some(ex),
        InitiatorState::Idle => {
            debug!(conn = %id, request = %request.id, "completion after exchange ended ignored");
            None
        }
    }
}

fn finish_exchange<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    code: CompletionCode,
) {
    let InitiatorState::Busy(ex) = std::mem::take(&mut conn.initiator) else {
        return;
    };
    conn.credits = (conn.credits + 1).min(ctx.initial_credits);
    let event = match ex.kind {
        CommandType::Get => EngineEvent::GetCompleted {
            conn: conn.id(),
            request: ex.id,
            len: ex.received,
            result: code,
        },
        CommandType::Put => EngineEvent::PutCompleted {
            conn: conn.id(),
            request: ex.id,
            len: ex.len,
            result: code,
        },
    };
    debug!(conn = %conn.id(), request = %ex.id, kind = ?ex.kind, result = %code, "exchange finished");
    ctx.events.push(event);
    ctx.complete_task(ex.task, code);
}

fn fail_exchange<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    code: CompletionCode,
) -> Result<()> {
    finish_exchange(ctx, conn, code);
    if code == CompletionCode::Cancelled {
        return Ok(());
    }
    ctx.teardown(conn.id());
    Err(RdmtError::Completion { code })
}

fn command_sent<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    request: &Request,
) -> Result<()> {
    let closing = conn.state() == ConnState::Closing;
    let Some(ex) = exchange_mut(conn, request) else {
        return Ok(());
    };
    if !request.result.is_success() {
        return fail_exchange(ctx, conn, request.result);
    }
    ex.command_done = true;
    ctx.metrics.inc_commands_sent();
    let kind = ex.kind;
    match kind {
        CommandType::Get => {
            if ex.bulk_done {
                finish_exchange(ctx, conn, CompletionCode::Success);
            }
            Ok(())
        }
        CommandType::Put if closing => fail_exchange(ctx, conn, CompletionCode::Cancelled),
        CommandType::Put => {
            let len = ex.len;
            let posted = ctx.post(
                conn,
                Post::Send {
                    class: BufferClass::Bulk,
                    len,
                },
                Step::BulkSent,
            );
            match posted {
                Ok(_) => Ok(()),
                Err(e) => {
                    warn!(conn = %conn.id(), "PUT payload send rejected: {}", e);
                    fail_exchange(ctx, conn, CompletionCode::LocalError)
                }
            }
        }
    }
}

fn bulk_received<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    request: &Request,
) -> Result<()> {
    let capacity = bulk_capacity(conn)?;
    let Some(ex) = exchange_mut(conn, request) else {
        return Ok(());
    };
    if !request.result.is_success() {
        return fail_exchange(ctx, conn, request.result);
    }
    let received = request.data.map_or(request.len, |len| len as usize);
    if received > capacity {
        let err = ctx.violation(
            conn,
            RdmtError::InvalidMessage {
                reason: format!("GET reply of {} bytes exceeds bulk slot of {}", received, capacity),
            },
        );
        finish_exchange(ctx, conn, CompletionCode::Truncated);
        return Err(err);
    }
    ex.received = received;
    ex.bulk_done = true;
    ctx.metrics.add_bulk_bytes_received(ex.received as u64);
    if ex.command_done {
        finish_exchange(ctx, conn, CompletionCode::Success);
    }
    Ok(())
}

fn bulk_sent<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    request: &Request,
) -> Result<()> {
    let Some(ex) = exchange_mut(conn, request) else {
        return Ok(());
    };
    if !request.result.is_success() {
        return fail_exchange(ctx, conn, request.result);
    }
    ex.bulk_done = true;
    ctx.metrics.add_bulk_bytes_sent(request.len as u64);
    finish_exchange(ctx, conn, CompletionCode::Success);
    Ok(())
}

fn responder_failed<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    code: CompletionCode,
) -> Result<()> {
    conn.responder = ResponderState::Idle;
    if code == CompletionCode::Cancelled {
        return Ok(());
    }
    warn!(conn = %conn.id(), "responder transfer failed: {}", code);
    ctx.teardown(conn.id());
    Err(RdmtError::Completion { code })
}

fn rearm<P: TransportProvider>(ctx: &mut Context<'_, P>, conn: &mut Connection) -> Result<()> {
    if conn.state() == ConnState::Closing {
        conn.responder = ResponderState::Idle;
        return Ok(());
    }
    if let Err(e) = arm_command_recv(ctx, conn) {
        warn!(conn = %conn.id(), "failed to re-arm command receive: {}", e);
        ctx.teardown(conn.id());
        return Err(e);
    }
    Ok(())
}

fn command_received<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    request: &Request,
) -> Result<()> {
    if !request.result.is_success() {
        return responder_failed(ctx, conn, request.result);
    }
    if conn.state() == ConnState::Closing {
        return Ok(());
    }
    if request.len != COMMAND_SIZE {
        return Err(ctx.violation(
            conn,
            RdmtError::InvalidMessage {
                reason: format!("command of {} bytes", request.len),
            },
        ));
    }
    let bytes = ctx.pool.read(conn.slot(BufferClass::Command)?, COMMAND_SIZE)?;
    let command = match Command::decode(&bytes) {
        Ok(command) => command,
        Err(e) => return Err(ctx.violation(conn, e)),
    };
    ctx.metrics.inc_commands_received();
    conn.responder = ResponderState::CommandReceived(command);
    debug!(conn = %conn.id(), kind = ?command.kind, length = command.length, "command received");

    let capacity = bulk_capacity(conn)?;
    match command.kind {
        CommandType::Get => {
            let Some(peer) = conn.peer else {
                return Err(ctx.violation(
                    conn,
                    RdmtError::InvalidMessage {
                        reason: "GET before handshake".into(),
                    },
                ));
            };
            let len = match command.length as usize {
                0 => conn.staged_len,
                requested => requested.min(conn.staged_len),
            };
            let remote = RemoteDescriptor {
                addr: command.remote_addr,
                len: len as u64,
                key: peer.bulk_key,
            };
            let posted = ctx.post(
                conn,
                Post::Write {
                    len,
                    remote,
                    data: Some(len as u64),
                },
                Step::ReplyWritten,
            );
            if let Err(e) = posted {
                warn!(conn = %conn.id(), "GET reply rejected: {}", e);
                ctx.teardown(conn.id());
                return Err(e);
            }
            conn.responder = ResponderState::BulkInFlight {
                kind: CommandType::Get,
                len,
            };
        }
        CommandType::Put => {
            let len = command.length as usize;
            if len > capacity {
                return Err(ctx.violation(
                    conn,
                    RdmtError::InvalidMessage {
                        reason: format!("PUT of {} bytes exceeds bulk slot of {}", len, capacity),
                    },
                ));
            }
            let posted = ctx.post(
                conn,
                Post::Recv {
                    class: BufferClass::Bulk,
                    len: capacity,
                },
                Step::PutPayloadReceived,
            );
            if let Err(e) = posted {
                warn!(conn = %conn.id(), "PUT payload receive rejected: {}", e);
                ctx.teardown(conn.id());
                return Err(e);
            }
            conn.responder = ResponderState::BulkInFlight {
                kind: CommandType::Put,
                len,
            };
        }
    }
    Ok(())
}

fn reply_written<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    request: &Request,
) -> Result<()> {
    if !request.result.is_success() {
        return responder_failed(ctx, conn, request.result);
    }
    ctx.metrics.add_bulk_bytes_sent(request.len as u64);
    conn.responder = ResponderState::ReplySent {
        kind: CommandType::Get,
        len: request.len,
    };
    ctx.events.push(EngineEvent::GetServed {
        conn: conn.id(),
        len: request.len,
    });
    rearm(ctx, conn)
}

fn put_payload_received<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    request: &Request,
) -> Result<()> {
    if !request.result.is_success() {
        return responder_failed(ctx, conn, request.result);
    }
    if let ResponderState::BulkInFlight { len, .. } = conn.responder {
        if len != request.len {
            debug!(conn = %conn.id(), announced = len, received = request.len, "PUT length differs from command");
        }
    }
    conn.staged_len = request.len;
    ctx.metrics.add_bulk_bytes_received(request.len as u64);
    conn.responder = ResponderState::ReplySent {
        kind: CommandType::Put,
        len: request.len,
    };
    ctx.events.push(EngineEvent::PutReceived {
        conn: conn.id(),
        len: request.len,
    });
    rearm(ctx, conn)
}

fn one_sided_done<P: TransportProvider>(
    ctx: &mut Context<'_, P>,
    conn: &mut Connection,
    request: &Request,
) -> Result<()> {
    let op = match conn.one_sided {
        Some(pending) if pending.id == request.id => pending,
        _ => {
            debug!(conn = %conn.id(), request = %request.id, "stale one-sided completion ignored");
            return Ok(());
        }
    };
    conn.one_sided = None;
    if request.result.is_success() {
        match op.op {
            OpKind::Read => ctx.metrics.add_bulk_bytes_received(request.len as u64),
            _ => ctx.metrics.add_bulk_bytes_sent(request.len as u64),
        }
    }
    ctx.events.push(EngineEvent::OneSidedCompleted {
        conn: conn.id(),
        request: request.id,
        op: op.op,
        len: request.len,
        result: request.result,
    });
    ctx.complete_task(op.task, request.result);
    if request.result.is_success() || request.result == CompletionCode::Cancelled {
        Ok(())
    } else {
        Err(RdmtError::Completion {
            code: request.result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_layout() {
        let cmd = Command {
            kind: CommandType::Put,
            length: 16,
            remote_addr: 0x1000,
        };
        let bytes = cmd.encode();
        assert_eq!(bytes.len(), COMMAND_SIZE);
        assert_eq!(&bytes[0..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &16u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &0x1000u64.to_le_bytes());
        assert_eq!(Command::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_command_unknown_type() {
        let mut raw = Command {
            kind: CommandType::Get,
            length: 1,
            remote_addr: 0,
        }
        .encode()
        .to_vec();
        raw[0] = 7;
        assert!(matches!(
            Command::decode(&raw),
            Err(RdmtError::UnknownCommand(7))
        ));
    }

    #[test]
    fn test_command_short_input() {
        let err = Command::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, RdmtError::InvalidMessage { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }

    #[test]
    fn test_handshake_roundtrip_and_magic() {
        let hs = Handshake::new(RemoteKey(5), RemoteKey(9));
        let bytes = hs.encode();
        assert_eq!(bytes.len(), HANDSHAKE_SIZE);
        assert_eq!(&bytes[0..8], &MAGIC.to_le_bytes());
        assert_eq!(Handshake::decode(&bytes).unwrap(), hs);

        let mut bad = bytes.to_vec();
        bad[0] ^= 0xFF;
        assert!(matches!(
            Handshake::decode(&bad),
            Err(RdmtError::HandshakeMismatch { expected: MAGIC, .. })
        ));
        assert!(Handshake::decode(&[]).is_err());
    }

    #[test]
    fn test_initiator_phases() {
        let mut ex = Exchange {
            id: RequestId(1),
            kind: CommandType::Get,
            len: 16,
            task: None,
            command_done: false,
            bulk_done: false,
            received: 0,
        };
        assert_eq!(InitiatorState::Idle.phase(), InitiatorPhase::Idle);
        assert_eq!(
            InitiatorState::Busy(ex.clone()).phase(),
            InitiatorPhase::CommandSent
        );
        ex.command_done = true;
        assert_eq!(
            InitiatorState::Busy(ex.clone()).phase(),
            InitiatorPhase::AwaitBulk
        );
        ex.bulk_done = true;
        assert_eq!(InitiatorState::Busy(ex).phase(), InitiatorPhase::Done);
    }

    #[test]
    fn test_responder_phases() {
        assert_eq!(ResponderState::Idle.phase(), ResponderPhase::Idle);
        let cmd = Command {
            kind: CommandType::Get,
            length: 0,
            remote_addr: 0,
        };
        assert_eq!(
            ResponderState::CommandReceived(cmd).phase(),
            ResponderPhase::CommandReceived
        );
        assert_eq!(
            ResponderState::BulkInFlight {
                kind: CommandType::Put,
                len: 3
            }
            .phase(),
            ResponderPhase::BulkInFlight
        );
    }
}
