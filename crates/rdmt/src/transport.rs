//! Transport provider seam.
//!
//! The engine never touches a fabric directly. Everything it needs from the
//! RDMA stack (memory registration, endpoints, posted operations, completion
//! and event queues, the blocking wait) goes through [`TransportProvider`].
//! [`crate::sim`] ships an in-memory implementation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::MemoryRegion;
use crate::error::{CompletionCode, Result};

/// Token granting a peer remote access to a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteKey(pub u64);

/// Provider handle of an active endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointHandle(pub u64);

/// Provider handle of a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CqHandle(pub u64);

/// Opaque token of a pending connection request, consumed by
/// [`TransportProvider::create_endpoint`] or [`TransportProvider::reject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnRequestInfo(pub u64);

/// Access rights for a memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// Local side may send from the region.
    pub const SEND: Self = Self(1);
    /// Local side may receive into the region.
    pub const RECV: Self = Self(2);
    /// Local side may read the region for RMA.
    pub const LOCAL_READ: Self = Self(4);
    /// Local side may write the region as an RMA target.
    pub const LOCAL_WRITE: Self = Self(8);
    /// Peers may read the region.
    pub const REMOTE_READ: Self = Self(16);
    /// Peers may write the region.
    pub const REMOTE_WRITE: Self = Self(32);
    /// Every right.
    pub const ALL: Self = Self(0x3F);

    /// Returns true when every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// No rights.
    pub fn empty() -> Self {
        Self(0)
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Target of a remote read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDescriptor {
    /// Offset within the remote registration.
    pub addr: u64,
    /// Number of bytes.
    pub len: u64,
    /// Remote key of the registration.
    pub key: RemoteKey,
}

/// A bounded window into a registered region.
#[derive(Debug, Clone, Copy)]
pub struct LocalBuffer<'a> {
    /// The registered region.
    pub region: &'a MemoryRegion,
    /// Byte offset into the region.
    pub offset: usize,
    /// Length of the window.
    pub len: usize,
}

/// Kind of a posted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Two-sided send.
    Send,
    /// Posted receive.
    Recv,
    /// One-sided remote read.
    Read,
    /// One-sided remote write.
    Write,
}

/// One entry drained from a completion queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEntry {
    /// The context passed when the operation was posted.
    pub context: u64,
    /// Which kind of operation completed.
    pub op: OpKind,
    /// Bytes transferred.
    pub len: usize,
    /// Remote completion data carried by a write, if any.
    pub data: Option<u64>,
    /// Failure code, `None` on success.
    pub error: Option<CompletionCode>,
}

impl CompletionEntry {
    /// A successful completion.
    pub fn success(context: u64, op: OpKind, len: usize) -> Self {
        Self {
            context,
            op,
            len,
            data: None,
            error: None,
        }
    }

    /// A failed completion.
    pub fn failed(context: u64, op: OpKind, code: CompletionCode) -> Self {
        Self {
            context,
            op,
            len: 0,
            data: None,
            error: Some(code),
        }
    }
}

/// Kind of a connection-management event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmEventKind {
    /// A peer wants to connect (server side).
    ConnRequest,
    /// An endpoint finished connecting.
    Established,
    /// An endpoint was disconnected.
    Shutdown,
}

/// A connection-management event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmEvent {
    /// A connect request with the client's parameter data.
    ConnRequest {
        /// Token for accepting or rejecting.
        info: ConnRequestInfo,
        /// Parameter data passed to `connect`.
        payload: Vec<u8>,
    },
    /// The endpoint is connected; on the client side the payload is the
    /// server's `accept` parameter data.
    Established {
        /// The connected endpoint.
        endpoint: EndpointHandle,
        /// Parameter data passed to `accept` (empty on the server side).
        payload: Vec<u8>,
    },
    /// The endpoint was shut down or its connect attempt was refused.
    Shutdown {
        /// The affected endpoint.
        endpoint: EndpointHandle,
    },
}

impl CmEvent {
    /// The event's kind.
    pub fn kind(&self) -> CmEventKind {
        match self {
            CmEvent::ConnRequest { .. } => CmEventKind::ConnRequest,
            CmEvent::Established { .. } => CmEventKind::Established,
            CmEvent::Shutdown { .. } => CmEventKind::Shutdown,
        }
    }
}

/// What an endpoint is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindTarget {
    /// Data-path completions go to this queue.
    CompletionQueue(CqHandle),
    /// Connection-management events go to the provider's event queue.
    EventQueue,
}

/// Result of the blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// An event or completion is ready.
    Ready,
    /// The timeout elapsed with nothing ready.
    TimedOut,
}

/// The operations the engine requires from an RDMA-capable fabric.
///
/// Every call except [`TransportProvider::wait`] is non-blocking. Posted
/// operations complete later through [`TransportProvider::poll_completion`];
/// a synchronous `Err` means the operation was never issued.
pub trait TransportProvider: Send + Sync {
    /// Registers a region for local and remote access.
    fn register_memory(&self, region: &MemoryRegion, access: AccessFlags) -> Result<RemoteKey>;

    /// Removes a registration.
    fn deregister_memory(&self, key: RemoteKey) -> Result<()>;

    /// Starts accepting connect requests on `addr`.
    fn listen(&self, addr: &str) -> Result<()>;

    /// Creates an endpoint, for a pending connect request on the server side.
    fn create_endpoint(&self, request: Option<ConnRequestInfo>) -> Result<EndpointHandle>;

    /// Opens a completion queue.
    fn open_completion_queue(&self, depth: usize) -> Result<CqHandle>;

    /// Binds an endpoint to a completion queue or the event queue.
    fn bind(&self, endpoint: EndpointHandle, target: BindTarget) -> Result<()>;

    /// Enables a bound endpoint.
    fn enable(&self, endpoint: EndpointHandle) -> Result<()>;

    /// Starts connecting to `addr`, passing `param` to the listener.
    fn connect(&self, endpoint: EndpointHandle, addr: &str, param: &[u8]) -> Result<()>;

    /// Accepts the request the endpoint was created for, passing `param` back.
    fn accept(&self, endpoint: EndpointHandle, param: &[u8]) -> Result<()>;

    /// Refuses a pending connect request.
    fn reject(&self, request: ConnRequestInfo) -> Result<()>;

    /// Posts a send of `local`.
    fn post_send(&self, endpoint: EndpointHandle, local: LocalBuffer<'_>, context: u64)
        -> Result<()>;

    /// Posts a receive into `local`.
    fn post_recv(&self, endpoint: EndpointHandle, local: LocalBuffer<'_>, context: u64)
        -> Result<()>;

    /// Reads `remote` into `local`.
    fn post_read(
        &self,
        endpoint: EndpointHandle,
        local: LocalBuffer<'_>,
        remote: RemoteDescriptor,
        context: u64,
    ) -> Result<()>;

    /// Writes `local` to `remote`. With `remote_data`, the write also consumes
    /// one posted receive at the peer, which completes carrying that value.
    fn post_write(
        &self,
        endpoint: EndpointHandle,
        local: LocalBuffer<'_>,
        remote: RemoteDescriptor,
        remote_data: Option<u64>,
        context: u64,
    ) -> Result<()>;

    /// Pops one completion, if any.
    fn poll_completion(&self, cq: CqHandle) -> Result<Option<CompletionEntry>>;

    /// Pops one connection-management event, if any.
    fn poll_event(&self) -> Result<Option<CmEvent>>;

    /// Closes an endpoint; posted operations on it are discarded.
    fn close_endpoint(&self, endpoint: EndpointHandle) -> Result<()>;

    /// Closes a completion queue.
    fn close_queue(&self, cq: CqHandle) -> Result<()>;

    /// Blocks up to `timeout` for any event or completion.
    fn wait(&self, timeout: Duration) -> Result<WaitOutcome>;
}
