#![warn(missing_docs)]

//! RDMT: an RDMA request/response engine.
//!
//! One [`Engine`] per node owns a pool of pre-registered buffers, a set of
//! connections and the table of in-flight requests. The event loop waits on
//! the provider, dispatches polled completions to request continuations and
//! drives the GET/PUT command protocol. Related requests can be grouped into
//! tasks whose callback fires once every member has completed.
//!
//! The network itself sits behind [`TransportProvider`]; [`sim::SimFabric`]
//! is an in-process implementation used by the tests and the demo binary.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod request;
pub mod sim;
pub mod task;
pub mod transport;

pub use buffer::{BufferClass, BufferPool, BufferPoolConfig, BufferPoolStats, BufferSlot, MemoryRegion};
pub use config::RdmtConfig;
pub use connection::{ConnId, ConnState, Connection, ConnectionManager, Role};
pub use engine::{Engine, EngineEvent, LoopOutcome};
pub use error::{CompletionCode, ErrorKind, RdmtError, Result};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use protocol::{Command, CommandType, Handshake, InitiatorPhase, ResponderPhase};
pub use request::RequestId;
pub use sim::{FabricStats, SimFabric, SimNode};
pub use task::{TaskCallback, TaskContext, TaskId, TaskOutcome, TaskStatus};
pub use transport::{AccessFlags, CompletionEntry, OpKind, RemoteKey, TransportProvider};
