//! rdmavan - RDMA point-to-point transport for parameter-server push/pull
//! traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                              Van                                   │
//! │  ┌──────────┐ ┌──────────┐ ┌───────────┐ ┌──────────────────────┐  │
//! │  │ CM event │ │    CQ    │ │  Address  │ │ Endpoint table       │  │
//! │  │  poller  │ │  poller  │ │   pool    │ │ node id -> Endpoint  │  │
//! │  └──────────┘ └──────────┘ └───────────┘ └──────────────────────┘  │
//! │        │            │                                              │
//! │        │            └── recv hand-off queue ──► recv_msg()         │
//! └────────┼───────────────────────────────────────────────────────────┘
//!          ▼
//!    ┌──────────┐  ┌──────────┐  ┌──────────┐
//!    │ Endpoint │  │ Endpoint │  │ Endpoint │       one RC QP per peer
//!    │ RDMA/IPC │  │ RDMA/IPC │  │ RDMA/IPC │       transport per endpoint
//!    └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! The first message of a (key, direction) pair runs a two-sided rendezvous
//! that trades the receiver's landing address for the sender's buffer
//! descriptor; every later message is one signaled RDMA_WRITE_WITH_IMM (plus
//! one unsignaled value write for push requests), so steady state costs a
//! single completion per message on each side. Peers on the same host can
//! move values through POSIX shared memory instead, keeping only metadata on
//! the NIC.

pub mod addrpool;
pub mod config;
pub mod encoding;
pub mod endpoint;
pub mod error;
pub mod ipc;
pub mod mempool;
pub mod message;
pub mod transport;
pub mod van;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{Command, Control, Message, Meta, Node, Role, Segment};
pub use van::Van;

/// Outstanding rendezvous-start sends per endpoint.
pub const START_DEPTH: usize = 128;
/// Outstanding rendezvous-reply sends per endpoint.
pub const REPLY_DEPTH: usize = 256;
/// Outstanding signaled writes per endpoint.
pub const WRITE_DEPTH: usize = 128;
/// Posted receives per endpoint.
pub const RX_DEPTH: usize = 256;
/// Scatter-gather entries per work request.
pub const SG_ENTRIES: usize = 4;
/// Completion batch size; also sizes the CQ (x2).
pub const MAX_CONCURRENT_WR: usize = START_DEPTH + REPLY_DEPTH + WRITE_DEPTH + RX_DEPTH;

/// Size of the registered chunk behind every work-request context. Each
/// posted receive lands at most one rendezvous pod here.
pub const MEMPOOL_CHUNK_SIZE: usize = 512;
/// Headroom reserved in front of a landing area for the packed metadata
/// segment; the value segment starts on the next page boundary.
pub const MAX_META_BOUND: usize = 4096;

/// Immediate tag of a rendezvous-start send.
pub const IMM_RENDEZVOUS_START: u32 = 0;
/// Immediate tag of a rendezvous-reply send.
pub const IMM_RENDEZVOUS_REPLY: u32 = 1;

// A receive chunk must be able to hold either rendezvous pod.
const _: () = assert!(MEMPOOL_CHUNK_SIZE >= encoding::RENDEZVOUS_START_SIZE);
const _: () = assert!(MEMPOOL_CHUNK_SIZE >= encoding::RENDEZVOUS_REPLY_SIZE);
