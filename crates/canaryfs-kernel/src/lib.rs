//! CanaryFS kernel: a volatile in-memory filesystem behind an interactive gate.
//!
//! The pieces, bottom-up:
//!
//! - [`store`]: capacity-bounded in-memory tree ([`MemoryStore`])
//! - [`request`]: one [`RequestDescriptor`] per incoming call
//! - [`allowance`]: count- and time-limited grants plus a [`DecisionSource`]
//! - [`audit`]: one record per request, whatever the verdict
//! - [`dispatch`]: the [`Dispatcher`] tying them together and speaking errno
//!
//! Nothing here touches the kernel's FUSE channel; the `canaryfs` binary
//! adapts [`Dispatcher`] to it.

pub mod allowance;
pub mod audit;
pub mod config;
pub mod dispatch;
pub mod request;
pub mod store;

pub use allowance::{AllowanceEngine, Answer, Basis, Decision, DecisionError, DecisionSource, ScriptedSource};
pub use audit::{AuditSink, MemoryAuditSink, Outcome, TracingAuditSink};
pub use config::{CanaryConfig, ConfigError, ScopeMode};
pub use dispatch::{Dispatcher, ProtocolResult, errno_for};
pub use request::{OpKind, RequestDescriptor};
pub use store::{DirEntry, FileAttr, FileType, MemoryStore, StatFs, StoreError, StoreOps};
