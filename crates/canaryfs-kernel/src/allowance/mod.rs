//! Allowance engine: temporary, expiring grants plus interactive decisions.
//!
//! Per scope key the state machine is:
//!
//! ```text
//! NoGrant ──(answer Ns / N)──► ActiveGrant ──(count hits 0 / deadline passes / n)──► NoGrant
//! ```
//!
//! Answering `a` enters session-wide allow-all, which never ends before unmount.

mod answer;
mod engine;
mod grant;
mod source;

pub use answer::{ANSWER_HELP, Answer, DecisionError};
pub use engine::{AllowanceEngine, Basis, Decision};
pub use grant::{Grant, GrantKind, GrantTable, GrantUse, ScopeKey};
pub use source::{DecisionSource, ScriptedSource};
