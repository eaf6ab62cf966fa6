//! The allowance engine: decides ALLOW or DENY for every request.
//!
//! ```text
//! decide(request)
//!   ├── ungated op / prompting off ─────────────► ALLOW
//!   ├── session allow-all ──────────────────────► ALLOW
//!   ├── grant covers key (count -1 / in time) ──► ALLOW
//!   └── take prompt turn
//!         ├── grant appeared while waiting ─────► ALLOW
//!         └── ask DecisionSource
//!               ├── Y / ""  ───────────────────► ALLOW
//!               ├── n ─────────────────────────► DENY
//!               ├── Ns / N ──► store grant ────► ALLOW
//!               ├── a ───────► allow-all ──────► ALLOW
//!               └── garbage / timeout / error ─► DENY
//! ```
//!
//! The grant table lock is never held across the prompt, so requests whose
//! key is already granted keep flowing while one request waits on a human.
//! Prompts themselves are serialized by a single async turn lock.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::answer::{ANSWER_HELP, Answer, DecisionError};
use super::grant::{Grant, GrantTable, GrantUse, ScopeKey};
use super::source::DecisionSource;
use crate::config::{CanaryConfig, ScopeMode};
use crate::request::RequestDescriptor;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Basis {
    /// Prompting disabled; audit only.
    LogOnly,
    /// Operation is never gated.
    Ungated,
    /// Session-wide allow-all is in effect.
    SessionAllowAll,
    /// A count grant covered the call.
    CountGrant { remaining: u32 },
    /// A time grant covered the call.
    TimeGrant { left: Duration },
    /// The operator answered.
    Answered(Answer),
    /// No usable answer; treated as deny-once.
    Fallback(DecisionError),
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Basis::LogOnly => write!(f, "log-only"),
            Basis::Ungated => write!(f, "ungated"),
            Basis::SessionAllowAll => write!(f, "allow-all"),
            Basis::CountGrant { remaining } => write!(f, "count-grant({remaining} left)"),
            Basis::TimeGrant { left } => write!(f, "time-grant({}ms left)", left.as_millis()),
            Basis::Answered(answer) => write!(f, "answered {answer}"),
            Basis::Fallback(err) => write!(f, "fallback deny: {err}"),
        }
    }
}

/// ALLOW or DENY, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Basis),
    Deny(Basis),
}

impl Decision {
    /// Returns true for ALLOW.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    /// The reason behind the decision.
    pub fn basis(&self) -> &Basis {
        match self {
            Decision::Allow(basis) | Decision::Deny(basis) => basis,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow(basis) => write!(f, "allow ({basis})"),
            Decision::Deny(basis) => write!(f, "deny ({basis})"),
        }
    }
}

/// Stateful access-control gate in front of the store.
pub struct AllowanceEngine {
    prompting: bool,
    scope: ScopeMode,
    prompt_timeout: Option<Duration>,
    source: Arc<dyn DecisionSource>,
    grants: Mutex<GrantTable>,
    /// Terminal once set.
    allow_all: AtomicBool,
    /// One prompt at a time.
    prompt_turn: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for AllowanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllowanceEngine")
            .field("prompting", &self.prompting)
            .field("scope", &self.scope)
            .field("prompt_timeout", &self.prompt_timeout)
            .field("grants", &self.grants.lock().len())
            .field("allow_all", &self.allow_all.load(Ordering::Acquire))
            .finish()
    }
}

impl AllowanceEngine {
    /// Create an engine configured from the session config.
    pub fn new(config: &CanaryConfig, source: Arc<dyn DecisionSource>) -> Self {
        Self {
            prompting: config.prompting_enabled,
            scope: config.scope_mode,
            prompt_timeout: config.prompt_timeout,
            source,
            grants: Mutex::new(GrantTable::new()),
            allow_all: AtomicBool::new(false),
            prompt_turn: tokio::sync::Mutex::new(()),
        }
    }

    /// Scope mode grants are keyed under.
    pub fn scope_mode(&self) -> ScopeMode {
        self.scope
    }

    /// Returns true once an operator answered `a`.
    pub fn is_session_allow_all(&self) -> bool {
        self.allow_all.load(Ordering::Acquire)
    }

    /// Number of live grants.
    pub fn grant_count(&self) -> usize {
        self.grants.lock().len()
    }

    /// Drop grants keyed to `path` and anything beneath it.
    ///
    /// Called after a successful rename: the old path has ceased to exist, so
    /// its allowances go with it rather than following the node.
    pub fn forget_path(&self, path: &Path) -> usize {
        let removed = self.grants.lock().forget_path(path);
        if removed > 0 {
            tracing::debug!(path = %path.display(), removed, "dropped grants for vanished path");
        }
        removed
    }

    /// Decide one request. May suspend on the decision source.
    ///
    /// Dropping the returned future abandons the prompt; any answer that
    /// would have arrived is discarded.
    pub async fn decide(&self, request: &RequestDescriptor) -> Decision {
        if request.is_ungated() {
            return Decision::Allow(Basis::Ungated);
        }
        if !self.prompting {
            return Decision::Allow(Basis::LogOnly);
        }

        let key = ScopeKey::derive(self.scope, request.op, &request.path);
        if let Some(decision) = self.standing(&key) {
            return decision;
        }

        let _turn = self.prompt_turn.lock().await;

        // Another prompt may have settled this key while we queued. Expiry is
        // judged now, not when the request arrived.
        if let Some(decision) = self.standing(&key) {
            return decision;
        }

        let outcome = self.solicit(request).await;
        self.settle(request, key, outcome)
    }

    /// Decision from existing state alone, if there is one.
    fn standing(&self, key: &ScopeKey) -> Option<Decision> {
        if self.is_session_allow_all() {
            return Some(Decision::Allow(Basis::SessionAllowAll));
        }
        match self.grants.lock().check(key, Instant::now()) {
            GrantUse::Consumed { remaining } => {
                Some(Decision::Allow(Basis::CountGrant { remaining }))
            }
            GrantUse::Active { left } => Some(Decision::Allow(Basis::TimeGrant { left })),
            GrantUse::Expired => {
                tracing::debug!(key = %key, "grant expired");
                None
            }
            GrantUse::Missing => None,
        }
    }

    async fn solicit(&self, request: &RequestDescriptor) -> Result<Answer, DecisionError> {
        let pending = self.source.request(request);
        match self.prompt_timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .unwrap_or(Err(DecisionError::Timeout)),
            None => pending.await,
        }
    }

    fn settle(
        &self,
        request: &RequestDescriptor,
        key: ScopeKey,
        outcome: Result<Answer, DecisionError>,
    ) -> Decision {
        let answer = match outcome {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(seq = request.seq, request = %request, error = %err, "no usable answer, denying");
                return Decision::Deny(Basis::Fallback(err));
            }
        };

        match &answer {
            Answer::AllowOnce | Answer::AllowForCount(0) => {}
            Answer::DenyOnce => {
                self.grants.lock().revoke(&key);
                return Decision::Deny(Basis::Answered(answer));
            }
            Answer::AllowForDuration(lifetime) => {
                let grant = Grant::for_duration(Instant::now(), *lifetime);
                self.grants.lock().insert(key.clone(), grant);
                tracing::info!(key = %key, secs = lifetime.as_secs(), "time grant created");
            }
            Answer::AllowForCount(count) => {
                if let Some(grant) = Grant::count(*count) {
                    self.grants.lock().insert(key.clone(), grant);
                    tracing::info!(key = %key, count, "count grant created");
                }
            }
            Answer::AllowSessionAll => {
                self.allow_all.store(true, Ordering::Release);
                tracing::warn!("session allow-all enabled; no further prompts this session");
            }
            Answer::Invalid(raw) => {
                tracing::warn!(seq = request.seq, request = %request, answer = %raw, "{ANSWER_HELP}");
                return Decision::Deny(Basis::Fallback(DecisionError::MalformedAnswer(
                    raw.clone(),
                )));
            }
        }
        Decision::Allow(Basis::Answered(answer))
    }
}
