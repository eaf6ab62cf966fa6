//! Grant table: temporary allowances keyed by scope.
//!
//! # Grant Matching
//!
//! Keys are exact: no prefix, wildcard or subtree matching. A key holds at
//! most one grant; a new decision for the key replaces the old one.
//!
//! | Kind | Behavior |
//! |------|----------|
//! | Count | Each match consumes one unit; removed when it reaches zero |
//! | Until | Matches while `now <= deadline`; removed on the first late check |

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ScopeMode;
use crate::request::OpKind;
use crate::store::path::is_within;

/// Grant table key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    /// `None` in path scope: any operation on the path.
    pub op: Option<OpKind>,
    /// Exact normalized path.
    pub path: PathBuf,
}

impl ScopeKey {
    /// Derive the key for `op` on `path` under the session's scope mode.
    pub fn derive(mode: ScopeMode, op: OpKind, path: &Path) -> Self {
        let op = match mode {
            ScopeMode::Op => Some(op),
            ScopeMode::Path => None,
        };
        Self {
            op,
            path: path.to_path_buf(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Some(op) => write!(f, "{} {}", op, self.path.display()),
            None => write!(f, "* {}", self.path.display()),
        }
    }
}

/// Longest time grant stored; about thirty years.
pub const MAX_GRANT_LIFETIME: Duration = Duration::from_secs(86_400 * 365 * 30);

/// How a grant is limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    /// Remaining matching calls. Always > 0 while stored.
    Count { remaining: u32 },
    /// Last instant at which a matching call is allowed.
    Until { deadline: Instant },
}

/// A temporary allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub kind: GrantKind,
}

impl Grant {
    /// Grant `count` further matching calls. `None` for a zero count.
    pub fn count(count: u32) -> Option<Self> {
        (count > 0).then_some(Self {
            kind: GrantKind::Count { remaining: count },
        })
    }

    /// Grant matching calls until `lifetime` has elapsed from `now`.
    ///
    /// Lifetimes past [`MAX_GRANT_LIFETIME`] are clamped to it.
    pub fn for_duration(now: Instant, lifetime: Duration) -> Self {
        let lifetime = lifetime.min(MAX_GRANT_LIFETIME);
        let deadline = now.checked_add(lifetime).unwrap_or(now);
        Self {
            kind: GrantKind::Until { deadline },
        }
    }
}

/// Result of checking a key against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantUse {
    /// A count grant covered the call; `remaining` units are left.
    Consumed { remaining: u32 },
    /// A time grant covered the call.
    Active { left: Duration },
    /// A time grant had lapsed and was removed.
    Expired,
    /// No grant for the key.
    Missing,
}

/// Zero-or-one grant per scope key.
#[derive(Debug, Default)]
pub struct GrantTable {
    grants: HashMap<ScopeKey, Grant>,
}

impl GrantTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `key` at instant `now`, consuming a count unit if one covers it.
    ///
    /// Check, decrement and removal happen under one `&mut` borrow, so a
    /// count grant can never be consumed past zero.
    pub fn check(&mut self, key: &ScopeKey, now: Instant) -> GrantUse {
        let Some(grant) = self.grants.get_mut(key) else {
            return GrantUse::Missing;
        };
        match &mut grant.kind {
            GrantKind::Count { remaining } => {
                *remaining = remaining.saturating_sub(1);
                let left = *remaining;
                if left == 0 {
                    self.grants.remove(key);
                }
                GrantUse::Consumed { remaining: left }
            }
            GrantKind::Until { deadline } => {
                if now <= *deadline {
                    GrantUse::Active {
                        left: deadline.saturating_duration_since(now),
                    }
                } else {
                    self.grants.remove(key);
                    GrantUse::Expired
                }
            }
        }
    }

    /// Store `grant` for `key`, replacing any previous one.
    pub fn insert(&mut self, key: ScopeKey, grant: Grant) -> Option<Grant> {
        self.grants.insert(key, grant)
    }

    /// Remove the grant for `key`.
    pub fn revoke(&mut self, key: &ScopeKey) -> Option<Grant> {
        self.grants.remove(key)
    }

    /// Remove grants keyed to `path` or anything beneath it.
    ///
    /// Returns how many were removed.
    pub fn forget_path(&mut self, path: &Path) -> usize {
        let before = self.grants.len();
        self.grants.retain(|key, _| !is_within(&key.path, path));
        before - self.grants.len()
    }

    /// Number of stored grants.
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// Returns true if no grants are stored.
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
