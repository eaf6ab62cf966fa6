//! End-to-end tests through the Dispatcher.
//!
//! # Tiers
//!
//! - **Tier 0:** Log-only sessions: store semantics and errno translation
//! - **Tier 1:** Scripted operator: grants, scope modes, allow-all, rename invalidation
//! - **Tier 2:** Live operator over a channel: prompt serialization and concurrency

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustix::io::Errno;
use tokio::sync::{mpsc, oneshot};

use canaryfs_kernel::audit::MemoryAuditSink;
use canaryfs_kernel::{
    AllowanceEngine, Answer, CanaryConfig, DecisionError, DecisionSource, Dispatcher, OpKind, Outcome,
    RequestDescriptor, ScopeMode, ScriptedSource,
};

// ============================================================================
// Shared test setup
// ============================================================================

struct Session {
    fs: Arc<Dispatcher>,
    audit: Arc<MemoryAuditSink>,
}

fn session(config: CanaryConfig, source: Arc<dyn DecisionSource>) -> Session {
    let audit = Arc::new(MemoryAuditSink::new());
    let fs = Arc::new(Dispatcher::from_config(&config, source, audit.clone()));
    Session { fs, audit }
}

fn log_only(capacity: u64) -> Session {
    let config = CanaryConfig {
        capacity_bytes: capacity,
        prompting_enabled: false,
        ..CanaryConfig::default()
    };
    session(config, Arc::new(ScriptedSource::new()))
}

fn gated(scope: ScopeMode, source: Arc<ScriptedSource>) -> Session {
    let config = CanaryConfig {
        scope_mode: scope,
        ..CanaryConfig::default()
    };
    session(config, source)
}

fn p(s: &str) -> &Path {
    Path::new(s)
}

// ============================================================================
// Tier 0: log-only
// ============================================================================

#[tokio::test]
async fn test_capacity_scenario() {
    let s = log_only(1024);
    s.fs.create(p("/f"), 0o644).await.unwrap();

    assert_eq!(s.fs.write(p("/f"), 0, &[7u8; 1024]).await, Ok(1024));
    assert_eq!(s.fs.write(p("/f"), 1024, b"x").await, Err(Errno::NOSPC));
    // Failed write left the file untouched.
    assert_eq!(s.fs.getattr(p("/f")).await.unwrap().size, 1024);

    s.fs.unlink(p("/f")).await.unwrap();
    s.fs.create(p("/f"), 0o644).await.unwrap();
    assert_eq!(s.fs.write(p("/f"), 0, b"x").await, Ok(1));
    assert_eq!(s.fs.store().used(), 1);
}

#[tokio::test]
async fn test_write_read_round_trip_at_offset() {
    let s = log_only(4096);
    s.fs.create(p("/notes"), 0o644).await.unwrap();
    s.fs.write(p("/notes"), 0, b"hello world").await.unwrap();
    s.fs.write(p("/notes"), 6, b"canary").await.unwrap();

    assert_eq!(s.fs.read(p("/notes"), 6, 6).await.unwrap(), b"canary");
    assert_eq!(s.fs.read(p("/notes"), 0, 100).await.unwrap(), b"hello canary");
}

#[tokio::test]
async fn test_errno_translation() {
    let s = log_only(4096);
    s.fs.mkdir(p("/d"), 0o755).await.unwrap();
    s.fs.create(p("/d/f"), 0o644).await.unwrap();

    assert_eq!(s.fs.mkdir(p("/d"), 0o755).await, Err(Errno::EXIST));
    assert_eq!(s.fs.rmdir(p("/d")).await, Err(Errno::NOTEMPTY));
    assert_eq!(s.fs.unlink(p("/d")).await, Err(Errno::ISDIR));
    assert_eq!(s.fs.readdir(p("/d/f")).await, Err(Errno::NOTDIR));
    assert_eq!(s.fs.create(p("/nope/f"), 0o644).await.unwrap_err(), Errno::NOENT);
    assert_eq!(s.fs.rmdir(p("/")).await, Err(Errno::PERM));

    let long = format!("/{}", "n".repeat(300));
    assert_eq!(s.fs.mkdir(Path::new(&long), 0o755).await.unwrap_err(), Errno::NAMETOOLONG);
}

#[tokio::test]
async fn test_log_only_audits_everything() {
    let s = log_only(4096);
    s.fs.mkdir(p("/d"), 0o755).await.unwrap();
    let _ = s.fs.getattr(p("/missing")).await;
    s.fs.readdir(p("/")).await.unwrap();

    let records = s.audit.records();
    let ops: Vec<OpKind> = records.iter().map(|r| r.request.op).collect();
    assert_eq!(ops, vec![OpKind::Mkdir, OpKind::Getattr, OpKind::Readdir]);
    assert!(records[0].outcome.is_completed());
    assert!(matches!(records[1].outcome, Outcome::Failed { .. }));
    assert!(records.windows(2).all(|w| w[0].request.seq < w[1].request.seq));
}

// ============================================================================
// Tier 1: scripted operator
// ============================================================================

#[tokio::test]
async fn test_op_scope_count_scenario() {
    let source = Arc::new(ScriptedSource::from_lines(["y", "10", "y"]));
    let s = gated(ScopeMode::Op, source.clone());
    s.fs.create(p("/x"), 0o644).await.unwrap();
    assert_eq!(source.prompts(), 1);

    // First read prompts and receives "10".
    s.fs.read(p("/x"), 0, 16).await.unwrap();
    assert_eq!(source.prompts(), 2);

    for i in 0..10 {
        s.fs.read(p("/x"), 0, 16).await.unwrap();
        if i == 4 {
            // Different op: prompts even though reads are granted.
            s.fs.write(p("/x"), 0, b"w").await.unwrap();
            assert_eq!(source.prompts(), 3);
        }
    }
    assert_eq!(source.prompts(), 3);

    // Eleventh read prompts again; the script is out, so it is denied.
    assert_eq!(s.fs.read(p("/x"), 0, 16).await, Err(Errno::ACCESS));
    assert_eq!(source.prompts(), 4);
    assert_eq!(source.asked().last().unwrap().op, OpKind::Read);
}

#[tokio::test]
async fn test_denied_call_is_audited_and_store_untouched() {
    let source = Arc::new(ScriptedSource::from_lines(["n"]));
    let s = gated(ScopeMode::Op, source);

    assert_eq!(s.fs.mkdir(p("/d"), 0o755).await, Err(Errno::ACCESS));
    assert_eq!(s.fs.store().getattr(p("/d")).unwrap_err().to_string(), "not found: /d");

    let records = s.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].request.op, OpKind::Mkdir);
    assert!(records[0].outcome.is_denied());
}

#[tokio::test]
async fn test_allow_all_silences_every_later_prompt() {
    let source = Arc::new(ScriptedSource::from_lines(["a"]));
    let s = gated(ScopeMode::Op, source.clone());

    s.fs.mkdir(p("/d"), 0o755).await.unwrap();
    s.fs.create(p("/d/f"), 0o644).await.unwrap();
    s.fs.write(p("/d/f"), 0, b"data").await.unwrap();
    s.fs.rename(p("/d/f"), p("/d/g")).await.unwrap();
    s.fs.unlink(p("/d/g")).await.unwrap();

    assert_eq!(source.prompts(), 1);
    assert!(s.fs.allowance().is_session_allow_all());
}

#[tokio::test]
async fn test_path_scope_shares_grant_across_ops() {
    let source = Arc::new(ScriptedSource::from_lines(["5"]));
    let s = gated(ScopeMode::Path, source.clone());

    s.fs.create(p("/f"), 0o644).await.unwrap();
    s.fs.write(p("/f"), 0, b"abc").await.unwrap();
    s.fs.read(p("/f"), 0, 3).await.unwrap();
    s.fs.getattr(p("/f")).await.unwrap();
    assert_eq!(source.prompts(), 1);

    // Other paths are not covered.
    assert_eq!(s.fs.getattr(p("/")).await, Err(Errno::ACCESS));
    assert_eq!(source.prompts(), 2);
}

#[tokio::test]
async fn test_rename_invalidates_grants_on_old_path() {
    // create, read /a -> 5, rename source, rename destination, read /b.
    let source = Arc::new(ScriptedSource::from_lines(["y", "5", "y", "y", "y"]));
    let s = gated(ScopeMode::Op, source.clone());

    s.fs.create(p("/a"), 0o644).await.unwrap();
    s.fs.read(p("/a"), 0, 1).await.unwrap();
    assert_eq!(s.fs.allowance().grant_count(), 1);

    s.fs.rename(p("/a"), p("/b")).await.unwrap();
    assert_eq!(source.prompts(), 4);
    assert_eq!(s.fs.allowance().grant_count(), 0);

    // Fresh, ungranted request on the new path.
    s.fs.read(p("/b"), 0, 1).await.unwrap();
    assert_eq!(source.prompts(), 5);
    let asked: Vec<PathBuf> = source.asked().into_iter().map(|r| r.path).collect();
    assert_eq!(asked[2], PathBuf::from("/a"));
    assert_eq!(asked[3], PathBuf::from("/b"));
}

#[tokio::test]
async fn test_rename_onto_itself_keeps_grants() {
    // create, read /a -> 5, rename source, rename destination.
    let source = Arc::new(ScriptedSource::from_lines(["y", "5", "y", "y"]));
    let s = gated(ScopeMode::Op, source.clone());

    s.fs.create(p("/a"), 0o644).await.unwrap();
    s.fs.read(p("/a"), 0, 1).await.unwrap();
    s.fs.rename(p("/a"), p("/a")).await.unwrap();
    assert_eq!(source.prompts(), 4);
    assert_eq!(s.fs.allowance().grant_count(), 1);

    s.fs.read(p("/a"), 0, 1).await.unwrap();
    assert_eq!(source.prompts(), 4);
}

#[tokio::test]
async fn test_rename_denied_at_destination() {
    let s = log_only(1024);
    s.fs.create(p("/a"), 0o644).await.unwrap();

    // Same store, now behind an operator who allows the source only.
    let source = Arc::new(ScriptedSource::from_lines(["y", "n"]));
    let engine = Arc::new(AllowanceEngine::new(&CanaryConfig::default(), source.clone()));
    let fs = Dispatcher::new(s.fs.store().clone(), engine, s.audit.clone());

    assert_eq!(fs.rename(p("/a"), p("/b")).await, Err(Errno::ACCESS));
    assert!(fs.store().exists(p("/a")));
    assert!(!fs.store().exists(p("/b")));

    let tail: Vec<_> = s.audit.records().into_iter().rev().take(2).collect();
    assert!(tail.iter().all(|r| r.outcome.is_denied()));
}

#[tokio::test(start_paused = true)]
async fn test_time_grant_through_dispatcher() {
    let source = Arc::new(ScriptedSource::from_lines(["y", "30s"]));
    let s = gated(ScopeMode::Op, source.clone());
    s.fs.create(p("/log"), 0o644).await.unwrap();

    for _ in 0..5 {
        s.fs.write(p("/log"), 0, b"tick").await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
    }
    assert_eq!(source.prompts(), 2);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(s.fs.write(p("/log"), 0, b"tock").await, Err(Errno::ACCESS));
    assert_eq!(source.prompts(), 3);
}

#[tokio::test]
async fn test_statfs_never_prompts() {
    let source = Arc::new(ScriptedSource::new());
    let s = gated(ScopeMode::Op, source.clone());

    let st = s.fs.statfs(p("/")).await.unwrap();
    assert_eq!(st.namelen, 255);
    assert_eq!(source.prompts(), 0);
    assert_eq!(s.audit.len(), 1);
}

// ============================================================================
// Tier 2: live operator
// ============================================================================

type Pending = (RequestDescriptor, oneshot::Sender<Answer>);

/// Forwards every prompt to the test body and waits for its answer.
struct ChannelSource {
    tx: mpsc::UnboundedSender<Pending>,
}

#[async_trait]
impl DecisionSource for ChannelSource {
    async fn request(&self, request: &RequestDescriptor) -> Result<Answer, DecisionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send((request.clone(), reply))
            .map_err(|_| DecisionError::Unavailable("operator gone".into()))?;
        rx.await
            .map_err(|_| DecisionError::Unavailable("operator gone".into()))
    }
}

fn live(scope: ScopeMode) -> (Session, mpsc::UnboundedReceiver<Pending>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = CanaryConfig {
        scope_mode: scope,
        capacity_bytes: 4096,
        ..CanaryConfig::default()
    };
    (session(config, Arc::new(ChannelSource { tx })), rx)
}

async fn settle_tasks() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_granted_keys_flow_while_a_prompt_is_pending() {
    let (s, mut prompts) = live(ScopeMode::Op);

    // Grant getattr broadly.
    let fs = s.fs.clone();
    let first = tokio::spawn(async move { fs.getattr(Path::new("/")).await });
    let (req, reply) = prompts.recv().await.unwrap();
    assert_eq!(req.op, OpKind::Getattr);
    reply.send(Answer::AllowForCount(10)).unwrap();
    first.await.unwrap().unwrap();

    // A mkdir waits on the operator...
    let fs = s.fs.clone();
    let blocked = tokio::spawn(async move { fs.mkdir(Path::new("/d"), 0o755).await });
    let (req, reply) = prompts.recv().await.unwrap();
    assert_eq!(req.op, OpKind::Mkdir);

    // ...while granted getattrs keep completing.
    for _ in 0..3 {
        s.fs.getattr(p("/")).await.unwrap();
    }
    assert!(!blocked.is_finished());

    reply.send(Answer::AllowOnce).unwrap();
    blocked.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_queued_request_sees_grant_from_earlier_prompt() {
    let (s, mut prompts) = live(ScopeMode::Op);

    let a = {
        let fs = s.fs.clone();
        tokio::spawn(async move { fs.readdir(Path::new("/")).await })
    };
    let b = {
        let fs = s.fs.clone();
        tokio::spawn(async move { fs.readdir(Path::new("/")).await })
    };

    let (_, reply) = prompts.recv().await.unwrap();
    settle_tasks().await;
    reply.send(Answer::AllowForCount(5)).unwrap();

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert!(prompts.try_recv().is_err());
}

#[tokio::test]
async fn test_operator_gone_denies() {
    let (s, prompts) = live(ScopeMode::Op);
    drop(prompts);

    assert_eq!(s.fs.getattr(p("/")).await, Err(Errno::ACCESS));
    let record = s.audit.records().pop().unwrap();
    assert!(record.outcome.is_denied());
}
