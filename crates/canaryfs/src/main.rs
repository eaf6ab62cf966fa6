//! CanaryFS: an audited, interactively gated in-memory filesystem.
//!
//! Usage:
//!   # Prompt for every new (operation, path)
//!   canaryfs --mount /tmp/canary
//!
//!   # Key allowances by path alone, 64 MiB of room
//!   canaryfs --mount /tmp/canary --ask-scope path --capacity 64M
//!
//!   # Audit only, never prompt
//!   canaryfs --mount /tmp/canary --no-ask -v
//!
//! Answers at the prompt: `Y`/Enter (once), `n` (deny), `a` (allow everything
//! for the rest of the session), `30s`/`5m`/`1h` (time grant), `10` (count grant).

mod fuse;
mod prompt;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fuser::MountOption;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use canaryfs_kernel::config::{parse_capacity, parse_scope_mode};
use canaryfs_kernel::{CanaryConfig, Dispatcher, ScopeMode, TracingAuditSink};

use crate::fuse::CanaryFuse;
use crate::prompt::TerminalPrompt;

/// Volatile in-memory FUSE filesystem that asks before it acts.
#[derive(Parser, Debug)]
#[command(name = "canaryfs")]
#[command(about = "Audited, interactively gated in-memory filesystem")]
struct Args {
    /// Mountpoint directory (created if missing)
    #[arg(long)]
    mount: PathBuf,

    /// Prompt before each new operation
    #[arg(long, overrides_with = "no_ask")]
    ask: bool,

    /// Never prompt; audit only
    #[arg(long)]
    no_ask: bool,

    /// Key allowances by operation and path (`op`) or by path alone (`path`)
    #[arg(long, value_parser = parse_scope_mode)]
    ask_scope: Option<ScopeMode>,

    /// Capacity in bytes; K, M and G suffixes accepted [default: 10M]
    #[arg(long, value_parser = parse_capacity)]
    capacity: Option<u64>,

    /// Deny a prompt left unanswered for this many seconds
    #[arg(long)]
    prompt_timeout: Option<u64>,

    /// TOML config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    /// Config file (or defaults) with flags applied on top.
    fn resolve_config(&self) -> Result<CanaryConfig> {
        let mut config = match &self.config {
            Some(path) => CanaryConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => CanaryConfig::default(),
        };

        if self.no_ask {
            config.prompting_enabled = false;
        } else if self.ask {
            config.prompting_enabled = true;
        }
        if let Some(scope) = self.ask_scope {
            config.scope_mode = scope;
        }
        if let Some(capacity) = self.capacity {
            config.capacity_bytes = capacity;
        }
        if let Some(secs) = self.prompt_timeout {
            config.prompt_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout and stdin belong to the operator prompt.
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn prepare_mountpoint(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            bail!("mountpoint {} is not a directory", path.display());
        }
        return Ok(());
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("creating mountpoint {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = args.resolve_config()?;
    prepare_mountpoint(&args.mount)?;

    let dispatcher = Arc::new(Dispatcher::from_config(
        &config,
        Arc::new(TerminalPrompt::stdio()),
        Arc::new(TracingAuditSink),
    ));

    tracing::info!(
        mount = %args.mount.display(),
        capacity = config.capacity_bytes,
        prompting = config.prompting_enabled,
        scope = %config.scope_mode,
        "mounting canaryfs"
    );

    let filesystem = CanaryFuse::new(dispatcher.clone(), tokio::runtime::Handle::current());
    let options = [MountOption::FSName("canaryfs".to_string())];
    let session = fuser::spawn_mount2(filesystem, &args.mount, &options)
        .with_context(|| format!("mounting at {}", args.mount.display()))?;

    eprintln!(
        "[canaryfs] mounted at {} ({} bytes). Ctrl-C to unmount.",
        args.mount.display(),
        config.capacity_bytes
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    tracing::info!(
        used = dispatcher.store().used(),
        grants = dispatcher.allowance().grant_count(),
        "unmounting canaryfs"
    );
    // Joining unmounts; the store and every grant go with the dispatcher.
    session.join();

    // A prompt may still be blocked reading stdin, and runtime shutdown would
    // wait on that read until someone pressed Enter.
    std::process::exit(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("canaryfs").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--mount", "/tmp/c"]).resolve_config().unwrap();
        assert_eq!(config, CanaryConfig::default());
    }

    #[test]
    fn test_flags() {
        let args = parse(&[
            "--mount", "/tmp/c", "--no-ask", "--ask-scope", "path", "--capacity", "2M",
            "--prompt-timeout", "15", "-vv",
        ]);
        assert_eq!(args.verbose, 2);
        let config = args.resolve_config().unwrap();
        assert!(!config.prompting_enabled);
        assert_eq!(config.scope_mode, ScopeMode::Path);
        assert_eq!(config.capacity_bytes, 2 * 1024 * 1024);
        assert_eq!(config.prompt_timeout, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_bad_values_rejected_at_parse() {
        let scope = Args::try_parse_from(["canaryfs", "--mount", "/m", "--ask-scope", "everything"]);
        assert!(scope.is_err());
        let capacity = Args::try_parse_from(["canaryfs", "--mount", "/m", "--capacity", "0"]);
        assert!(capacity.is_err());
        assert!(Args::try_parse_from(["canaryfs"]).is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "capacity = \"1M\"\nprompting = false\nscope = \"path\"").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = parse(&["--mount", "/m", "--config", &path, "--ask"])
            .resolve_config()
            .unwrap();
        assert_eq!(config.capacity_bytes, 1024 * 1024);
        assert_eq!(config.scope_mode, ScopeMode::Path);
        assert!(config.prompting_enabled);
    }

    #[test]
    fn test_mountpoint_must_be_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("mnt");
        prepare_mountpoint(&dir).unwrap();
        assert!(dir.is_dir());

        let file = dir.join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(prepare_mountpoint(&file).is_err());
    }
}
