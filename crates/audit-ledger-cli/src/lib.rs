//! Operator surface for an audit ledger database.
//!
//! Every command prints one JSON document on stdout; diagnostics go to stderr
//! through `tracing`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use audit_ledger_core::{RequestKey, RequestStatus, TraceResult};
use audit_ledger_store_sqlite::{SqliteLedgerStore, TraceFilter};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "alg")]
#[command(about = "Audit ledger inspection CLI")]
pub struct Cli {
    #[arg(long, global = true, default_value = "./audit_ledger.sqlite3")]
    db: PathBuf,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the schema.
    Migrate,
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    Trace {
        #[command(subcommand)]
        command: TraceCommand,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    Get(KeyArgs),
    List {
        #[arg(long)]
        status: Option<StatusArg>,
    },
}

#[derive(Debug, Args)]
pub struct KeyArgs {
    #[arg(long)]
    request_id: String,
    #[arg(long)]
    orchestrator: String,
}

#[derive(Debug, Subcommand)]
pub enum TraceCommand {
    List(TraceListArgs),
    Show {
        #[arg(long)]
        trace_id: String,
    },
    /// Check every stored trace for completeness.
    Verify {
        #[arg(long)]
        orchestrator: Option<String>,
        /// Exit non-zero when any trace is incomplete.
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Debug, Args)]
pub struct TraceListArgs {
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long)]
    orchestrator: Option<String>,
    #[arg(long)]
    result: Option<ResultArg>,
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    /// Domain rows written outside a completed, traced request.
    StateChanges,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl From<StatusArg> for RequestStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => Self::Pending,
            StatusArg::Processing => Self::Processing,
            StatusArg::Completed => Self::Completed,
            StatusArg::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ResultArg {
    Success,
    Failed,
}

impl From<ResultArg> for TraceResult {
    fn from(value: ResultArg) -> Self {
        match value {
            ResultArg::Success => Self::Success,
            ResultArg::Failed => Self::Failed,
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON output")?
    );
    Ok(())
}

/// Executes the parsed top-level CLI command graph.
///
/// Only `migrate` creates or changes the schema; every other command needs an
/// already migrated database.
///
/// # Errors
/// Returns an error when the database cannot be opened or is not migrated,
/// or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Migrate => run_migrate(&cli.db),
        Command::Ledger { command } => run_ledger(&open_existing(&cli.db)?, command),
        Command::Trace { command } => run_trace(&open_existing(&cli.db)?, command),
        Command::Audit { command } => run_audit(&open_existing(&cli.db)?, &command),
    }
}

fn run_migrate(db: &Path) -> Result<()> {
    let store = SqliteLedgerStore::open(db)?;
    store.migrate()?;
    print_json(&json!({
        "status": "migrated",
        "db": db.display().to_string(),
        "schema_version": store.schema_version()?,
    }))
}

fn open_existing(db: &Path) -> Result<SqliteLedgerStore> {
    if !db.exists() {
        bail!(
            "ledger database {} does not exist; run `alg migrate` first",
            db.display()
        );
    }
    let store = SqliteLedgerStore::open(db)?;
    if !store.is_migrated()? {
        bail!(
            "ledger database {} is not migrated; run `alg migrate` first",
            db.display()
        );
    }
    debug!(db = %db.display(), "opened ledger database");
    Ok(store)
}

fn run_ledger(store: &SqliteLedgerStore, command: LedgerCommand) -> Result<()> {
    match command {
        LedgerCommand::Get(args) => {
            let key = RequestKey::new(args.request_id, args.orchestrator)?;
            let record = store
                .lookup(&key)?
                .ok_or_else(|| anyhow!("ledger record {key} not found"))?;
            print_json(&record)
        }
        LedgerCommand::List { status } => {
            let records = store.list_ledger(status.map(RequestStatus::from))?;
            print_json(&records)
        }
    }
}

fn run_trace(store: &SqliteLedgerStore, command: TraceCommand) -> Result<()> {
    match command {
        TraceCommand::List(args) => {
            let traces = store.list_traces(&TraceFilter {
                request_id: args.request_id,
                orchestrator_name: args.orchestrator,
                result: args.result.map(TraceResult::from),
                limit: args.limit,
            })?;
            print_json(&traces)
        }
        TraceCommand::Show { trace_id } => {
            let trace_id = Ulid::from_string(&trace_id)
                .with_context(|| format!("invalid trace id {trace_id:?}"))?
                .to_string();
            let trace = store
                .get_trace(&trace_id)?
                .ok_or_else(|| anyhow!("trace {trace_id} not found"))?;
            let evidence = store.get_evidence(&trace_id)?;
            print_json(&json!({
                "trace": trace,
                "evidence": evidence,
            }))
        }
        TraceCommand::Verify {
            orchestrator,
            strict,
        } => {
            let report = store.verify_traces(orchestrator.as_deref())?;
            print_json(&report)?;
            if !report.is_clean() {
                warn!(
                    incomplete = report.incomplete.len(),
                    checked = report.checked,
                    "incomplete traces found"
                );
                if strict {
                    bail!("{} incomplete trace(s)", report.incomplete.len());
                }
            }
            Ok(())
        }
    }
}

fn run_audit(store: &SqliteLedgerStore, command: &AuditCommand) -> Result<()> {
    match command {
        AuditCommand::StateChanges => {
            let untraced = store.state_changes_without_traces()?;
            if !untraced.is_empty() {
                warn!(rows = untraced.len(), "domain rows without a traced request");
            }
            print_json(&json!({
                "count": untraced.len(),
                "rows": untraced,
            }))
        }
    }
}
