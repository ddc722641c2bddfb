//! Maintenance command implementations.
//!
//! Every command is validated through the procedure parser first, so the
//! CLI rejects exactly what a procedure call would.

use anyhow::Result;
use clap::Args;
use icemaint_core::maintenance::{CompactionResult, ExpirationResult, OrphanResult};
use icemaint_core::procedures::ProcedureCall;
use icemaint_core::{Config, MaintenanceEngine, ProcedureDispatcher};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const MB: u64 = 1024 * 1024;

/// How results are printed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Output {
    /// Print results as JSON
    pub json: bool,
    /// Print Prometheus metrics to stderr afterwards
    pub metrics: bool,
}

impl Output {
    fn finish(&self, engine: &MaintenanceEngine) {
        if self.metrics {
            eprint!("{}", engine.metrics().export_prometheus_text());
        }
    }
}

/// Options shared by the compaction commands.
#[derive(Debug, Args)]
pub struct CompactArgs {
    /// Target output file size in MB
    #[arg(long)]
    target_file_size_mb: Option<u64>,

    /// Maximum input files per rewrite group
    #[arg(long)]
    max_files_per_group: Option<u64>,

    /// Only rewrite partitions matching this filter, e.g. "region = 'us'"
    #[arg(long)]
    filter: Option<String>,
}

impl CompactArgs {
    fn into_params(self, table: &str) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("table".into(), json!(table));
        if let Some(mb) = self.target_file_size_mb {
            params.insert("target_file_size_bytes".into(), json!(mb.saturating_mul(MB)));
        }
        if let Some(max) = self.max_files_per_group {
            params.insert("max_files_per_group".into(), json!(max));
        }
        if let Some(filter) = self.filter {
            params.insert("filter".into(), json!(filter));
        }
        params
    }
}

/// Open the warehouse and cancel in-flight work on SIGINT or SIGTERM.
fn open_engine(config: Config) -> Result<Arc<MaintenanceEngine>> {
    let engine = Arc::new(MaintenanceEngine::open_local(config)?);
    spawn_signal_handler(engine.cancellation_token());
    Ok(engine)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received SIGINT (Ctrl+C), cancelling");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, cancelling");
                        }
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT (Ctrl+C), cancelling");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, cancelling");
        }

        cancel.cancel();
    });
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_paths(title: &str, paths: &[String]) {
    if !paths.is_empty() {
        println!("\n{}:", title);
        for path in paths {
            println!("  - {}", path);
        }
    }
}

fn print_compaction(result: &CompactionResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }

    println!("Compaction completed:");
    println!("  Files rewritten: {}", result.rewritten_files);
    println!("  Files added: {}", result.added_files);
    println!("  Rows rewritten: {}", result.rewritten_rows);
    println!(
        "  Bytes rewritten: {} ({:.2} MB)",
        result.rewritten_bytes,
        result.rewritten_bytes as f64 / MB as f64
    );
    println!("  Groups skipped (concurrent change): {}", result.skipped_groups);
    println!("  Groups failed: {}", result.failed_groups);
    println!("  Commit retries: {}", result.commit_retries);
    if let Some(id) = result.snapshot_id {
        println!("  Snapshot: {}", id);
    }

    print_paths("Added files", &result.added_paths);
    Ok(())
}

fn print_expiration(result: &ExpirationResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }

    if result.dry_run {
        println!("Expiration dry run (nothing committed):");
    } else {
        println!("Expiration completed:");
    }
    println!("  Snapshots expired: {}", result.expired_snapshots);
    println!("  Files deleted: {}", result.deleted_files);
    println!("  Failed deletes: {}", result.failed_deletes);

    if !result.expired_snapshot_ids.is_empty() {
        println!("\nExpired snapshot IDs:");
        for id in &result.expired_snapshot_ids {
            println!("  - {}", id);
        }
    }
    print_paths("Deleted files", &result.deleted_paths);
    print_paths("Failed deletes", &result.failed_paths);
    Ok(())
}

fn print_orphans(result: &OrphanResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }

    if result.dry_run {
        println!("Orphan scan dry run (nothing deleted):");
    } else {
        println!("Orphan cleanup completed:");
    }
    println!("  Orphan files: {}", result.orphan_files);
    println!("  Files deleted: {}", result.deleted_files);
    println!("  Failed deletes: {}", result.failed_deletes);
    println!(
        "  Bytes freed: {} ({:.2} MB)",
        result.bytes_freed,
        result.bytes_freed as f64 / MB as f64
    );

    print_paths("Orphan files", &result.orphan_paths);
    print_paths("Failed deletes", &result.failed_paths);
    if result.paths_truncated {
        println!("\n(path lists truncated; counts above are complete)");
    }
    Ok(())
}

/// Validate a call and run it with full, typed output.
async fn run(config: Config, name: &str, params: Map<String, Value>, out: Output) -> Result<()> {
    let call = ProcedureCall::parse(name, &Value::Object(params))?;
    info!(procedure = call.procedure().name(), table = %call.table(), "Running maintenance");

    let engine = open_engine(config)?;
    let json = out.json;
    let printed = match call {
        ProcedureCall::Compact { table, options } => {
            let result = engine.compact(&table, options).await?;
            print_compaction(&result, json)
        }
        ProcedureCall::SortCompact {
            table,
            sort_keys,
            options,
        } => {
            let result = engine.sort_compact(&table, sort_keys, options).await?;
            print_compaction(&result, json)
        }
        ProcedureCall::ExpireSnapshots { table, options } => {
            let result = engine.expire_snapshots(&table, options).await?;
            print_expiration(&result, json)
        }
        ProcedureCall::RemoveOrphanFiles { table, options } => {
            let result = engine.remove_orphan_files(&table, options).await?;
            print_orphans(&result, json)
        }
    };

    out.finish(&engine);
    printed
}

/// Run bin-pack compaction.
pub async fn compact(config: Config, table: &str, args: CompactArgs, out: Output) -> Result<()> {
    run(config, "compact", args.into_params(table), out).await
}

/// Run sort compaction.
pub async fn sort_compact(
    config: Config,
    table: &str,
    sort_keys: Vec<String>,
    args: CompactArgs,
    out: Output,
) -> Result<()> {
    let mut params = args.into_params(table);
    params.insert("sort_keys".into(), json!(sort_keys));
    run(config, "sort_compact", params, out).await
}

/// Expire old snapshots.
pub async fn expire_snapshots(
    config: Config,
    table: &str,
    max_age_days: Option<u64>,
    min_retain: Option<u64>,
    dry_run: bool,
    out: Output,
) -> Result<()> {
    let mut params = Map::new();
    params.insert("table".into(), json!(table));
    if let Some(days) = max_age_days {
        params.insert("max_age_days".into(), json!(days));
    }
    if let Some(count) = min_retain {
        params.insert("min_retain".into(), json!(count));
    }
    params.insert("dry_run".into(), json!(dry_run));
    run(config, "expire_snapshots", params, out).await
}

/// Clean up orphan files.
pub async fn remove_orphans(
    config: Config,
    table: &str,
    grace_days: Option<u64>,
    dry_run: bool,
    out: Output,
) -> Result<()> {
    let mut params = Map::new();
    params.insert("table".into(), json!(table));
    if let Some(days) = grace_days {
        params.insert("grace_days".into(), json!(days));
    }
    params.insert("dry_run".into(), json!(dry_run));
    run(config, "remove_orphan_files", params, out).await
}

/// Invoke a named procedure and print its counters.
pub async fn call(config: Config, name: &str, params: Value, out: Output) -> Result<()> {
    // Reject bad calls before touching the warehouse
    ProcedureCall::parse(name, &params)?;

    let dispatcher = ProcedureDispatcher::new(open_engine(config)?);
    let stats = dispatcher.call(name, params).await?;
    out.finish(dispatcher.engine());

    if out.json {
        return print_json(&stats);
    }

    println!("{} completed:", name.trim().to_lowercase());
    for (key, value) in stats.iter() {
        println!("  {}: {}", key, value);
    }
    Ok(())
}
