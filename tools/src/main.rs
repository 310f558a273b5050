//! enrich-runner: batch CPF enrichment against the partner consignment API.
//!
//! Usage:
//!   enrich-runner --input cpfs.txt [--config enrich.json] [--db run.db]
//!   enrich-runner --resume [--config enrich.json]
//!   enrich-runner --limits-only [--config enrich.json]
//!   enrich-runner --export [--filter-column limite_total --filter-op '>=' --filter-value 1000]
//!   enrich-runner --purge failures|links|subjects|tokens
//!
//! Input files hold one id per line, optionally followed by `;phone`.
//! Credentials come from the config file or URL_TOKEN, BASE_URL,
//! PARTNER_USER and PARTNER_PASSWORD in the environment. The shell's own
//! USER is never read.

use anyhow::{bail, Context, Result};
use consig_core::{
    config::EnrichConfig,
    engine::EnrichmentEngine,
    store::{EnrichStore, ExportFilter, FilterOp, PurgeTarget},
    types::SubjectInput,
};
use std::env;
use std::io::{self, Write};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let has = |flag: &str| args.iter().any(|a| a == flag);

    let mut config = match flag_value(&args, "--config") {
        Some(path) => EnrichConfig::load(path)?,
        // Store maintenance needs no partner credentials.
        None if has("--purge") || has("--export") => EnrichConfig::default(),
        None => EnrichConfig::from_env()?,
    };
    if let Some(db) = flag_value(&args, "--db") {
        config.db_path = db.to_string();
    }
    config.batch_size = parse_arg(&args, "--batch-size", config.batch_size);
    config.max_workers = parse_arg(&args, "--workers", config.max_workers);

    // For :memory: use a SQLite shared-memory URI so the engine, the token
    // manager and the workers all see one database. Shared-cache tables
    // lock per connection, so only one worker runs.
    let db_effective = if config.db_path == ":memory:" {
        if config.max_workers > 1 {
            log::warn!("In-memory database: running with a single worker");
            config.max_workers = 1;
        }
        format!("file:enrich_{}?mode=memory&cache=shared", chrono_tick())
    } else {
        config.db_path.clone()
    };
    let store = EnrichStore::open(&db_effective)?;
    store.migrate()?;

    if let Some(target) = flag_value(&args, "--purge") {
        let target: PurgeTarget = target.parse()?;
        let deleted = store.purge(target)?;
        println!("Purged {deleted} row(s) ({target:?})");
        return Ok(());
    }
    if has("--export") {
        return export(&store, &args);
    }

    println!("enrich-runner");
    println!("  base url:  {}", config.base_url);
    println!("  db:        {}", config.db_path);
    println!("  batch:     {}", config.batch_size);
    println!("  workers:   {}", config.max_workers);
    println!();

    let engine = EnrichmentEngine::build(&config, store)?;
    let run_id = if has("--resume") {
        engine.resume()?
    } else if has("--limits-only") {
        engine.fetch_pending_limits()?
    } else {
        let Some(path) = flag_value(&args, "--input") else {
            bail!("nothing to do: pass --input <file>, --resume, --limits-only, --export or --purge");
        };
        engine.enrich(read_inputs(path)?)?
    };

    print_summary(engine.store(), &run_id)
}

/// One subject per non-blank line: `cpf` or `cpf;phone`.
fn read_inputs(path: &str) -> Result<Vec<SubjectInput>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Cannot read {path}"))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| match line.split_once(';') {
            Some((cpf, phone)) => SubjectInput::new(cpf.trim()).with_phone(phone.trim()),
            None => SubjectInput::new(line),
        })
        .collect())
}

/// Print limit rows as JSON lines, partner field names merged with the
/// option fields.
fn export(store: &EnrichStore, args: &[String]) -> Result<()> {
    let filter = match flag_value(args, "--filter-column") {
        Some(column) => {
            let op: FilterOp = flag_value(args, "--filter-op").unwrap_or("==").parse()?;
            let value: f64 = flag_value(args, "--filter-value")
                .context("--filter-column needs --filter-value")?
                .parse()
                .context("--filter-value must be a number")?;
            Some(ExportFilter::new(column, op, value)?)
        }
        None => None,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (id, row) in store.export_limit_details(filter.as_ref())? {
        let mut json = row.merged();
        json.insert("id".into(), serde_json::json!(id));
        writeln!(out, "{}", serde_json::Value::Object(json))?;
    }
    out.flush()?;
    Ok(())
}

fn print_summary(store: &EnrichStore, run_id: &str) -> Result<()> {
    println!("=== RUN SUMMARY ===");
    println!("  run_id:          {run_id}");
    println!("  finished:        {}", store.run_finished(run_id)?);
    println!("  subjects:        {}", store.subject_count()?);
    println!("  pending:         {}", store.list_pending_subjects()?.len());
    println!("  links:           {}", store.relationship_link_count()?);
    println!("  awaiting limits: {}", store.list_resolved_relationships()?.len());
    println!("  limit rows:      {}", store.limit_detail_count()?);
    println!("  failure reports: {}", store.failure_report_count()?);
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    flag_value(args, flag)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn chrono_tick() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
