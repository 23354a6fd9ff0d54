mod batch;
mod client;
mod db;
mod error;
mod generators;
mod job;
mod retry;
mod scan;
mod update;
mod workloads;

use std::io::IsTerminal;

use anyhow::{bail, Context};
use serde::Deserialize;
use toml::Table;
use tracing::info;

use client::ClientProperties;
use db::{StdBTreeMapMutex, StdBTreeMapRwLock, DB};
use error::JobError;
use job::{Job, JobReport};
use workloads::Workload;

fn main() -> Result<(), anyhow::Error> {
    init_tracing();

    let args = parse_args(std::env::args().skip(1))?;
    let core_props: CoreProperties = args.clone().try_into().context("invalid core properties")?;
    let client_props =
        ClientProperties::parse(args.clone()).context("invalid client properties")?;

    let report = match &*core_props.workload {
        "sfmta" => run::<workloads::SfmtaWorkload>(core_props, client_props, args)?,
        other => bail!("invalid workload: {}", other),
    };

    info!(
        inserted = report.inserted.rows,
        flushes = report.inserted.flushes,
        scanned = report.scanned,
        updated = report.updated,
        verified = report.verified,
        "DONE"
    );
    for (stage, elapsed) in &report.timings {
        info!("  {:<14} {:.2} s", stage.to_string(), elapsed.as_secs_f64());
    }
    Ok(())
}

fn init_tracing() {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn run<U: Workload>(
    core_props: CoreProperties,
    client_props: ClientProperties,
    props: Table,
) -> Result<JobReport, JobError> {
    match &*core_props.db {
        "std_btreemap_mutex" => {
            run_internal::<StdBTreeMapMutex, U>(core_props, client_props, props)
        }
        "std_btreemap_rwlock" => {
            run_internal::<StdBTreeMapRwLock, U>(core_props, client_props, props)
        }
        other => Err(JobError::Config(format!("invalid db: {}", other))),
    }
}

fn run_internal<T: DB, U: Workload>(
    core_props: CoreProperties,
    client_props: ClientProperties,
    props: Table,
) -> Result<JobReport, JobError> {
    Job::<T, U>::new(core_props, client_props, props)?.run()
}

/// Builds the property table.
///
/// `-P <file>` merges a toml file, `-p key=value` overrides one key, and the
/// positional `startIndex total` pair sets `insertstart` / `recordcount`,
/// taking precedence over both.
fn parse_args<I>(args: I) -> Result<Table, anyhow::Error>
where
    I: IntoIterator<Item = String>,
{
    let mut args: Vec<String> = args.into_iter().collect();
    args.reverse();

    let mut overwrites: Vec<(String, String)> = Vec::new();
    let mut positional: Vec<String> = Vec::new();
    let mut ret = Table::new();

    while let Some(k) = args.pop() {
        match &*k {
            "-P" => {
                let path = args.pop().context("-P requires a file")?;
                let toml_text = std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read property file {}", path))?;
                let tbl = toml_text
                    .parse::<Table>()
                    .with_context(|| format!("invalid property file {}", path))?;
                ret.extend(tbl);
            }
            "-p" => {
                let kv = args.pop().context("-p requires key=value")?;
                let (k, v) = kv
                    .split_once('=')
                    .with_context(|| format!("expected key=value, got {}", kv))?;
                overwrites.push((k.to_string(), v.to_string()));
            }
            other => positional.push(other.to_string()),
        }
    }

    for (k, v) in overwrites {
        ret.insert(k, {
            if let Ok(t0) = v.parse::<i64>() {
                toml::Value::from(t0)
            } else if let Ok(t1) = v.parse::<f64>() {
                toml::Value::from(t1)
            } else if let Ok(t2) = v.to_ascii_lowercase().parse::<bool>() {
                toml::Value::from(t2)
            } else {
                toml::Value::from(v.clone())
            }
        });
    }

    match positional.as_slice() {
        [] => {}
        [start, total] => {
            let start: i64 = start
                .parse()
                .with_context(|| format!("startIndex must be an integer, got {}", start))?;
            let total: i64 = total
                .parse()
                .with_context(|| format!("total must be an integer, got {}", total))?;
            ret.insert("insertstart".to_string(), toml::Value::from(start));
            ret.insert("recordcount".to_string(), toml::Value::from(total));
        }
        other => bail!(
            "expected two positional arguments <startIndex> <total>, got {}",
            other.len()
        ),
    }

    Ok(ret)
}

#[derive(Deserialize, Clone, Debug)]
pub struct CoreProperties {
    #[serde(default = "default_workload")]
    pub workload: String,

    #[serde(default = "default_db")]
    pub db: String,

    /// Per-stage deadline in seconds; 0 disables it.
    #[serde(rename = "maxexecutiontime", default = "default_max_execution_time")]
    pub max_execution_time: u32,

    #[serde(rename = "threadcount", default = "default_thread_count")]
    pub thread_count: u32,
}

fn default_workload() -> String {
    "sfmta".to_string()
}
fn default_db() -> String {
    "std_btreemap_mutex".to_string()
}
fn default_max_execution_time() -> u32 {
    0
}
fn default_thread_count() -> u32 {
    1
}
