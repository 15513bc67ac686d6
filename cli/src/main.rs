//! Logsieve CLI
//!
//! Command-line interface for the logsieve query engine.
//!
//! # Usage
//!
//! ```bash
//! logsieve --help
//! logsieve dimensions
//! logsieve query error timeout --filter container=api --limit 100
//! logsieve query --agg count --group-by level --order count(level):desc
//! ```

#![deny(unsafe_code)]

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use shared::jobs::{JobEvent, JobStatus, QueryRequest, Transport};
use shared::models::Record;
use shared::providers::{DimensionFilter, Dimensions};
use shared::query::{AggregateSpec, Direction, OrderRule, Search};
use tokio::net::TcpStream;
use uuid::Uuid;

/// Logsieve CLI - log query engine command-line interface
#[derive(Parser)]
#[command(name = "logsieve")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine server address
    #[arg(
        short,
        long,
        env = "LOGSIEVE_ENGINE_ADDR",
        default_value = "127.0.0.1:7070"
    )]
    addr: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the filterable dimensions of every configured provider
    Dimensions,
    /// Run a query and print its rows
    Query {
        /// Search tokens; a row matches when every token is a substring
        tokens: Vec<String>,

        /// Inclusive lower time bound (RFC 3339, default: one hour ago)
        #[arg(long)]
        from: Option<String>,

        /// Inclusive upper time bound (RFC 3339, default: now)
        #[arg(long)]
        to: Option<String>,

        /// Maximum number of rows
        #[arg(long, default_value_t = 1000)]
        limit: usize,

        /// Dimension filter as name=value; repeatable
        #[arg(long = "filter")]
        filters: Vec<String>,

        /// Aggregate as function[:column[:alias]]; repeatable
        #[arg(long = "agg")]
        aggregates: Vec<String>,

        /// Grouping column for aggregates; repeatable
        #[arg(long = "group-by")]
        group_by: Vec<String>,

        /// Order rule as column[:asc|desc]; repeatable
        #[arg(long = "order")]
        order_by: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct JobStarted {
    job_id: Uuid,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Dimensions) => {
            let transport = connect(&cli.addr).await?;
            list_dimensions(&transport).await
        }
        Some(Commands::Query {
            tokens,
            from,
            to,
            limit,
            filters,
            aggregates,
            group_by,
            order_by,
        }) => {
            let request = build_request(
                &tokens,
                from.as_deref(),
                to.as_deref(),
                limit,
                &filters,
                &aggregates,
                &group_by,
                &order_by,
            )?;
            let transport = connect(&cli.addr).await?;
            run_query(&transport, &request).await
        }
        None => {
            println!("Logsieve CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

async fn connect(addr: &str) -> Result<Transport> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to engine at {addr}"))?;
    Ok(Transport::new(stream))
}

async fn list_dimensions(transport: &Transport) -> Result<()> {
    let reply = transport
        .invoke("list_dimensions", &serde_json::json!({}))
        .await?;
    let dimensions: Dimensions = serde_json::from_slice(&reply)?;

    let mut names: Vec<&String> = dimensions.keys().collect();
    names.sort();
    for name in names {
        let values: Vec<&str> = dimensions[name].iter().map(String::as_str).collect();
        println!("{name}: {}", values.join(", "));
    }
    Ok(())
}

async fn run_query(transport: &Transport, request: &QueryRequest) -> Result<()> {
    let mut events = transport.subscribe();

    let reply = transport
        .invoke("query_run", &serde_json::to_value(request)?)
        .await?;
    let started: JobStarted = serde_json::from_slice(&reply)?;

    let mut cancel_requested = false;
    loop {
        tokio::select! {
            event = events.recv() => match event? {
                JobEvent::Batch { job_id, rows } if job_id == started.job_id => {
                    print_rows(&rows);
                }
                JobEvent::Status { job_id, status } if job_id == started.job_id => match status {
                    JobStatus::Completed => return Ok(()),
                    JobStatus::Canceled => bail!("query was canceled"),
                    JobStatus::Failed => bail!("query failed"),
                    JobStatus::Running => {}
                },
                _ => {}
            },
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                eprintln!("canceling...");
                cancel_requested = true;
                transport
                    .invoke(
                        "query_cancel",
                        &serde_json::json!({ "job_id": started.job_id }),
                    )
                    .await?;
            }
        }
    }
}

fn print_rows(rows: &[Record]) {
    for row in rows {
        if row.message.is_empty() {
            // Derived rows (aggregation output) have no message.
            match serde_json::to_string(&row.columns) {
                Ok(line) => println!("{line}"),
                Err(error) => eprintln!("unprintable row: {error}"),
            }
        } else if let Some(timestamp) = row.timestamp() {
            println!("{} {}", timestamp.to_rfc3339(), row.message);
        } else {
            println!("{}", row.message);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    tokens: &[String],
    from: Option<&str>,
    to: Option<&str>,
    limit: usize,
    filters: &[String],
    aggregates: &[String],
    group_by: &[String],
    order_by: &[String],
) -> Result<QueryRequest> {
    let to = parse_bound(to, Utc::now())?;
    let from = parse_bound(from, to - Duration::hours(1))?;

    Ok(QueryRequest {
        search: Search::literal(tokens.iter().cloned()),
        from,
        to,
        limit,
        filters: filters
            .iter()
            .map(|raw| parse_filter(raw))
            .collect::<Result<_>>()?,
        aggregates: aggregates
            .iter()
            .map(|raw| parse_aggregate(raw))
            .collect::<Result<_>>()?,
        group_by: if group_by.is_empty() {
            None
        } else {
            Some(group_by.to_vec())
        },
        bucket: None,
        order_by: order_by
            .iter()
            .map(|raw| parse_order(raw))
            .collect::<Result<_>>()?,
    })
}

fn parse_bound(raw: Option<&str>, default: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match raw {
        None => Ok(default),
        Some(raw) => Ok(DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("invalid time bound '{raw}'"))?
            .with_timezone(&Utc)),
    }
}

fn parse_filter(raw: &str) -> Result<DimensionFilter> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("invalid filter '{raw}', expected name=value");
    };
    Ok(DimensionFilter::new(name, value))
}

fn parse_aggregate(raw: &str) -> Result<AggregateSpec> {
    let mut parts = raw.splitn(3, ':');
    let function = parts.next().unwrap_or_default();
    if function.is_empty() {
        bail!("invalid aggregate '{raw}', expected function[:column[:alias]]");
    }
    let mut spec = AggregateSpec::new(function, parts.next());
    spec.alias = parts.next().map(ToString::to_string);
    Ok(spec)
}

fn parse_order(raw: &str) -> Result<OrderRule> {
    let (column, direction) = match raw.rsplit_once(':') {
        None => (raw, Direction::Asc),
        Some((column, "asc")) => (column, Direction::Asc),
        Some((column, "desc")) => (column, Direction::Desc),
        Some((_, other)) => bail!("invalid order direction '{other}', expected asc or desc"),
    };
    if column.is_empty() {
        bail!("invalid order rule '{raw}', expected column[:asc|desc]");
    }
    Ok(OrderRule::new(column, direction))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        // Verify CLI can parse without arguments
        let cli = Cli::try_parse_from(["logsieve"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_dimensions_command() {
        let cli = Cli::try_parse_from(["logsieve", "dimensions"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Dimensions)));
    }

    #[test]
    fn test_cli_query_command_with_flags() {
        let cli = Cli::try_parse_from([
            "logsieve", "query", "error", "timeout",
            "--filter", "container=api",
            "--agg", "count",
            "--group-by", "level",
            "--order", "_time:desc",
        ])
        .unwrap();
        let Some(Commands::Query { tokens, filters, .. }) = cli.command else {
            panic!("expected the query subcommand");
        };
        assert_eq!(tokens, vec!["error", "timeout"]);
        assert_eq!(filters, vec!["container=api"]);
    }

    #[test]
    fn test_parse_filter() {
        let filter = parse_filter("container=api").unwrap();
        assert_eq!(filter.name, "container");
        assert_eq!(filter.value, "api");

        assert!(parse_filter("container").is_err());
    }

    #[test]
    fn test_parse_aggregate_variants() {
        let bare = parse_aggregate("count").unwrap();
        assert_eq!(bare.output_name(), "count");

        let with_column = parse_aggregate("sum:bytes").unwrap();
        assert_eq!(with_column.output_name(), "sum(bytes)");

        let with_alias = parse_aggregate("avg:latency:mean_latency").unwrap();
        assert_eq!(with_alias.output_name(), "mean_latency");

        assert!(parse_aggregate("").is_err());
    }

    #[test]
    fn test_parse_order_variants() {
        let implicit = parse_order("_time").unwrap();
        assert_eq!(implicit.column, "_time");
        assert_eq!(implicit.direction, Direction::Asc);

        let explicit = parse_order("count:desc").unwrap();
        assert_eq!(explicit.column, "count");
        assert_eq!(explicit.direction, Direction::Desc);

        assert!(parse_order("count:sideways").is_err());
    }

    #[test]
    fn test_parse_bound_defaults_and_rfc3339() {
        let now = Utc::now();
        assert_eq!(parse_bound(None, now).unwrap(), now);

        let parsed = parse_bound(Some("2026-01-02T03:04:05Z"), now).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-01-02T03:04:05+00:00");

        assert!(parse_bound(Some("yesterday"), now).is_err());
    }
}
