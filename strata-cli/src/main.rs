//! CLI for the strata metrics rollup engine.
//!
//! Provides commands for inspecting streams, querying rollups, driving one
//! rollup pass, rotating raw logs and appending samples by hand.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use strata::{EngineConfig, MetricStream, RangeQuery, RangeResult, Record, Sample, StreamConfig};
use tracing_subscriber::EnvFilter;

/// strata - Tiered rollups for append-only metrics logs.
#[derive(Parser)]
#[command(name = "strata", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display streams, tiers, file sizes and rollup cursors.
    Info {
        /// Path to the engine configuration file.
        config: PathBuf,
    },

    /// Query rollup records of a stream.
    Query {
        /// Path to the engine configuration file.
        config: PathBuf,

        /// Stream to query.
        stream: String,

        /// Tier to read; chosen from `--hours` when omitted.
        #[arg(long, conflicts_with = "hours")]
        tier: Option<String>,

        /// Hours to look back from now.
        #[arg(long, default_value = "24")]
        hours: f64,

        /// Window start in epoch seconds.
        #[arg(long)]
        start: Option<i64>,

        /// Window end in epoch seconds.
        #[arg(long)]
        end: Option<i64>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Run one rollup pass over every tier.
    Rollup {
        /// Path to the engine configuration file.
        config: PathBuf,

        /// Only process this stream.
        #[arg(long)]
        stream: Option<String>,
    },

    /// Apply raw retention.
    Rotate {
        /// Path to the engine configuration file.
        config: PathBuf,

        /// Only rotate this stream.
        #[arg(long)]
        stream: Option<String>,
    },

    /// Append JSON samples to a stream's raw log.
    Append {
        /// Path to the engine configuration file.
        config: PathBuf,

        /// Stream to append to.
        stream: String,

        /// One JSON object per sample; `timestamp` defaults to now.
        #[arg(required = true)]
        samples: Vec<String>,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// The full query result as JSON.
    Json,
}

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { config } => cmd_info(&config),
        Commands::Query {
            config,
            stream,
            tier,
            hours,
            start,
            end,
            format,
        } => cmd_query(&config, &stream, tier.as_deref(), hours, start, end, &format),
        Commands::Rollup { config, stream } => cmd_rollup(&config, stream.as_deref()),
        Commands::Rotate { config, stream } => cmd_rotate(&config, stream.as_deref()),
        Commands::Append {
            config,
            stream,
            samples,
        } => cmd_append(&config, &stream, &samples),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Streams named by `only`, or every configured stream.
fn selected_streams<'a>(
    config: &'a EngineConfig,
    only: Option<&str>,
) -> CliResult<Vec<&'a StreamConfig>> {
    match only {
        Some(name) => Ok(vec![config.stream(name)?]),
        None => Ok(config.streams.iter().collect()),
    }
}

/// Implements `strata info <config>`.
fn cmd_info(config_path: &Path) -> CliResult {
    let config = EngineConfig::load(config_path)?;
    println!("Config: {}", config_path.display());
    println!("Streams: {}", config.streams.len());

    for stream_config in &config.streams {
        let stream = MetricStream::open(stream_config.clone())?;
        let info = stream.describe();

        println!();
        println!("Stream \"{}\"", info.name);
        println!(
            "  Raw log: {} ({}, retention {})",
            info.raw_path.display(),
            format_bytes(info.raw_size),
            format_duration_secs(info.raw_retention)
        );

        println!("  Tiers: {}", info.tiers.len());
        for tier in &info.tiers {
            let file = match (tier.file_exists, tier.compressed) {
                (true, true) => format!("{} gzip", format_bytes(tier.file_size)),
                (true, false) => format_bytes(tier.file_size),
                (false, _) => "no file".to_string(),
            };
            println!(
                "    {:<8} every {}, kept {} - {} [{file}]",
                tier.name, tier.interval_label, tier.retention_label, tier.label
            );
        }

        match &info.cursors {
            Some(cursors) => {
                println!("  Cursors:");
                for (tier, cursor) in cursors.iter() {
                    println!(
                        "    {tier:<8} last_processed={} last_bucket_end={} last_rollup={}",
                        cursor.last_processed, cursor.last_bucket_end, cursor.last_rollup
                    );
                }
            }
            None => println!("  Cursors: none"),
        }
    }

    Ok(())
}

/// Implements `strata query <config> <stream>`.
fn cmd_query(
    config_path: &Path,
    stream_name: &str,
    tier: Option<&str>,
    hours: f64,
    start: Option<i64>,
    end: Option<i64>,
    format: &OutputFormat,
) -> CliResult {
    let config = EngineConfig::load(config_path)?;
    let stream = MetricStream::open(config.stream(stream_name)?.clone())?;
    let now = strata::unix_now();

    let result = match tier {
        Some(tier) => stream.query_at(tier, &RangeQuery::between(start, end), now),
        None if start.is_none() && end.is_none() => stream.read_best_at(hours, now),
        None => {
            let tier = stream
                .catalog()
                .best_tier_for_range(hours)
                .ok_or("stream has no tiers")?;
            stream.query_at(&tier.name, &RangeQuery::between(start, end), now)
        }
    };

    if !result.success && matches!(format, OutputFormat::Csv) {
        let reason = result.error.as_deref().unwrap_or("query failed");
        return Err(format!("{reason} (tier '{}')", result.tier).into());
    }

    match format {
        OutputFormat::Csv => print!("{}", to_csv(stream_name, &result)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
    }

    Ok(())
}

/// Implements `strata rollup <config>`.
fn cmd_rollup(config_path: &Path, only: Option<&str>) -> CliResult {
    let config = EngineConfig::load(config_path)?;
    let mut failures = 0;

    for stream_config in selected_streams(&config, only)? {
        let stream = MetricStream::open(stream_config.clone())?;
        let Some(aggregator) = stream.aggregator() else {
            tracing::info!(stream = stream.name(), "no aggregate configured, skipping");
            continue;
        };

        for run in stream.process_all(aggregator) {
            match run.outcome {
                Ok(outcome) => println!("{}/{}: {outcome:?}", stream.name(), run.tier),
                Err(e) => {
                    failures += 1;
                    println!("{}/{}: failed: {e}", stream.name(), run.tier);
                }
            }
        }
    }

    if failures > 0 {
        return Err(format!("{failures} tier run(s) failed").into());
    }
    Ok(())
}

/// Implements `strata rotate <config>`.
fn cmd_rotate(config_path: &Path, only: Option<&str>) -> CliResult {
    let config = EngineConfig::load(config_path)?;

    for stream_config in selected_streams(&config, only)? {
        let stream = MetricStream::open(stream_config.clone())?;
        let stats = stream.rotate_raw();
        println!(
            "{}: purged {} line(s), kept {}",
            stream.name(),
            stats.purged,
            stats.kept
        );
    }

    Ok(())
}

/// Implements `strata append <config> <stream> <json>...`.
fn cmd_append(config_path: &Path, stream_name: &str, samples: &[String]) -> CliResult {
    let config = EngineConfig::load(config_path)?;
    let stream = MetricStream::open(config.stream(stream_name)?.clone())?;

    let now = strata::unix_now();
    let samples = samples
        .iter()
        .map(|text| parse_sample(text, now))
        .collect::<CliResult<Vec<_>>>()?;

    stream.raw().try_append(&samples)?;
    println!("{stream_name}: appended {} sample(s)", samples.len());
    Ok(())
}

/// Parses one JSON object into a sample, stamping it with `now` if it has
/// no `timestamp`.
fn parse_sample(text: &str, now: i64) -> CliResult<Sample> {
    let mut value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| format!("sample must be a JSON object: {text}"))?;
    object.entry("timestamp").or_insert_with(|| Value::from(now));
    Ok(serde_json::from_value::<Record>(value)?)
}

/// Renders a query result as CSV with a comment header.
///
/// Columns are `timestamp` followed by every other field in name order.
fn to_csv(stream_name: &str, result: &RangeResult) -> String {
    let columns: BTreeSet<&str> = result
        .data
        .iter()
        .flat_map(|record| record.fields.keys().map(String::as_str))
        .collect();

    let mut out = format!(
        "# stream={stream_name}, tier={}, start={}, end={}, records={}\n",
        result.tier, result.period.start, result.period.end, result.count
    );
    out.push_str("timestamp");
    for column in &columns {
        out.push(',');
        out.push_str(column);
    }
    out.push('\n');

    for record in &result.data {
        out.push_str(&record.timestamp.to_string());
        for column in &columns {
            out.push(',');
            out.push_str(&csv_cell(record.get(column)));
        }
        out.push('\n');
    }
    out
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) if s.contains([',', '"', '\n']) => {
            format!("\"{}\"", s.replace('"', "\"\""))
        }
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: u64) -> String {
    if secs >= 86400 && secs.is_multiple_of(86400) {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata::FieldSummary;
    use tempfile::tempdir;

    fn write_config(dir: &Path) -> PathBuf {
        let mut stream = StreamConfig::new("ping", dir.join("data"));
        stream.aggregate = Some(FieldSummary::new(["latency"]).grouped_by("hostname"));
        let config = EngineConfig {
            streams: vec![stream, StreamConfig::new("system", dir.join("data"))],
        };
        let path = dir.join("strata.json");
        config.save(&path).unwrap();
        path
    }

    #[test]
    fn test_parse_sample_defaults_timestamp() {
        let sample = parse_sample(r#"{"latency": 12.5}"#, 1000).unwrap();
        assert_eq!(sample.timestamp, 1000);
        assert_eq!(sample.get_f64("latency"), Some(12.5));

        let stamped = parse_sample(r#"{"timestamp": 5, "host": "a"}"#, 1000).unwrap();
        assert_eq!(stamped.timestamp, 5);

        assert!(parse_sample("[1, 2]", 1000).is_err());
        assert!(parse_sample("not json", 1000).is_err());
    }

    #[test]
    fn test_csv_columns_and_quoting() {
        let result = RangeResult {
            success: true,
            count: 2,
            data: vec![
                Record::new(60).with("avg_latency", 1.5).with("hostname", "a,b"),
                Record::new(120).with("max_latency", 3.0),
            ],
            tier: "1min".to_string(),
            period: strata::Period { start: 0, end: 120 },
            error: None,
        };

        let csv = to_csv("ping", &result);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "# stream=ping, tier=1min, start=0, end=120, records=2");
        assert_eq!(lines[1], "timestamp,avg_latency,hostname,max_latency");
        assert_eq!(lines[2], "60,1.5,\"a,b\",");
        assert_eq!(lines[3], "120,,,3.0");
    }

    #[test]
    fn test_append_and_rollup_commands() {
        let temp_dir = tempdir().unwrap();
        let config_path = write_config(temp_dir.path());

        let samples = vec![
            r#"{"timestamp": 1000, "latency": 10, "hostname": "gw"}"#.to_string(),
            r#"{"timestamp": 1010, "latency": 20, "hostname": "gw"}"#.to_string(),
        ];
        cmd_append(&config_path, "ping", &samples).unwrap();
        cmd_rollup(&config_path, None).unwrap();

        let config = EngineConfig::load(&config_path).unwrap();
        let stream = MetricStream::open(config.stream("ping").unwrap().clone()).unwrap();
        let result = stream.read_range("1min", Some(0), Some(2000));
        assert_eq!(result.count, 1);
        assert_eq!(result.data[0].get_f64("avg_latency"), Some(15.0));

        // The stream without an aggregate is left alone.
        let system = MetricStream::open(config.stream("system").unwrap().clone()).unwrap();
        assert!(!system.state().path().exists());
    }

    #[test]
    fn test_unknown_stream_is_an_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = write_config(temp_dir.path());
        assert!(cmd_rotate(&config_path, Some("thermal")).is_err());
        assert!(cmd_rotate(&config_path, Some("ping")).is_ok());
    }

    #[test]
    fn test_formatting_helpers() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_duration_secs(86_400), "1d");
        assert_eq!(format_duration_secs(90), "90s");
    }
}
