use std::fmt::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::error::BenchError;
use super::stats::BenchReport;

/// Output format of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Column headers and values.
    #[default]
    Human,
    /// One `ops;avg_lat;avg_jitter;GiB/s` record.
    Csv,
    /// The whole report as a JSON object.
    Json,
}

#[derive(Serialize)]
struct Stamped<'a> {
    timestamp: String,
    #[serde(flatten)]
    report: &'a BenchReport,
}

/// Render `report`. With `verbose`, the human format includes one row per
/// worker.
pub fn render(
    report: &BenchReport,
    format: ReportFormat,
    verbose: bool,
    at: DateTime<Utc>,
) -> Result<String, BenchError> {
    let mut out = String::new();
    match format {
        ReportFormat::Csv => {
            let _ = writeln!(
                out,
                "{};{};{};{:.6}",
                report.ops, report.mean_latency_ns, report.mean_jitter_ns, report.throughput_gibps
            );
        }
        ReportFormat::Json => {
            let stamped = Stamped {
                timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
                report,
            };
            out = serde_json::to_string_pretty(&stamped)
                .map_err(|e| BenchError::Config(e.to_string()))?;
            out.push('\n');
        }
        ReportFormat::Human => {
            let _ = writeln!(
                out,
                "rwbench {} | {} connection(s), {} B messages",
                at.to_rfc3339_opts(SecondsFormat::Secs, true),
                report.workers,
                report.message_size
            );
            if verbose {
                let _ = writeln!(
                    out,
                    "th | ops | time [ns] | avg lat [ns] | avg jitter [ns] | throughput [GiB/s]"
                );
                for row in &report.rows {
                    let _ = write!(
                        out,
                        "{} {} {} {} {} {:.6}",
                        row.index,
                        row.ops,
                        row.elapsed_ns,
                        row.mean_latency_ns,
                        row.mean_jitter_ns,
                        row.throughput_gibps
                    );
                    match &row.error {
                        Some(e) => {
                            let _ = writeln!(out, " ({e})");
                        }
                        None => out.push('\n'),
                    }
                }
            }
            let _ = writeln!(out, "ops | avg lat [ns] | avg jitter [ns] | throughput [GiB/s]");
            let _ = writeln!(
                out,
                "{} {} {} {:.6}",
                report.ops, report.mean_latency_ns, report.mean_jitter_ns, report.throughput_gibps
            );
            if report.failed_workers > 0 {
                let _ = writeln!(out, "{} worker(s) failed", report.failed_workers);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bench::stats::{aggregate, WorkerStats};

    fn report() -> BenchReport {
        let mut s = WorkerStats::new(0);
        s.record(Duration::from_nanos(1500), 128);
        s.record(Duration::from_nanos(2500), 128);
        s.elapsed = Duration::from_secs(1);
        aggregate(&[s], 64)
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn csv_record() {
        let out = render(&report(), ReportFormat::Csv, false, epoch()).unwrap();
        let fields: Vec<&str> = out.trim_end().split(';').collect();
        assert_eq!(fields[..3], ["2", "2000", "1000"]);
        assert!(fields[3].parse::<f64>().unwrap() > 0.0);
    }

    #[test]
    fn human_table() {
        let out = render(&report(), ReportFormat::Human, true, epoch()).unwrap();
        assert!(out.starts_with("rwbench 2023-11-14T22:13:20Z"));
        assert!(out.contains("th | ops"));
        assert!(out.contains("\n2 2000 1000 "));
    }

    #[test]
    fn json_object() {
        let out = render(&report(), ReportFormat::Json, false, epoch()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["ops"], 2);
        assert_eq!(v["timestamp"], "2023-11-14T22:13:20.000Z");
        assert_eq!(v["rows"][0]["bytes"], 256);
    }
}
