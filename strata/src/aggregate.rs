//! Bucket aggregation.
//!
//! The rollup processor groups raw samples into aligned buckets and hands
//! each closed bucket to an [`Aggregator`]. The aggregator decides what the
//! bucket turns into:
//!
//! - [`Aggregate::One`] for a single summary record
//! - [`Aggregate::Many`] to fan out, e.g. one record per remote host
//! - [`Aggregate::Skip`] when the bucket does not hold enough data
//!
//! Any `Fn(&[Sample], i64, i64) -> Aggregate` closure is an aggregator. For
//! the common case of per-field statistics, [`FieldSummary`] is a
//! configurable aggregator that can be loaded from a stream's configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::record::{Record, RollupRecord, Sample};
use crate::stats::{JitterSummary, LatencyStats, Quality, Thresholds, jitter_from_latencies};

/// Sample field holding jitter a collector already computed per sample.
pub const SAMPLE_JITTER_FIELD: &str = "jitter";

/// What a bucket aggregates into.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    /// A single rollup record.
    One(RollupRecord),
    /// Several rollup records for the same bucket.
    Many(Vec<RollupRecord>),
    /// Not enough data; nothing is emitted for this bucket.
    Skip,
}

impl Aggregate {
    /// Flattens the result into the records to append.
    ///
    /// `Many` with no records is equivalent to `Skip`.
    pub fn into_records(self) -> Vec<RollupRecord> {
        match self {
            Self::One(record) => vec![record],
            Self::Many(records) => records,
            Self::Skip => Vec::new(),
        }
    }
}

impl From<RollupRecord> for Aggregate {
    fn from(record: RollupRecord) -> Self {
        Self::One(record)
    }
}

impl From<Option<RollupRecord>> for Aggregate {
    fn from(record: Option<RollupRecord>) -> Self {
        record.map_or(Self::Skip, Self::One)
    }
}

impl From<Vec<RollupRecord>> for Aggregate {
    fn from(records: Vec<RollupRecord>) -> Self {
        if records.is_empty() {
            Self::Skip
        } else {
            Self::Many(records)
        }
    }
}

/// Turns the samples of one closed bucket into rollup records.
pub trait Aggregator {
    /// Aggregates `samples`, all of which fall in
    /// `[bucket_start, bucket_start + interval)`, in timestamp order.
    fn aggregate(&self, samples: &[Sample], bucket_start: i64, interval: i64) -> Aggregate;
}

impl<F> Aggregator for F
where
    F: Fn(&[Sample], i64, i64) -> Aggregate,
{
    fn aggregate(&self, samples: &[Sample], bucket_start: i64, interval: i64) -> Aggregate {
        self(samples, bucket_start, interval)
    }
}

/// Aggregation function applied to the values of one field in a bucket.
///
/// Non-finite values are filtered out before aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationFn {
    /// Arithmetic mean of all finite values.
    #[serde(alias = "avg")]
    Average,

    /// Minimum of all finite values.
    Min,

    /// Maximum of all finite values.
    Max,

    /// Most recent finite value.
    Last,

    /// Sum of all finite values.
    Sum,

    /// Count of finite values.
    Count,

    /// 95th percentile (nearest rank) of all finite values.
    P95,
}

impl ConsolidationFn {
    /// Applies this function to a slice of values.
    ///
    /// Returns NaN if no finite values are present.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use strata::aggregate::ConsolidationFn;
    ///
    /// let values = [1.0, 2.0, f64::NAN, 4.0];
    ///
    /// let avg = ConsolidationFn::Average.apply(&values);
    /// assert!((avg - (7.0 / 3.0)).abs() < 1e-10);
    /// assert_eq!(ConsolidationFn::Min.apply(&values), 1.0);
    /// assert_eq!(ConsolidationFn::Last.apply(&values), 4.0);
    /// assert_eq!(ConsolidationFn::Count.apply(&values), 3.0);
    /// ```
    #[allow(clippy::cast_precision_loss)]
    pub fn apply(self, values: &[f64]) -> f64 {
        let valid: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();

        if valid.is_empty() {
            return f64::NAN;
        }

        match self {
            Self::Average => valid.iter().sum::<f64>() / valid.len() as f64,
            Self::Min => valid.iter().fold(f64::INFINITY, |acc, &v| acc.min(v)),
            Self::Max => valid.iter().fold(f64::NEG_INFINITY, |acc, &v| acc.max(v)),
            Self::Last => valid.last().copied().unwrap_or(f64::NAN),
            Self::Sum => valid.iter().sum(),
            Self::Count => valid.len() as f64,
            Self::P95 => LatencyStats::from_values(&valid, None).map_or(f64::NAN, |s| s.p95),
        }
    }

    /// Prefix used for output field names, e.g. `avg` in `avg_latency`.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Average => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Last => "last",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::P95 => "p95",
        }
    }
}

fn default_functions() -> Vec<ConsolidationFn> {
    vec![
        ConsolidationFn::Average,
        ConsolidationFn::Min,
        ConsolidationFn::Max,
    ]
}

fn default_min_samples() -> usize {
    1
}

/// Per-field statistics over each bucket.
///
/// For every field in `fields` and every function in `functions`, the
/// output record gets `<prefix>_<field>`, e.g. `avg_latency`. Every record
/// also carries `sample_count`, `period_start` and `period_end`. Fields with
/// no numeric values in the bucket are written as `null`.
///
/// With `group_by` set, one record is produced per distinct value of that
/// field, sorted by value, and samples without the field are ignored.
///
/// Network-quality streams can set `jitter_field` to the latency field.
/// Records then carry the RFC 3550 jitter of that field over the bucket as
/// `avg_jitter` and `max_jitter`; with fewer than two latencies, per-sample
/// [`SAMPLE_JITTER_FIELD`] values are summarized instead. `rate_quality`
/// adds `latency_quality`, `jitter_quality`, `packet_loss_pct` (from the
/// success field), `packet_loss_quality` and the worst of them as `quality`.
///
/// # Example
///
/// ```rust
/// use strata::aggregate::{Aggregator, FieldSummary};
/// use strata::record::Record;
///
/// let summary = FieldSummary::new(["latency"]).with_precision(3);
/// let samples = vec![
///     Record::new(1030).with("latency", 12.0),
///     Record::new(1065).with("latency", 14.0),
/// ];
///
/// let records = summary.aggregate(&samples, 1020, 60).into_records();
/// assert_eq!(records[0].get_f64("avg_latency"), Some(13.0));
/// assert_eq!(records[0].get_f64("period_end"), Some(1080.0));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSummary {
    /// Numeric sample fields to summarize.
    pub fields: Vec<String>,

    /// Functions applied to each field.
    #[serde(default = "default_functions")]
    pub functions: Vec<ConsolidationFn>,

    /// Field whose values partition the bucket into one record each.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,

    /// Buckets (or groups) with fewer samples are skipped.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Decimal places to round results to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u8>,

    /// Boolean sample field counted into `success_count` and
    /// `failure_count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_field: Option<String>,

    /// Latency field whose jitter is summarized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_field: Option<String>,

    /// Whether to add quality ratings.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rate_quality: bool,
}

impl FieldSummary {
    /// Summarizes `fields` with average, min and max.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            functions: default_functions(),
            group_by: None,
            min_samples: default_min_samples(),
            precision: None,
            success_field: None,
            jitter_field: None,
            rate_quality: false,
        }
    }

    /// Replaces the functions applied to each field.
    #[must_use]
    pub fn with_functions(mut self, functions: impl IntoIterator<Item = ConsolidationFn>) -> Self {
        self.functions = functions.into_iter().collect();
        self
    }

    /// Produces one record per distinct value of `field`.
    #[must_use]
    pub fn grouped_by(mut self, field: impl Into<String>) -> Self {
        self.group_by = Some(field.into());
        self
    }

    /// Skips buckets with fewer than `min_samples` samples.
    #[must_use]
    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Rounds results to `precision` decimal places.
    #[must_use]
    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Counts successes and failures by the boolean `field`.
    #[must_use]
    pub fn with_success_field(mut self, field: impl Into<String>) -> Self {
        self.success_field = Some(field.into());
        self
    }

    /// Summarizes the jitter of the latency `field`.
    #[must_use]
    pub fn with_jitter(mut self, field: impl Into<String>) -> Self {
        self.jitter_field = Some(field.into());
        self
    }

    /// Adds latency, jitter and packet-loss quality ratings.
    #[must_use]
    pub fn with_quality_ratings(mut self) -> Self {
        self.rate_quality = true;
        self
    }

    fn summarize(&self, samples: &[&Sample], bucket_start: i64, interval: i64) -> Option<Record> {
        if samples.is_empty() || samples.len() < self.min_samples {
            return None;
        }

        let mut record = Record::new(bucket_start)
            .with("period_start", bucket_start)
            .with("period_end", bucket_start.saturating_add(interval))
            .with("sample_count", samples.len());

        for field in &self.fields {
            let values: Vec<f64> = samples.iter().filter_map(|s| s.get_f64(field)).collect();
            for function in &self.functions {
                let key = format!("{}_{field}", function.prefix());
                record.insert(key, self.summary_value(*function, &values));
            }
        }

        if let Some(success_field) = &self.success_field {
            let successes = samples
                .iter()
                .filter(|s| s.get(success_field).is_some_and(is_truthy))
                .count();
            record.insert("success_count", successes);
            record.insert("failure_count", samples.len() - successes);
        }

        if self.jitter_field.is_some() || self.rate_quality {
            self.summarize_quality(samples, &mut record);
        }

        Some(record)
    }

    #[allow(clippy::cast_precision_loss)]
    fn summarize_quality(&self, samples: &[&Sample], record: &mut Record) {
        let mut ratings: Vec<(&str, Quality)> = Vec::new();

        if let Some(field) = &self.jitter_field {
            let latencies: Vec<f64> = samples.iter().filter_map(|s| s.get_f64(field)).collect();
            let jitter = jitter_from_latencies(&latencies).or_else(|| recorded_jitter(samples));
            record.insert("avg_jitter", jitter.map(|j| j.avg));
            record.insert("max_jitter", jitter.map(|j| j.max));

            if let Some(stats) = LatencyStats::from_values(&latencies, None) {
                ratings.push(("latency_quality", Thresholds::LATENCY_MS.rate(stats.avg)));
            }
            if let Some(jitter) = jitter {
                ratings.push(("jitter_quality", Thresholds::JITTER_MS.rate(jitter.avg)));
            }
        }

        if !self.rate_quality {
            return;
        }

        if let Some(success_field) = &self.success_field {
            let failures = samples
                .iter()
                .filter(|s| !s.get(success_field).is_some_and(is_truthy))
                .count();
            let loss = round_to(failures as f64 * 100.0 / samples.len() as f64, 1);
            record.insert("packet_loss_pct", loss);
            ratings.push(("packet_loss_quality", Thresholds::PACKET_LOSS_PCT.rate(loss)));
        }

        for (key, rating) in &ratings {
            record.insert(*key, rating.as_str());
        }
        if !ratings.is_empty() {
            let all: Vec<Quality> = ratings.iter().map(|(_, rating)| *rating).collect();
            record.insert("quality", Quality::overall(&all).as_str());
        }
    }

    fn summary_value(&self, function: ConsolidationFn, values: &[f64]) -> Value {
        if function == ConsolidationFn::Count {
            return Value::from(values.iter().filter(|v| v.is_finite()).count());
        }
        let value = function.apply(values);
        let value = match self.precision {
            Some(places) => round_to(value, places),
            None => value,
        };
        Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

impl Aggregator for FieldSummary {
    fn aggregate(&self, samples: &[Sample], bucket_start: i64, interval: i64) -> Aggregate {
        let Some(key_field) = &self.group_by else {
            let all: Vec<&Sample> = samples.iter().collect();
            return self.summarize(&all, bucket_start, interval).into();
        };

        let mut groups: BTreeMap<String, (Value, Vec<&Sample>)> = BTreeMap::new();
        for sample in samples {
            let Some(key) = sample.get(key_field) else {
                continue;
            };
            if key.is_null() {
                continue;
            }
            groups
                .entry(group_name(key))
                .or_insert_with(|| (key.clone(), Vec::new()))
                .1
                .push(sample);
        }

        groups
            .into_values()
            .filter_map(|(key, members)| {
                self.summarize(&members, bucket_start, interval)
                    .map(|record| record.with(key_field.clone(), key))
            })
            .collect::<Vec<_>>()
            .into()
    }
}

/// Average and peak of jitter values collectors stamped on each sample.
fn recorded_jitter(samples: &[&Sample]) -> Option<JitterSummary> {
    let values: Vec<f64> = samples
        .iter()
        .filter_map(|s| s.get_f64(SAMPLE_JITTER_FIELD))
        .collect();
    let stats = LatencyStats::from_values(&values, Some(2))?;
    Some(JitterSummary {
        avg: stats.avg,
        max: stats.max,
    })
}

fn group_name(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        _ => false,
    }
}

/// Rounds `value` to `places` decimal places.
pub(crate) fn round_to(value: f64, places: u8) -> f64 {
    let factor = 10f64.powi(i32::from(places));
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(ts: i64, host: &str, latency: Option<f64>) -> Sample {
        let record = Record::new(ts).with("hostname", host);
        match latency {
            Some(l) => record.with("latency", l).with("success", true),
            None => record.with("latency", Value::Null).with("success", false),
        }
    }

    #[test]
    fn test_consolidation_functions() {
        let values = [1.0, 2.0, f64::NAN, 4.0, 3.0];

        assert!((ConsolidationFn::Average.apply(&values) - 2.5).abs() < f64::EPSILON);
        assert_eq!(ConsolidationFn::Min.apply(&values), 1.0);
        assert_eq!(ConsolidationFn::Max.apply(&values), 4.0);
        assert_eq!(ConsolidationFn::Last.apply(&values), 3.0);
        assert_eq!(ConsolidationFn::Sum.apply(&values), 10.0);
        assert_eq!(ConsolidationFn::Count.apply(&values), 4.0);

        assert!(ConsolidationFn::Average.apply(&[f64::NAN]).is_nan());
        assert!(ConsolidationFn::Max.apply(&[]).is_nan());
    }

    #[test]
    fn test_function_names_deserialize() {
        let fns: Vec<ConsolidationFn> =
            serde_json::from_str(r#"["average", "avg", "min", "count"]"#).unwrap();
        assert_eq!(
            fns,
            vec![
                ConsolidationFn::Average,
                ConsolidationFn::Average,
                ConsolidationFn::Min,
                ConsolidationFn::Count
            ]
        );
    }

    #[test]
    fn test_p95_function() {
        let values: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(ConsolidationFn::P95.apply(&values), 19.0);
        assert!(ConsolidationFn::P95.apply(&[f64::NAN]).is_nan());
        assert_eq!(ConsolidationFn::P95.prefix(), "p95");

        let fns: Vec<ConsolidationFn> = serde_json::from_str(r#"["p95"]"#).unwrap();
        assert_eq!(fns, vec![ConsolidationFn::P95]);
    }

    #[test]
    fn test_closure_is_aggregator() {
        let count_only = |samples: &[Sample], start: i64, _interval: i64| {
            Aggregate::One(Record::new(start).with("n", samples.len()))
        };
        let samples = vec![Record::new(5), Record::new(7)];
        let records = count_only.aggregate(&samples, 0, 10).into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get_f64("n"), Some(2.0));
    }

    #[test]
    fn test_aggregate_conversions() {
        assert_eq!(Aggregate::from(None::<Record>), Aggregate::Skip);
        assert_eq!(Aggregate::from(Vec::<Record>::new()), Aggregate::Skip);
        assert!(Aggregate::Skip.into_records().is_empty());
        assert_eq!(Aggregate::from(Record::new(1)).into_records().len(), 1);
    }

    #[test]
    fn test_field_summary_single_record() {
        let summary = FieldSummary::new(["latency"])
            .with_precision(3)
            .with_success_field("success");
        let samples = vec![
            ping(1030, "a", Some(12.0)),
            ping(1040, "a", None),
            ping(1065, "a", Some(14.0)),
        ];

        let records = summary.aggregate(&samples, 1020, 60).into_records();
        assert_eq!(records.len(), 1);

        let r = &records[0];
        assert_eq!(r.timestamp, 1020);
        assert_eq!(r.get_f64("avg_latency"), Some(13.0));
        assert_eq!(r.get_f64("min_latency"), Some(12.0));
        assert_eq!(r.get_f64("max_latency"), Some(14.0));
        assert_eq!(r.get_f64("sample_count"), Some(3.0));
        assert_eq!(r.get_f64("success_count"), Some(2.0));
        assert_eq!(r.get_f64("failure_count"), Some(1.0));
        assert_eq!(r.get_f64("period_start"), Some(1020.0));
        assert_eq!(r.get_f64("period_end"), Some(1080.0));
    }

    #[test]
    fn test_field_summary_jitter_and_quality() {
        let summary = FieldSummary::new(["latency"])
            .with_success_field("success")
            .with_jitter("latency")
            .with_quality_ratings();
        let samples = vec![
            ping(0, "a", Some(10.0)),
            ping(10, "a", Some(26.0)),
            ping(20, "a", None),
            ping(30, "a", Some(26.0)),
        ];

        let records = summary.aggregate(&samples, 0, 60).into_records();
        let r = &records[0];
        // D = 16 -> J = 1.0; D = 0 -> J = 0.9375
        assert_eq!(r.get_f64("avg_jitter"), Some(0.97));
        assert_eq!(r.get_f64("max_jitter"), Some(1.0));
        assert_eq!(r.get_f64("packet_loss_pct"), Some(25.0));
        assert_eq!(r.get_str("latency_quality"), Some("good"));
        assert_eq!(r.get_str("jitter_quality"), Some("good"));
        assert_eq!(r.get_str("packet_loss_quality"), Some("critical"));
        assert_eq!(r.get_str("quality"), Some("critical"));
    }

    #[test]
    fn test_jitter_falls_back_to_sample_values() {
        let summary = FieldSummary::new(["latency"]).with_jitter("latency");
        let samples = vec![
            ping(0, "a", Some(10.0)).with(SAMPLE_JITTER_FIELD, 2.0),
            ping(10, "a", None).with(SAMPLE_JITTER_FIELD, 4.0),
        ];

        let records = summary.aggregate(&samples, 0, 60).into_records();
        let r = &records[0];
        assert_eq!(r.get_f64("avg_jitter"), Some(3.0));
        assert_eq!(r.get_f64("max_jitter"), Some(4.0));
        assert!(r.get("quality").is_none());
        assert!(r.get("packet_loss_pct").is_none());

        let none = summary.aggregate(&[ping(0, "a", Some(10.0))], 0, 60).into_records();
        assert_eq!(none[0].get("avg_jitter"), Some(&Value::Null));
    }

    #[test]
    fn test_field_summary_all_failures_yields_nulls() {
        let summary = FieldSummary::new(["latency"]);
        let samples = vec![ping(10, "a", None)];

        let records = summary.aggregate(&samples, 0, 60).into_records();
        assert_eq!(records[0].get("avg_latency"), Some(&Value::Null));
    }

    #[test]
    fn test_field_summary_fans_out_by_group() {
        let summary = FieldSummary::new(["latency"]).grouped_by("hostname");
        let samples = vec![
            ping(1, "router", Some(2.0)),
            ping(2, "dns", Some(20.0)),
            ping(3, "router", Some(4.0)),
            Record::new(4).with("latency", 99.0),
        ];

        let Aggregate::Many(records) = summary.aggregate(&samples, 0, 60) else {
            panic!("expected fan-out");
        };
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get_str("hostname"), Some("dns"));
        assert_eq!(records[0].get_f64("avg_latency"), Some(20.0));
        assert_eq!(records[1].get_str("hostname"), Some("router"));
        assert_eq!(records[1].get_f64("avg_latency"), Some(3.0));
        assert_eq!(records[1].get_f64("sample_count"), Some(2.0));
    }

    #[test]
    fn test_field_summary_min_samples_skips() {
        let summary = FieldSummary::new(["latency"]).with_min_samples(3);
        let samples = vec![ping(1, "a", Some(1.0)), ping(2, "a", Some(2.0))];
        assert_eq!(summary.aggregate(&samples, 0, 60), Aggregate::Skip);
    }

    #[test]
    fn test_field_summary_count_is_integer() {
        let summary =
            FieldSummary::new(["latency"]).with_functions([ConsolidationFn::Count]);
        let samples = vec![ping(1, "a", Some(1.0)), ping(2, "a", None)];
        let records = summary.aggregate(&samples, 0, 60).into_records();
        assert_eq!(records[0].get("count_latency"), Some(&Value::from(1u64)));
    }

    #[test]
    fn test_field_summary_from_json() {
        let summary: FieldSummary =
            serde_json::from_str(r#"{"fields": ["cpu"], "precision": 2}"#).unwrap();
        assert_eq!(summary.functions, default_functions());
        assert_eq!(summary.min_samples, 1);
        assert_eq!(summary.precision, Some(2));
        assert!(summary.jitter_field.is_none());
        assert!(!summary.rate_quality);

        let network: FieldSummary = serde_json::from_str(
            r#"{"fields": ["latency"], "functions": ["avg", "p95"],
                "jitter_field": "latency", "rate_quality": true}"#,
        )
        .unwrap();
        assert_eq!(
            network,
            FieldSummary::new(["latency"])
                .with_functions([ConsolidationFn::Average, ConsolidationFn::P95])
                .with_jitter("latency")
                .with_quality_ratings()
        );
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(12.345_67, 2), 12.35);
        assert_eq!(round_to(12.5, 0), 13.0);
    }
}
