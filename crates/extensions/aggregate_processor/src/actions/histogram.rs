use crate::actions::parse_settings;
use crate::actions::BuiltinAction;
use crate::config::ConfigError;
use crate::ActionError;
use crate::AggregateAction;
use crate::AggregateActionInput;
use crate::AggregateActionOutput;
use crate::AggregateActionResponse;
use prepper_api::Event;
use prepper_api::ExpressionEvaluator;
use serde::Deserialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const DEFAULT_GENERATED_KEY_PREFIX: &str = "aggr._";
pub const DEFAULT_METRIC_NAME: &str = "histogram";

/// Lower bound of the first bucket and upper bound of the last one
const BUCKET_LIMIT: f64 = f32::MAX as f64;

/// Distributes the values of a numeric field over buckets, per window
///
/// The `buckets` are the explicit bounds: a value `v` falls in the bucket `i`
/// when `buckets[i-1] <= v < buckets[i]`, with two extra buckets for the values
/// below the first bound and those above the last one.
///
/// The events without a numeric `key` field are ignored.
/// The window time range is given by the `<prefix>startTime` and `<prefix>endTime` fields
/// of the events, when present as RFC 3339 strings, otherwise by the time the events are received.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistogramAggregateAction {
    key: String,

    units: String,

    buckets: Vec<f64>,

    #[serde(default)]
    record_minmax: bool,

    #[serde(default = "default_generated_key_prefix")]
    generated_key_prefix: String,

    #[serde(default = "default_metric_name")]
    metric_name: String,

    #[serde(default)]
    output_format: HistogramOutputFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramOutputFormat {
    /// A histogram metric, following the OpenTelemetry data model
    #[default]
    OtelMetrics,

    /// The identification keys plus the histogram fields, named after the generated key prefix
    Raw,
}

fn default_generated_key_prefix() -> String {
    DEFAULT_GENERATED_KEY_PREFIX.to_string()
}

fn default_metric_name() -> String {
    DEFAULT_METRIC_NAME.to_string()
}

impl Default for HistogramAggregateAction {
    fn default() -> Self {
        HistogramAggregateAction {
            key: String::new(),
            units: String::new(),
            buckets: vec![],
            record_minmax: false,
            generated_key_prefix: default_generated_key_prefix(),
            metric_name: default_metric_name(),
            output_format: HistogramOutputFormat::default(),
        }
    }
}

struct HistogramState {
    count: u64,
    sum: f64,
    min: Exemplar,
    max: Exemplar,
    bucket_counts: Vec<u64>,
    start_time: OffsetDateTime,
    end_time: OffsetDateTime,
}

#[derive(Clone, Copy)]
struct Exemplar {
    time: OffsetDateTime,
    value: f64,
}

impl HistogramAggregateAction {
    pub fn try_new(
        key: impl Into<String>,
        units: impl Into<String>,
        buckets: Vec<f64>,
    ) -> Result<Self, ConfigError> {
        HistogramAggregateAction {
            key: key.into(),
            units: units.into(),
            buckets,
            ..Default::default()
        }
        .validated()
    }

    pub fn with_record_minmax(self, record_minmax: bool) -> Self {
        HistogramAggregateAction {
            record_minmax,
            ..self
        }
    }

    pub fn with_output_format(self, output_format: HistogramOutputFormat) -> Self {
        HistogramAggregateAction {
            output_format,
            ..self
        }
    }

    pub fn with_metric_name(self, metric_name: impl Into<String>) -> Self {
        HistogramAggregateAction {
            metric_name: metric_name.into(),
            ..self
        }
    }

    /// Check the settings, sorting the bucket bounds
    fn validated(mut self) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSettings {
            action: "histogram".to_string(),
            reason: reason.to_string(),
        };
        if self.key.is_empty() {
            return Err(invalid("key must not be empty"));
        }
        if self.buckets.is_empty() {
            return Err(invalid("at least one bucket bound is required"));
        }
        if self.buckets.iter().any(|bound| !bound.is_finite()) {
            return Err(invalid("bucket bounds must be finite numbers"));
        }
        self.buckets.sort_by(f64::total_cmp);
        self.buckets.dedup();
        Ok(self)
    }

    fn generated_key(&self, name: &str) -> String {
        format!("{}{name}", self.generated_key_prefix)
    }

    fn histogram_key(&self) -> String {
        format!("{}_key", self.metric_name)
    }

    fn bucket_index(&self, value: f64) -> usize {
        self.buckets.partition_point(|bound| *bound <= value)
    }

    fn event_time(&self, event: &Event, name: &str, default: OffsetDateTime) -> OffsetDateTime {
        event
            .get(&self.generated_key(name))
            .and_then(Value::as_str)
            .and_then(|time| OffsetDateTime::parse(time, &Rfc3339).ok())
            .unwrap_or(default)
    }

    /// Bounds of the buckets, including the lowest and the highest limits
    fn all_bounds(&self) -> Vec<f64> {
        let mut bounds = Vec::with_capacity(self.buckets.len() + 2);
        bounds.push(-BUCKET_LIMIT);
        bounds.extend(self.buckets.iter().copied());
        bounds.push(BUCKET_LIMIT);
        bounds
    }

    fn raw_event(
        &self,
        mut entries: Map<String, Value>,
        histogram: &HistogramState,
    ) -> Result<Event, ActionError> {
        entries.insert(self.histogram_key(), json!(self.key));
        entries.insert(self.generated_key("count"), json!(histogram.count));
        entries.insert(self.generated_key("sum"), json!(histogram.sum));
        if self.record_minmax {
            entries.insert(self.generated_key("min"), json!(histogram.min.value));
            entries.insert(self.generated_key("max"), json!(histogram.max.value));
        }
        entries.insert(self.generated_key("buckets"), json!(self.all_bounds()));
        entries.insert(self.generated_key("bucket_counts"), json!(histogram.bucket_counts));
        entries.insert(self.generated_key("startTime"), format_time(histogram.start_time)?);
        entries.insert(self.generated_key("endTime"), format_time(histogram.end_time)?);
        entries.insert(self.generated_key("duration"), json!(histogram.duration_nanos()));
        Ok(Event::from_map(entries))
    }

    fn otel_event(
        &self,
        mut attributes: Map<String, Value>,
        histogram: &HistogramState,
    ) -> Result<Event, ActionError> {
        attributes.insert(self.histogram_key(), json!(self.key));
        attributes.insert(self.generated_key("duration"), json!(histogram.duration_nanos()));

        let bounds = self.all_bounds();
        let buckets: Vec<Value> = histogram
            .bucket_counts
            .iter()
            .zip(bounds.windows(2))
            .map(|(count, range)| json!({"min": range[0], "max": range[1], "count": count}))
            .collect();
        let exemplars = [histogram.min, histogram.max]
            .iter()
            .map(|exemplar| {
                Ok(json!({"time": format_time(exemplar.time)?, "value": exemplar.value}))
            })
            .collect::<Result<Vec<Value>, ActionError>>()?;

        let mut metric = json!({
            "kind": "HISTOGRAM",
            "name": self.metric_name,
            "description": format!("Histogram of {} in the events", self.key),
            "unit": self.units,
            "startTime": format_time(histogram.start_time)?,
            "time": format_time(histogram.end_time)?,
            "aggregationTemporality": "AGGREGATION_TEMPORALITY_DELTA",
            "count": histogram.count,
            "sum": histogram.sum,
            "bucketCounts": histogram.bucket_counts.len(),
            "explicitBoundsCount": self.buckets.len(),
            "bucketCountsList": histogram.bucket_counts,
            "explicitBounds": self.buckets,
            "buckets": buckets,
            "exemplars": exemplars,
            "attributes": attributes,
        });
        if self.record_minmax {
            metric["min"] = json!(histogram.min.value);
            metric["max"] = json!(histogram.max.value);
        }
        Ok(Event::try_from(metric)?)
    }
}

impl HistogramState {
    fn duration_nanos(&self) -> i64 {
        let duration = self.end_time - self.start_time;
        i64::try_from(duration.whole_nanoseconds()).unwrap_or(i64::MAX)
    }
}

fn format_time(time: OffsetDateTime) -> Result<Value, ActionError> {
    time.format(&Rfc3339)
        .map(Value::from)
        .map_err(|err| ActionError::Failed(err.to_string()))
}

impl BuiltinAction for HistogramAggregateAction {
    fn name(&self) -> &str {
        "histogram"
    }

    fn set_config(
        &mut self,
        settings: Value,
        _evaluator: &Arc<dyn ExpressionEvaluator>,
    ) -> Result<(), ConfigError> {
        let settings: HistogramAggregateAction = parse_settings(self.name(), settings)?;
        *self = settings.validated()?;
        Ok(())
    }
}

impl AggregateAction for HistogramAggregateAction {
    fn handle_event(
        &self,
        event: &Event,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionResponse, ActionError> {
        let Some(value) = event.get(&self.key).and_then(Value::as_f64) else {
            return Ok(AggregateActionResponse::null_event_response());
        };
        let now = OffsetDateTime::now_utc();
        let start_time = self.event_time(event, "startTime", now);
        let end_time = self.event_time(event, "endTime", now);
        let exemplar = Exemplar {
            time: end_time,
            value,
        };
        let bucket = self.bucket_index(value);

        let histogram = input
            .group_state_mut()
            .extension_or_insert_with(|| HistogramState {
                count: 0,
                sum: 0.0,
                min: exemplar,
                max: exemplar,
                bucket_counts: vec![0; self.buckets.len() + 1],
                start_time,
                end_time,
            });
        histogram.count += 1;
        histogram.sum += value;
        histogram.bucket_counts[bucket] += 1;
        if value < histogram.min.value {
            histogram.min = exemplar;
        }
        if value > histogram.max.value {
            histogram.max = exemplar;
        }
        histogram.start_time = histogram.start_time.min(start_time);
        histogram.end_time = histogram.end_time.max(end_time);

        Ok(AggregateActionResponse::null_event_response())
    }

    fn conclude_group(
        &self,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionOutput, ActionError> {
        let Some(histogram) = input.group_state_mut().remove_extension::<HistogramState>() else {
            return Ok(AggregateActionOutput::default());
        };
        let keys = input.identification_keys().to_map();
        let event = match self.output_format {
            HistogramOutputFormat::Raw => self.raw_event(keys, &histogram)?,
            HistogramOutputFormat::OtelMetrics => self.otel_event(keys, &histogram)?,
        };
        Ok(event.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentificationKeysMap;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use prepper_api::SimpleExpressionEvaluator;
    use std::time::Instant;
    use test_case::test_case;

    fn histogram(format: HistogramOutputFormat) -> HistogramAggregateAction {
        HistogramAggregateAction::try_new("latency", "ms", vec![0.0, 2.0, 4.0])
            .unwrap()
            .with_record_minmax(true)
            .with_output_format(format)
    }

    fn input() -> AggregateActionInput {
        let keys: IdentificationKeysMap = [("service", json!("checkout"))].into_iter().collect();
        AggregateActionInput::new(keys, Instant::now())
    }

    fn handle_values(
        action: &HistogramAggregateAction,
        input: &mut AggregateActionInput,
        values: &[f64],
    ) {
        for value in values {
            let event = Event::try_from(json!({"latency": value, "path": "/cart"})).unwrap();
            let response = action.handle_event(&event, input).unwrap();
            assert_eq!(response.into_event(), None);
        }
    }

    fn conclude(action: &HistogramAggregateAction, input: &mut AggregateActionInput) -> Value {
        let output = action.conclude_group(input).unwrap();
        assert_eq!(output.len(), 1);
        output.events()[0].to_json()
    }

    #[test_case(&[-1.0, 0.5, 3.0, 5.0], &[1, 1, 1, 1], 7.5, -1.0, 5.0 ; "one value per bucket")]
    #[test_case(&[0.0, 2.0, 4.0], &[0, 1, 1, 1], 6.0, 0.0, 4.0 ; "bounds belong to the upper bucket")]
    #[test_case(&[1.0, 1.5, 1.75], &[0, 3, 0, 0], 4.25, 1.0, 1.75 ; "all values in the same bucket")]
    #[test_case(&[-3.5, 7.25], &[1, 0, 0, 1], 3.75, -3.5, 7.25 ; "values out of the explicit bounds")]
    fn raw_histogram(values: &[f64], bucket_counts: &[u64], sum: f64, min: f64, max: f64) {
        let action = histogram(HistogramOutputFormat::Raw);
        let mut input = input();
        handle_values(&action, &mut input, values);

        let event = conclude(&action, &mut input);

        assert_eq!(event["service"], json!("checkout"));
        assert_eq!(event["histogram_key"], json!("latency"));
        assert_eq!(event["aggr._count"], json!(values.len()));
        assert_eq!(event["aggr._sum"], json!(sum));
        assert_eq!(event["aggr._min"], json!(min));
        assert_eq!(event["aggr._max"], json!(max));
        assert_eq!(event["aggr._bucket_counts"], json!(bucket_counts));
        assert_eq!(
            event["aggr._buckets"],
            json!([-BUCKET_LIMIT, 0.0, 2.0, 4.0, BUCKET_LIMIT])
        );
        assert!(event["aggr._startTime"].is_string());
        assert!(event["aggr._endTime"].is_string());
        assert!(event["aggr._duration"].is_i64());
        assert!(event.get("path").is_none());
    }

    #[test_case(&[-1.0, 0.5, 3.0, 5.0], &[1, 1, 1, 1], 7.5, -1.0, 5.0 ; "one value per bucket")]
    #[test_case(&[1.0, 1.5, 1.75], &[0, 3, 0, 0], 4.25, 1.0, 1.75 ; "all values in the same bucket")]
    fn otel_histogram(values: &[f64], bucket_counts: &[u64], sum: f64, min: f64, max: f64) {
        let action = histogram(HistogramOutputFormat::OtelMetrics);
        let mut input = input();
        handle_values(&action, &mut input, values);

        let metric = conclude(&action, &mut input);

        assert_eq!(metric["kind"], json!("HISTOGRAM"));
        assert_eq!(metric["name"], json!(DEFAULT_METRIC_NAME));
        assert_eq!(metric["unit"], json!("ms"));
        assert_eq!(metric["count"], json!(values.len()));
        assert_eq!(metric["sum"], json!(sum));
        assert_eq!(metric["min"], json!(min));
        assert_eq!(metric["max"], json!(max));
        assert_eq!(metric["bucketCounts"], json!(4));
        assert_eq!(metric["explicitBoundsCount"], json!(3));
        assert_eq!(metric["bucketCountsList"], json!(bucket_counts));
        assert_eq!(metric["explicitBounds"], json!([0.0, 2.0, 4.0]));
        assert_eq!(
            metric["buckets"],
            json!([
                {"min": -BUCKET_LIMIT, "max": 0.0, "count": bucket_counts[0]},
                {"min": 0.0, "max": 2.0, "count": bucket_counts[1]},
                {"min": 2.0, "max": 4.0, "count": bucket_counts[2]},
                {"min": 4.0, "max": BUCKET_LIMIT, "count": bucket_counts[3]},
            ])
        );
        assert_eq!(metric["attributes"]["service"], json!("checkout"));
        assert_eq!(metric["attributes"]["histogram_key"], json!("latency"));
        assert!(metric["attributes"]["aggr._duration"].is_i64());
        assert_eq!(metric["exemplars"].as_array().map(Vec::len), Some(2));
        assert_eq!(metric["exemplars"][0]["value"], json!(min));
        assert_eq!(metric["exemplars"][1]["value"], json!(max));
        assert!(metric["startTime"].is_string());
        assert!(metric["time"].is_string());
    }

    #[test]
    fn time_range_is_taken_from_the_events() {
        let action = histogram(HistogramOutputFormat::OtelMetrics).with_metric_name("latency_ms");
        let mut input = input();
        let events = [
            json!({"latency": 1.0, "aggr._startTime": "2024-05-01T10:00:05Z", "aggr._endTime": "2024-05-01T10:00:05Z"}),
            json!({"latency": 3.0, "aggr._startTime": "2024-05-01T10:00:00Z", "aggr._endTime": "2024-05-01T10:01:40Z"}),
            json!({"latency": 2.0, "aggr._startTime": "2024-05-01T10:00:03Z", "aggr._endTime": "2024-05-01T10:00:50Z"}),
        ];
        for event in events {
            action
                .handle_event(&Event::try_from(event).unwrap(), &mut input)
                .unwrap();
        }

        let metric = conclude(&action, &mut input);

        assert_eq!(metric["name"], json!("latency_ms"));
        assert_eq!(metric["startTime"], json!("2024-05-01T10:00:00Z"));
        assert_eq!(metric["time"], json!("2024-05-01T10:01:40Z"));
        assert_eq!(metric["attributes"]["latency_ms_key"], json!("latency"));
        assert_eq!(metric["attributes"]["aggr._duration"], json!(100_000_000_000i64));
    }

    #[test]
    fn events_without_a_numeric_value_are_ignored() {
        let action = histogram(HistogramOutputFormat::Raw);
        let mut input = input();
        for event in [json!({"path": "/cart"}), json!({"latency": "slow"})] {
            let response = action
                .handle_event(&Event::try_from(event).unwrap(), &mut input)
                .unwrap();
            assert_eq!(response.into_event(), None);
        }

        assert!(action.conclude_group(&mut input).unwrap().is_empty());
    }

    #[test]
    fn idle_windows_emit_nothing() {
        let action = histogram(HistogramOutputFormat::OtelMetrics);
        assert!(action.conclude_group(&mut input()).unwrap().is_empty());
    }

    #[test]
    fn windows_are_restarted_after_conclusion() {
        let action = histogram(HistogramOutputFormat::Raw);
        let mut input = input();
        handle_values(&action, &mut input, &[1.0, 3.0]);
        conclude(&action, &mut input);

        handle_values(&action, &mut input, &[5.0]);
        let event = conclude(&action, &mut input);

        assert_eq!(event["aggr._count"], json!(1));
        assert_eq!(event["aggr._bucket_counts"], json!([0, 0, 0, 1]));
    }

    #[test]
    fn settings_are_read_and_checked() {
        let evaluator: Arc<dyn ExpressionEvaluator> = Arc::new(SimpleExpressionEvaluator::new());
        let mut action = HistogramAggregateAction::default();
        action
            .set_config(
                json!({
                    "key": "bytes",
                    "units": "B",
                    "buckets": [1000, 10, 100],
                    "generated_key_prefix": "h_",
                    "output_format": "raw"
                }),
                &evaluator,
            )
            .unwrap();
        let mut input = input();
        let event = Event::try_from(json!({"bytes": 50})).unwrap();
        action.handle_event(&event, &mut input).unwrap();

        let event = conclude(&action, &mut input);
        assert_eq!(event["h_bucket_counts"], json!([0, 1, 0, 0]));
        assert!(event.get("h_min").is_none());

        for settings in [
            json!({"units": "B", "buckets": [1]}),
            json!({"key": "bytes", "units": "B", "buckets": []}),
            json!({"key": "bytes", "units": "B", "buckets": [1], "bucket": [2]}),
            json!({"key": "bytes", "units": "B", "buckets": [1], "output_format": "csv"}),
        ] {
            assert_matches!(
                HistogramAggregateAction::default().set_config(settings, &evaluator),
                Err(ConfigError::InvalidSettings { action, .. }) if action == "histogram"
            );
        }
    }
}
