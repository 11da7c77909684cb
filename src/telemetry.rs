use crate::error::PayloadError;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub type SensorId = i32;
pub type BindingId = i32;

const DATA_SUFFIX: &str = "data";
const HEARTBEAT_SUFFIX: &str = "heartbeat";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Data,
    Heartbeat,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SensorTopic<'a> {
    pub sensor: &'a str,
    pub kind: MessageKind,
}

/// Splits `<prefix>/<sensor>/<data|heartbeat>`; every other shape is rejected.
/// The prefix may itself span several levels (`lab/sensors`).
pub fn parse_topic<'a>(topic_prefix: &str, topic: &'a str) -> Option<SensorTopic<'a>> {
    let rest = topic.strip_prefix(topic_prefix)?.strip_prefix('/')?;
    let (sensor, suffix) = rest.split_once('/')?;
    if sensor.trim().is_empty() {
        return None;
    }
    let kind = match suffix {
        DATA_SUFFIX => MessageKind::Data,
        HEARTBEAT_SUFFIX => MessageKind::Heartbeat,
        _ => return None,
    };
    Some(SensorTopic { sensor, kind })
}

pub fn topic_filters(topic_prefix: &str) -> [String; 2] {
    [
        format!("{topic_prefix}/+/{DATA_SUFFIX}"),
        format!("{topic_prefix}/+/{HEARTBEAT_SUFFIX}"),
    ]
}

/// One flattened sample, ready for `timeseries.measurements`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRow {
    pub timestamp: DateTime<Utc>,
    pub binding_id: BindingId,
    pub channel: Arc<str>,
    pub value: f64,
    /// Originating sensor name; only used for dead letters.
    pub sensor: Arc<str>,
}

impl MeasurementRow {
    pub fn dead_letter_payload(&self) -> String {
        json!({
            "timestamp": self.timestamp.timestamp_millis(),
            "binding_id": self.binding_id,
            "channel": self.channel.as_ref(),
            "value": self.value,
        })
        .to_string()
    }
}

#[derive(Debug, Deserialize)]
struct WireBatch {
    timestamps: Vec<f64>,
    channels: Vec<String>,
    values: Vec<Vec<f64>>,
}

/// A shape-checked data message: `values[i][j]` belongs to `timestamps[i]` and `channels[j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBatch {
    pub timestamps: Vec<DateTime<Utc>>,
    pub channels: Vec<Arc<str>>,
    pub values: Vec<Vec<f64>>,
}

impl DataBatch {
    pub fn sample_count(&self) -> usize {
        self.timestamps.len() * self.channels.len()
    }

    pub fn flatten(&self, sensor: &Arc<str>, binding_id: BindingId) -> Vec<MeasurementRow> {
        let mut rows = Vec::with_capacity(self.sample_count());
        for (timestamp, values) in self.timestamps.iter().zip(&self.values) {
            for (channel, value) in self.channels.iter().zip(values) {
                rows.push(MeasurementRow {
                    timestamp: *timestamp,
                    binding_id,
                    channel: channel.clone(),
                    value: *value,
                    sensor: sensor.clone(),
                });
            }
        }
        rows
    }
}

pub fn parse_data_payload(payload: &mut [u8]) -> Result<DataBatch, PayloadError> {
    let wire: WireBatch = simd_json::serde::from_slice(payload)?;

    if wire.values.len() != wire.timestamps.len() {
        return Err(PayloadError::RowCount {
            timestamps: wire.timestamps.len(),
            rows: wire.values.len(),
        });
    }
    if let Some((row, values)) = wire
        .values
        .iter()
        .enumerate()
        .find(|(_, values)| values.len() != wire.channels.len())
    {
        return Err(PayloadError::ColumnCount {
            row,
            len: values.len(),
            channels: wire.channels.len(),
        });
    }

    let timestamps = wire
        .timestamps
        .iter()
        .map(|ms| millis_to_dt(*ms).ok_or(PayloadError::Timestamp(*ms)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DataBatch {
        timestamps,
        channels: wire.channels.into_iter().map(Arc::from).collect(),
        values: wire.values,
    })
}

/// Heartbeat content is ignored, but it still has to be JSON.
pub fn parse_heartbeat_payload(payload: &mut [u8]) -> Result<(), PayloadError> {
    simd_json::to_borrowed_value(payload)?;
    Ok(())
}

fn millis_to_dt(ms: f64) -> Option<DateTime<Utc>> {
    if !ms.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((ms * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_topic_classifies_data_and_heartbeat() {
        assert_eq!(
            parse_topic("sensors", "sensors/acc_1/data"),
            Some(SensorTopic {
                sensor: "acc_1",
                kind: MessageKind::Data
            })
        );
        assert_eq!(
            parse_topic("sensors", "sensors/acc_1/heartbeat"),
            Some(SensorTopic {
                sensor: "acc_1",
                kind: MessageKind::Heartbeat
            })
        );
    }

    #[test]
    fn parse_topic_rejects_malformed_topics() {
        assert_eq!(parse_topic("sensors", "sensors/acc_1"), None);
        assert_eq!(parse_topic("sensors", "sensors//data"), None);
        assert_eq!(parse_topic("sensors", "sensors/acc_1/cmd"), None);
        assert_eq!(parse_topic("sensors", "other/acc_1/data"), None);
        assert_eq!(parse_topic("sensors", "sensors/acc_1/data/extra"), None);
        assert_eq!(parse_topic("sensors", "sensorsx/acc_1/data"), None);
    }

    #[test]
    fn parse_topic_accepts_nested_prefix() {
        assert_eq!(
            parse_topic("lab/sensors", "lab/sensors/acc_1/data"),
            Some(SensorTopic {
                sensor: "acc_1",
                kind: MessageKind::Data
            })
        );
        assert_eq!(parse_topic("lab/sensors", "lab/acc_1/data"), None);
        assert_eq!(parse_topic("lab/sensors", "lab/sensors/x/acc_1/data"), None);
        assert_eq!(
            topic_filters("lab/sensors"),
            [
                "lab/sensors/+/data".to_string(),
                "lab/sensors/+/heartbeat".to_string()
            ]
        );
    }

    #[test]
    fn topic_filters_cover_both_kinds() {
        assert_eq!(
            topic_filters("sensors"),
            ["sensors/+/data".to_string(), "sensors/+/heartbeat".to_string()]
        );
    }

    #[test]
    fn parse_data_payload_accepts_batch_and_ignores_extra_fields() {
        let mut payload = br#"{
            "run_id": 7,
            "timestamps": [1000, 1010.5],
            "channels": ["x", "y"],
            "values": [[0.1, 0.2], [0.15, 0.18]]
        }"#
        .to_vec();
        let batch = parse_data_payload(&mut payload).expect("parsed");
        assert_eq!(batch.sample_count(), 4);
        assert_eq!(batch.timestamps[0].timestamp_millis(), 1000);
        assert_eq!(batch.timestamps[1].timestamp_micros(), 1_010_500);
        assert_eq!(batch.channels[1].as_ref(), "y");
    }

    #[test]
    fn parse_data_payload_rejects_shape_mismatch() {
        let mut payload =
            br#"{"timestamps":[1,2],"channels":["x"],"values":[[0.1]]}"#.to_vec();
        assert!(matches!(
            parse_data_payload(&mut payload),
            Err(PayloadError::RowCount {
                timestamps: 2,
                rows: 1
            })
        ));

        let mut payload =
            br#"{"timestamps":[1,2],"channels":["x","y"],"values":[[0.1,0.2],[0.3]]}"#.to_vec();
        assert!(matches!(
            parse_data_payload(&mut payload),
            Err(PayloadError::ColumnCount {
                row: 1,
                len: 1,
                channels: 2
            })
        ));
    }

    #[test]
    fn parse_data_payload_rejects_invalid_json_and_missing_fields() {
        let mut payload = b"not json".to_vec();
        assert!(matches!(
            parse_data_payload(&mut payload),
            Err(PayloadError::Json(_))
        ));
        let mut payload = br#"{"timestamps":[1],"channels":["x"]}"#.to_vec();
        assert!(parse_data_payload(&mut payload).is_err());
    }

    #[test]
    fn parse_data_payload_rejects_out_of_range_timestamp() {
        let mut payload =
            br#"{"timestamps":[1e300],"channels":["x"],"values":[[1.0]]}"#.to_vec();
        assert!(matches!(
            parse_data_payload(&mut payload),
            Err(PayloadError::Timestamp(_))
        ));
    }

    #[test]
    fn empty_batch_flattens_to_nothing() {
        let mut payload = br#"{"timestamps":[],"channels":["x"],"values":[]}"#.to_vec();
        let batch = parse_data_payload(&mut payload).expect("parsed");
        assert!(batch.flatten(&Arc::from("acc_1"), 1).is_empty());
    }

    #[test]
    fn flatten_is_timestamp_major() {
        let mut payload =
            br#"{"timestamps":[1000,1010],"channels":["x","y"],"values":[[0.1,0.2],[0.15,0.18]]}"#
                .to_vec();
        let batch = parse_data_payload(&mut payload).expect("parsed");
        let rows = batch.flatten(&Arc::from("acc_1"), 42);
        let flat: Vec<(i64, i32, &str, f64)> = rows
            .iter()
            .map(|row| {
                (
                    row.timestamp.timestamp_millis(),
                    row.binding_id,
                    row.channel.as_ref(),
                    row.value,
                )
            })
            .collect();
        assert_eq!(
            flat,
            vec![
                (1000, 42, "x", 0.1),
                (1000, 42, "y", 0.2),
                (1010, 42, "x", 0.15),
                (1010, 42, "y", 0.18),
            ]
        );
    }

    #[test]
    fn heartbeat_payload_only_needs_to_be_json() {
        let mut payload = br#"{"alive":true,"ts":123}"#.to_vec();
        assert!(parse_heartbeat_payload(&mut payload).is_ok());
        let mut payload = b"[]".to_vec();
        assert!(parse_heartbeat_payload(&mut payload).is_ok());
        let mut payload = b"{oops".to_vec();
        assert!(parse_heartbeat_payload(&mut payload).is_err());
    }

    #[test]
    fn dead_letter_payload_is_single_line_json() {
        let row = MeasurementRow {
            timestamp: DateTime::from_timestamp_millis(1000).expect("ts"),
            binding_id: 42,
            channel: Arc::from("x"),
            value: 0.5,
            sensor: Arc::from("acc_1"),
        };
        let payload = row.dead_letter_payload();
        assert!(!payload.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&payload).expect("json");
        assert_eq!(parsed["binding_id"], 42);
        assert_eq!(parsed["channel"], "x");
        assert_eq!(parsed["timestamp"], 1000);
    }
}
