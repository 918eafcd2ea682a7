use std::collections::HashMap;

use serde_json::json;

use super::FieldValue;
use super::MetricsEncoder;

/// JSON encoder for metrics, one object per line
#[derive(Debug, Default)]
pub struct JsonEncoder;

impl JsonEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsEncoder for JsonEncoder {
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &HashMap<String, String>,
        fields: &HashMap<String, FieldValue>,
        timestamp: i64,
    ) -> String {
        let json_fields: serde_json::Map<String, serde_json::Value> = fields
            .iter()
            .map(|(k, v)| {
                let json_value = match v {
                    FieldValue::String(s) => serde_json::Value::String(s.clone()),
                    FieldValue::Integer(i) => json!(i),
                    FieldValue::UnsignedInteger(u) => json!(u),
                    // NaN and infinities have no JSON form
                    FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null),
                    FieldValue::Boolean(b) => serde_json::Value::Bool(*b),
                };
                (k.clone(), json_value)
            })
            .collect();

        let metrics = json!({
            "measure": measurement,
            "ts": timestamp,
            "tag": tags,
            "field": json_fields,
        });
        metrics.to_string() + "\n"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::Value;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn encodes_one_object_per_line() {
        let encoder = JsonEncoder::new();
        let tags = HashMap::from([("entity".to_string(), "vm-a".to_string())]);
        let fields = HashMap::from([
            ("allocation".to_string(), FieldValue::from(500_000u64)),
            ("capping".to_string(), FieldValue::from(-1i64)),
            ("slope".to_string(), FieldValue::from(f64::NAN)),
        ]);

        let line = encoder.encode_metrics("cpu_entity", &tags, &fields, 99);
        assert!(line.ends_with('\n'));

        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            value,
            json!({
                "measure": "cpu_entity",
                "ts": 99,
                "tag": {"entity": "vm-a"},
                "field": {"allocation": 500000, "capping": -1, "slope": null},
            })
        );
    }
}
