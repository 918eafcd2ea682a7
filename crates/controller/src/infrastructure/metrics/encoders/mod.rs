use std::collections::HashMap;

pub mod influx;
pub mod json;

/// Represents a field value that can be encoded in metrics
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    Boolean(bool),
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UnsignedInteger(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

/// Market-wide figures of one tick
#[derive(Debug, Clone)]
pub struct MarketMetricsParams<'a> {
    pub host: &'a str,
    pub capacity: u64,
    pub sold: u64,
    pub lost: u64,
    pub iterations: u64,
    pub entities: usize,
    pub tick_micros: u64,
    pub timestamp: i64,
}

/// Per-entity figures of one tick
#[derive(Debug, Clone)]
pub struct EntityMetricsParams<'a> {
    pub host: &'a str,
    pub entity: &'a str,
    pub vm: &'a str,
    pub consumption: u64,
    pub capping: i64,
    pub allocation: u64,
    pub usage_percentage: f64,
    pub slope: f64,
    pub balance: u64,
    pub timestamp: i64,
}

/// Trait for encoding metrics data into different formats
pub trait MetricsEncoder: Send + Sync {
    /// Encode metrics with measurement name, tags, fields, and timestamp
    fn encode_metrics(
        &self,
        measurement: &str,
        tags: &HashMap<String, String>,
        fields: &HashMap<String, FieldValue>,
        timestamp: i64,
    ) -> String;

    fn encode_market_metrics(&self, params: &MarketMetricsParams) -> String {
        let mut tags = HashMap::new();
        tags.insert("host".to_string(), params.host.to_string());

        let mut fields = HashMap::new();
        fields.insert("capacity".to_string(), params.capacity.into());
        fields.insert("sold".to_string(), params.sold.into());
        fields.insert("lost".to_string(), params.lost.into());
        fields.insert("iterations".to_string(), params.iterations.into());
        fields.insert("entities".to_string(), (params.entities as u64).into());
        fields.insert("tick_us".to_string(), params.tick_micros.into());

        self.encode_metrics("cpu_market", &tags, &fields, params.timestamp)
    }

    fn encode_entity_metrics(&self, params: &EntityMetricsParams) -> String {
        let mut tags = HashMap::new();
        tags.insert("host".to_string(), params.host.to_string());
        tags.insert("entity".to_string(), params.entity.to_string());
        tags.insert("vm".to_string(), params.vm.to_string());

        let mut fields = HashMap::new();
        fields.insert("consumption".to_string(), params.consumption.into());
        fields.insert("capping".to_string(), params.capping.into());
        fields.insert("allocation".to_string(), params.allocation.into());
        fields.insert(
            "usage_percentage".to_string(),
            params.usage_percentage.into(),
        );
        fields.insert("slope".to_string(), params.slope.into());
        fields.insert("balance".to_string(), params.balance.into());

        self.encode_metrics("cpu_entity", &tags, &fields, params.timestamp)
    }
}

/// Factory function to create encoders based on format string
pub fn create_encoder(format: &str) -> Box<dyn MetricsEncoder> {
    match format.to_lowercase().as_str() {
        "json" => Box::new(json::JsonEncoder::new()),
        "influx" | "influxdb" => Box::new(influx::InfluxEncoder::new()),
        other => {
            tracing::warn!("unknown metrics format '{other}', falling back to influx");
            Box::new(influx::InfluxEncoder::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market_params() -> MarketMetricsParams<'static> {
        MarketMetricsParams {
            host: "node-1",
            capacity: 4_000_000,
            sold: 3_500_000,
            lost: 500_000,
            iterations: 3,
            entities: 2,
            tick_micros: 820,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn field_value_conversions() {
        assert_eq!(FieldValue::from("x"), FieldValue::String("x".to_string()));
        assert_eq!(FieldValue::from(-3i64), FieldValue::Integer(-3));
        assert_eq!(FieldValue::from(3u64), FieldValue::UnsignedInteger(3));
        assert_eq!(FieldValue::from(0.5), FieldValue::Float(0.5));
        assert_eq!(FieldValue::from(true), FieldValue::Boolean(true));
    }

    #[test]
    fn create_encoder_by_name() {
        let line = create_encoder("json").encode_market_metrics(&market_params());
        assert!(line.starts_with('{'));

        let line = create_encoder("INFLUX").encode_market_metrics(&market_params());
        assert!(line.starts_with("cpu_market,host=node-1 "));
    }

    #[test]
    fn unknown_format_falls_back_to_influx() {
        let line = create_encoder("otel").encode_market_metrics(&market_params());
        assert!(line.starts_with("cpu_market"));
        assert!(line.contains("lost=500000u"));
    }

    #[test]
    fn entity_metrics_carry_tags() {
        let params = EntityMetricsParams {
            host: "node-1",
            entity: "vm-a/vcpu0",
            vm: "vm-a",
            consumption: 120_000,
            capping: -1,
            allocation: 500_000,
            usage_percentage: 12.0,
            slope: 0.25,
            balance: 30_000,
            timestamp: 1,
        };
        let line = create_encoder("influx").encode_entity_metrics(&params);

        assert!(line.starts_with("cpu_entity,"));
        assert!(line.contains("entity=vm-a/vcpu0"));
        assert!(line.contains("capping=-1i"));
        assert!(line.contains("balance=30000u"));
    }
}
