use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

pub mod encoders;

pub use encoders::{
    create_encoder, EntityMetricsParams, FieldValue, MarketMetricsParams, MetricsEncoder,
};

// Wrapper struct for Vec<u8> that implements Display
pub struct BytesWrapper(Vec<u8>);

impl fmt::Display for BytesWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => {
                tracing::error!("metrics line is not valid UTF-8");
                Err(fmt::Error)
            }
        }
    }
}

impl From<Vec<u8>> for BytesWrapper {
    fn from(bytes: Vec<u8>) -> Self {
        BytesWrapper(bytes)
    }
}

/// Milliseconds since the Unix epoch, 0 if the clock is before it.
pub fn current_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Host name used to tag metrics lines.
pub fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_wrapper_displays_utf8() {
        assert_eq!(BytesWrapper::from(b"cpu lost=0u 1\n".to_vec()).to_string(), "cpu lost=0u 1\n");
        assert_eq!(BytesWrapper::from(Vec::new()).to_string(), "");
    }

    #[test]
    fn current_time_is_after_2020() {
        assert!(current_time() > 1_577_836_800_000);
    }
}
