use derive_more::Display;

/// Error type raised while building or reconfiguring a market.
#[derive(Debug, Display)]
pub enum MarketError {
    /// Configuration is invalid or inconsistent.
    #[display("invalid market configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

impl core::error::Error for MarketError {}

impl MarketError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}
