use derive_more::Display;

/// Errors raised by the controller outside of the market computation.
#[derive(Debug, Display)]
pub enum ControllerError {
    #[display("I/O failure on {path}")]
    Io { path: String },
    #[display("invalid configuration: {reason}")]
    Config { reason: String },
    #[display("cgroup discovery failed: {reason}")]
    Discovery { reason: String },
}

impl core::error::Error for ControllerError {}

impl ControllerError {
    pub fn io(path: impl AsRef<std::path::Path>) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn discovery(reason: impl Into<String>) -> Self {
        Self::Discovery {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        assert_eq!(
            ControllerError::io("/sys/fs/cgroup/cpu.max").to_string(),
            "I/O failure on /sys/fs/cgroup/cpu.max"
        );
        assert_eq!(
            ControllerError::config("tick must be positive").to_string(),
            "invalid configuration: tick must be positive"
        );
        assert_eq!(
            ControllerError::discovery("vm-a already registered").to_string(),
            "cgroup discovery failed: vm-a already registered"
        );
    }
}
