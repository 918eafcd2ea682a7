use std::sync::LazyLock;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
        if git_dirty() { "-dirty" } else { "" }
    )
});

fn git_dirty() -> bool {
    matches!(option_env!("VERGEN_GIT_DIRTY"), Some("true"))
}
