use tracing::Level;

/// Install the global fmt subscriber.
///
/// Filtering follows `RUST_LOG`, with `default_level` applied on top. A
/// second call (or a subscriber installed by the host) is left in place.
pub fn init_logging(default_level: Level) {
    let result = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .try_init();

    if result.is_ok() {
        tracing::info!("Logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(Level::DEBUG);
        init_logging(Level::INFO);
        tracing::debug!("still alive");
    }
}
