use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static LOG_INIT: OnceLock<()> = OnceLock::new();

/// Install the process-wide tracing subscriber. Safe to call from every
/// connection entry point; only the first call has any effect.
pub fn init_tracing() {
    LOG_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("INFO,rustls=WARN"));
        // try_init: the embedding application may already own a subscriber
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_init_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
