//! Tracing setup and operation timing helpers.

use std::time::Instant;

/// Install the global tracing subscriber. `RUST_LOG` wins; the default
/// keeps the fabric at info and its dependencies at warn.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sqlx=warn,hyper=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Timer that logs the duration of a named component operation.
#[derive(Debug)]
pub struct OpTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl OpTimer {
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        tracing::debug!(component, operation, "operation started");
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        tracing::info!(
            component = self.component,
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "operation completed"
        );
    }
}
