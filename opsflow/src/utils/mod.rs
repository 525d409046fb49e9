//! Small shared utilities.

use chrono::Utc;
use uuid::Uuid;

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// Used for the wall-clock metadata on history events; replay never
/// reads it back.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Generates a random v4 UUID string.
#[must_use]
pub fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Installs a global tracing subscriber driven by `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }

    #[test]
    fn test_generate_uuid_unique() {
        assert_ne!(generate_uuid(), generate_uuid());
    }
}
