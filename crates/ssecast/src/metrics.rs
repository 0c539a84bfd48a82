//! Metric names recorded through the `metrics` facade.
//!
//! The library never installs a recorder; a host that wants these exported
//! installs its own before starting a server.

/// Subscriber connections accepted (counter).
pub const SSE_CONNECTIONS_TOTAL: &str = "sse_connections_total";
/// Subscriber connections removed (counter).
pub const SSE_DISCONNECTIONS_TOTAL: &str = "sse_disconnections_total";
/// Currently registered subscribers (gauge).
pub const SSE_CONNECTIONS_ACTIVE: &str = "sse_connections_active";
/// Messages ingested from the control channel (counter).
pub const SSE_BROADCASTS_TOTAL: &str = "sse_broadcasts_total";
/// Per-client flush attempts (counter, labels: outcome).
pub const SSE_FLUSHES_TOTAL: &str = "sse_flushes_total";
/// Control-channel bytes discarded past the read capacity (counter).
pub const SSE_TRUNCATED_BYTES_TOTAL: &str = "sse_truncated_bytes_total";
/// Handshakes that failed and dropped the subscriber (counter).
pub const SSE_HANDSHAKE_FAILURES_TOTAL: &str = "sse_handshake_failures_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            SSE_CONNECTIONS_TOTAL,
            SSE_DISCONNECTIONS_TOTAL,
            SSE_CONNECTIONS_ACTIVE,
            SSE_BROADCASTS_TOTAL,
            SSE_FLUSHES_TOTAL,
            SSE_TRUNCATED_BYTES_TOTAL,
            SSE_HANDSHAKE_FAILURES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
            assert!(name.starts_with("sse_"));
        }
    }
}
