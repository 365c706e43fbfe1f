use uuid::Uuid;

/// Generate a correlation id (32 hex characters).
pub fn generate_trace_id() -> String {
    let id = Uuid::new_v4();
    id.as_simple().to_string()
}

/// Generate a span id (16 hex characters).
pub fn generate_span_id() -> String {
    let id = Uuid::new_v4();
    id.as_simple().to_string()[..16].to_string()
}

/// Create a named span for a top-level operation (e.g. a control session's
/// lifetime), returning the span and its trace id for log correlation.
pub fn create_operation_span(operation: &str) -> (tracing::Span, String) {
    let trace_id = generate_trace_id();
    let span_id = generate_span_id();
    let span = tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %span_id,
        operation = %operation,
    );
    (span, trace_id)
}

/// Create a child span under an existing trace id.
pub fn create_child_span(trace_id: &str, operation: &str) -> tracing::Span {
    let span_id = generate_span_id();
    tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %span_id,
        operation = %operation,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_format() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn span_id_format() {
        let id = generate_span_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn operation_span_creation() {
        let (span, trace_id) = create_operation_span("daemon_register");
        assert_eq!(trace_id.len(), 32);
        let _guard = span.enter();
    }

    #[test]
    fn child_span_creation() {
        let trace_id = generate_trace_id();
        let span = create_child_span(&trace_id, "heartbeat");
        let _guard = span.enter();
    }
}
