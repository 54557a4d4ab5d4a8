//! Tests for GCP error mapping and shared helpers.

use super::*;

mod error_responses {
    use super::*;

    /// Verify that the Google error envelope supplies status and message.
    #[test]
    fn test_parse_envelope() {
        let body = r#"{"error":{"code":400,"message":"Invalid resource name","status":"INVALID_ARGUMENT"}}"#;
        match parse_error_response(400, body) {
            GcpError::ApiError {
                code,
                status,
                message,
            } => {
                assert_eq!(code, 400);
                assert_eq!(status, "INVALID_ARGUMENT");
                assert_eq!(message, "Invalid resource name");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    /// Verify that well-known HTTP statuses map to dedicated variants.
    #[test]
    fn test_status_mapping() {
        let body = r#"{"error":{"code":404,"message":"Resource not found (resource=jobs).","status":"NOT_FOUND"}}"#;
        assert!(matches!(
            parse_error_response(404, body),
            GcpError::NotFound(ref m) if m.contains("jobs")
        ));
        assert!(matches!(
            parse_error_response(401, ""),
            GcpError::Authentication(_)
        ));
        assert!(matches!(
            parse_error_response(403, "{}"),
            GcpError::PermissionDenied(_)
        ));
    }

    /// Verify that non-JSON bodies fall back to the HTTP status.
    #[test]
    fn test_non_json_body() {
        assert!(matches!(
            parse_error_response(502, "<html>Bad Gateway</html>"),
            GcpError::ApiError { ref status, ref message, .. }
                if status == "HTTP502" && message.contains("Bad Gateway")
        ));
    }
}

mod conversions {
    use super::*;

    /// Verify transient classification.
    #[test]
    fn test_is_transient() {
        assert!(GcpError::NetworkError("reset".into()).is_transient());
        assert!(GcpError::ApiError {
            code: 429,
            status: "RESOURCE_EXHAUSTED".into(),
            message: String::new(),
        }
        .is_transient());
        assert!(!GcpError::NotFound("x".into()).is_transient());
        assert!(!GcpError::InvalidAckId("a".into()).is_transient());
    }

    /// Verify the queue error mapping.
    #[test]
    fn test_to_queue_error() {
        assert!(matches!(
            GcpError::NotFound("topic".into()).to_queue_error("jobs"),
            QueueError::QueueNotFound { ref queue_name } if queue_name == "jobs"
        ));
        assert!(matches!(
            GcpError::InvalidAckId("ack-1".into()).to_queue_error("jobs"),
            QueueError::MessageState { ref receipt, .. } if receipt == "ack-1"
        ));
        assert!(matches!(
            GcpError::PermissionDenied("nope".into()).to_queue_error("jobs"),
            QueueError::AuthenticationFailed { .. }
        ));
        let unavailable = GcpError::ApiError {
            code: 503,
            status: "UNAVAILABLE".into(),
            message: String::new(),
        }
        .to_queue_error("jobs");
        assert!(matches!(unavailable, QueueError::BackendUnavailable { .. }));
        assert!(unavailable.is_transient());
    }

    /// Verify the storage error mapping.
    #[test]
    fn test_to_storage_error() {
        assert!(GcpError::NotFound("No such object".into())
            .to_storage_error("b", "k")
            .is_not_found());
        assert!(matches!(
            GcpError::PermissionDenied("storage.objects.get".into()).to_storage_error("b", "k"),
            StorageError::PermissionDenied { ref operation } if operation == "storage.objects.get"
        ));
        assert!(matches!(
            GcpError::SigningFailed("no key".into()).to_storage_error("b", "k"),
            StorageError::SigningFailed { .. }
        ));
    }
}

mod helpers {
    use super::*;

    /// Verify that bare hosts gain a scheme and URLs are kept.
    #[test]
    fn test_host_base_url() {
        assert_eq!(host_base_url("localhost:8085"), "http://localhost:8085");
        assert_eq!(
            host_base_url("https://gcs.example.test/"),
            "https://gcs.example.test"
        );
        assert_eq!(
            host_base_url("metadata.google.internal"),
            "http://metadata.google.internal"
        );
    }
}
