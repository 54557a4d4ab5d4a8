//! Tests for storage contract types.

use super::*;

#[test]
fn test_upload_options_default_content_type() {
    assert_eq!(UploadOptions::new().content_type(), DEFAULT_CONTENT_TYPE);
    assert_eq!(
        UploadOptions::new()
            .with_content_type("application/pdf")
            .content_type(),
        "application/pdf"
    );
}

#[test]
fn test_signed_url_defaults() {
    let options = SignedUrlOptions::default();
    assert_eq!(options.expires_in_seconds, 3600);
    assert_eq!(options.action, SignedUrlAction::Read);
    assert_eq!(options.action.http_method(), "GET");
    assert_eq!(SignedUrlAction::Write.http_method(), "PUT");
}

#[test]
fn test_signed_url_expiry_bounds() {
    assert!(SignedUrlOptions::read(1).validate().is_ok());
    assert!(SignedUrlOptions::read(MAX_SIGNED_URL_EXPIRY_SECONDS)
        .validate()
        .is_ok());
    assert!(SignedUrlOptions::read(0).validate().is_err());
    assert!(SignedUrlOptions::write(MAX_SIGNED_URL_EXPIRY_SECONDS + 1)
        .validate()
        .is_err());
}

#[test]
fn test_action_parse() {
    assert_eq!("write".parse::<SignedUrlAction>().unwrap(), SignedUrlAction::Write);
    assert!("delete".parse::<SignedUrlAction>().is_err());
}

#[test]
fn test_validate_key() {
    assert!(validate_key("reports/2024/summary.pdf").is_ok());
    assert!(validate_key("").is_err());
    assert!(validate_key("/etc/passwd").is_err());
    assert!(validate_key("a\0b").is_err());
    assert!(validate_key(&"k".repeat(1025)).is_err());
}

#[test]
fn test_validate_bucket() {
    assert!(validate_bucket("uploads").is_ok());
    assert!(validate_bucket("my.bucket-1").is_ok());
    assert!(validate_bucket("..").is_err());
    assert!(validate_bucket("a/b").is_err());
    assert!(validate_bucket("").is_err());
}
