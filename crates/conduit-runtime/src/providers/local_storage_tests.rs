//! Tests for filesystem object storage.

use super::*;
use tempfile::TempDir;

async fn create_test_storage() -> (LocalStorage, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = LocalConfig::new(temp_dir.path());
    config.signing_secret = Some(Zeroizing::new("test-secret".to_string()));
    let storage = LocalStorage::new(&config).await.unwrap();
    (storage, temp_dir)
}

// ============================================================================
// Round Trips
// ============================================================================

mod round_trip {
    use super::*;

    /// Verify that upload then download returns identical bytes and metadata.
    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let (storage, _temp) = create_test_storage().await;
        let data = Bytes::from_static(b"%PDF-1.7 binary \x00\x01\x02");
        let options = UploadOptions::new()
            .with_content_type("application/pdf")
            .with_metadata("job", "42")
            .with_metadata("lang", "en");

        let uri = storage
            .upload("reports", "2024/summary.pdf", data.clone(), &options)
            .await
            .unwrap();
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("reports/2024/summary.pdf"));

        let object = storage.download("reports", "2024/summary.pdf").await.unwrap();
        assert_eq!(object.data, data);
        assert_eq!(object.content_type, "application/pdf");
        assert_eq!(object.metadata, options.metadata);
    }

    /// Verify that a missing content type defaults to octet-stream.
    #[tokio::test]
    async fn test_default_content_type() {
        let (storage, _temp) = create_test_storage().await;
        storage
            .upload("b", "k", Bytes::from("x"), &UploadOptions::new())
            .await
            .unwrap();

        let object = storage.download("b", "k").await.unwrap();
        assert_eq!(object.content_type, DEFAULT_CONTENT_TYPE);
        assert!(object.metadata.is_empty());
    }

    /// Verify that uploading again replaces content and metadata.
    #[tokio::test]
    async fn test_overwrite_replaces_object() {
        let (storage, _temp) = create_test_storage().await;
        storage
            .upload(
                "b",
                "k",
                Bytes::from("first"),
                &UploadOptions::new().with_metadata("v", "1"),
            )
            .await
            .unwrap();
        storage
            .upload("b", "k", Bytes::from("second"), &UploadOptions::new())
            .await
            .unwrap();

        let object = storage.download("b", "k").await.unwrap();
        assert_eq!(object.data, Bytes::from("second"));
        assert!(object.metadata.is_empty());
    }

    /// Verify that no temporary files are left behind after upload.
    #[tokio::test]
    async fn test_no_temp_files_remain() {
        let (storage, temp) = create_test_storage().await;
        storage
            .upload("b", "k.txt", Bytes::from("x"), &UploadOptions::new())
            .await
            .unwrap();

        let mut names = Vec::new();
        let mut entries = fs::read_dir(temp.path().join("b")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(names, vec!["k.txt".to_string(), "k.txt.meta.json".to_string()]);
    }

    /// Verify that bucket naming applies on disk.
    #[tokio::test]
    async fn test_bucket_naming_applied() {
        let temp = TempDir::new().unwrap();
        let mut config = LocalConfig::new(temp.path());
        config.bucket_naming = BucketNaming::new("dev-", "");
        let storage = LocalStorage::new(&config).await.unwrap();

        storage
            .upload("uploads", "a.txt", Bytes::from("x"), &UploadOptions::new())
            .await
            .unwrap();
        assert!(temp.path().join("dev-uploads").join("a.txt").exists());
    }
}

// ============================================================================
// Existence and Deletion
// ============================================================================

mod lifecycle {
    use super::*;

    /// Verify exists is false before upload, true after, false after delete.
    #[tokio::test]
    async fn test_exists_lifecycle() {
        let (storage, _temp) = create_test_storage().await;
        assert!(!storage.exists("b", "doc.md").await.unwrap());

        storage
            .upload("b", "doc.md", Bytes::from("# hi"), &UploadOptions::new())
            .await
            .unwrap();
        assert!(storage.exists("b", "doc.md").await.unwrap());

        storage.delete("b", "doc.md").await.unwrap();
        assert!(!storage.exists("b", "doc.md").await.unwrap());
    }

    /// Verify that deleting a missing object succeeds.
    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (storage, _temp) = create_test_storage().await;
        storage.delete("b", "never-there").await.unwrap();
        storage.delete("b", "never-there").await.unwrap();
    }

    /// Verify that downloading a missing object is a not-found error.
    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let (storage, _temp) = create_test_storage().await;
        let err = storage.download("b", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    /// Verify that a directory is not reported as an object.
    #[tokio::test]
    async fn test_directory_is_not_an_object() {
        let (storage, _temp) = create_test_storage().await;
        storage
            .upload("b", "dir/file", Bytes::from("x"), &UploadOptions::new())
            .await
            .unwrap();
        assert!(!storage.exists("b", "dir").await.unwrap());
    }
}

// ============================================================================
// Path Traversal Guard
// ============================================================================

mod traversal {
    use super::*;

    /// Verify that keys climbing out of the bucket are rejected.
    #[tokio::test]
    async fn test_parent_traversal_rejected() {
        let (storage, _temp) = create_test_storage().await;
        for key in ["../escape.txt", "a/../../escape.txt", "../../etc/passwd"] {
            let err = storage
                .upload("b", key, Bytes::from("x"), &UploadOptions::new())
                .await
                .unwrap_err();
            assert!(
                matches!(err, StorageError::PathTraversal { .. }),
                "{} gave {:?}",
                key,
                err
            );
        }
    }

    /// Verify that absolute keys are rejected.
    #[tokio::test]
    async fn test_absolute_key_rejected() {
        let (storage, _temp) = create_test_storage().await;
        let err = storage.download("b", "/etc/passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::PathTraversal { .. }));
    }

    /// Verify that dot segments that stay inside the bucket are allowed.
    #[tokio::test]
    async fn test_inner_dot_segments_allowed() {
        let (storage, _temp) = create_test_storage().await;
        storage
            .upload("b", "a/./b/../c.txt", Bytes::from("x"), &UploadOptions::new())
            .await
            .unwrap();
        assert!(storage.exists("b", "a/c.txt").await.unwrap());
    }

    /// Verify that bucket names cannot traverse either.
    #[tokio::test]
    async fn test_bucket_traversal_rejected() {
        let (storage, _temp) = create_test_storage().await;
        assert!(storage.exists("..", "k").await.is_err());
        assert!(storage.exists("a/b", "k").await.is_err());
    }

    /// Verify that a configured bucket prefix cannot climb out of the base.
    #[tokio::test]
    async fn test_bucket_prefix_traversal_rejected() {
        let outer = TempDir::new().unwrap();
        let mut config = LocalConfig::new(outer.path().join("root"));
        config.bucket_naming = BucketNaming::new("../", "");
        let storage = LocalStorage::new(&config).await.unwrap();

        let err = storage
            .upload("b", "k.txt", Bytes::from("x"), &UploadOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::PathTraversal { .. }));
        assert!(!outer.path().join("b").exists());
    }

    async fn storage_beside_outside_dir() -> (LocalStorage, TempDir) {
        let outer = TempDir::new().unwrap();
        std::fs::create_dir_all(outer.path().join("root/b")).unwrap();
        std::fs::create_dir_all(outer.path().join("outside")).unwrap();
        let storage = LocalStorage::new(&LocalConfig::new(outer.path().join("root")))
            .await
            .unwrap();
        (storage, outer)
    }

    /// Verify that a symlinked directory cannot carry writes outside the root.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_directory_rejected() {
        let (storage, outer) = storage_beside_outside_dir().await;
        std::os::unix::fs::symlink(outer.path().join("outside"), outer.path().join("root/b/link"))
            .unwrap();

        let err = storage
            .upload("b", "link/pwned.txt", Bytes::from("x"), &UploadOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PathTraversal { .. }));
        assert!(!outer.path().join("outside/pwned.txt").exists());

        let err = storage
            .upload("b", "link/nested/pwned.txt", Bytes::from("x"), &UploadOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PathTraversal { .. }));
        assert!(!outer.path().join("outside/nested").exists());
    }

    /// Verify that a symlinked bucket directory is rejected.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_bucket_rejected() {
        let (storage, outer) = storage_beside_outside_dir().await;
        std::os::unix::fs::symlink(outer.path().join("outside"), outer.path().join("root/c"))
            .unwrap();

        let err = storage
            .upload("c", "pwned.txt", Bytes::from("x"), &UploadOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PathTraversal { .. }));
        assert!(!outer.path().join("outside/pwned.txt").exists());
    }

    /// Verify that a symlinked object cannot be read from outside the root.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_object_rejected() {
        let (storage, outer) = storage_beside_outside_dir().await;
        std::fs::write(outer.path().join("outside/secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(
            outer.path().join("outside/secret.txt"),
            outer.path().join("root/b/secret.txt"),
        )
        .unwrap();

        let err = storage.download("b", "secret.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::PathTraversal { .. }));
        assert!(storage.exists("b", "secret.txt").await.is_err());
    }

    /// Verify that symlinks resolving inside the root keep working.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_internal_symlink_allowed() {
        let (storage, outer) = storage_beside_outside_dir().await;
        std::fs::create_dir_all(outer.path().join("root/b/real")).unwrap();
        std::os::unix::fs::symlink(outer.path().join("root/b/real"), outer.path().join("root/b/alias"))
            .unwrap();

        storage
            .upload("b", "alias/file.txt", Bytes::from("x"), &UploadOptions::new())
            .await
            .unwrap();

        assert!(outer.path().join("root/b/real/file.txt").exists());
    }

    /// Verify that sidecar names are reserved.
    #[tokio::test]
    async fn test_sidecar_key_rejected() {
        let (storage, _temp) = create_test_storage().await;
        let err = storage
            .upload("b", "k.meta.json", Bytes::from("{}"), &UploadOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey { .. }));
    }
}

// ============================================================================
// Signed URLs
// ============================================================================

mod signed_urls {
    use super::*;

    /// Verify that a generated URL verifies with its claims.
    #[tokio::test]
    async fn test_signed_url_verifies() {
        let (storage, _temp) = create_test_storage().await;
        let url = storage
            .get_signed_url("b", "out/report 1.pdf", &SignedUrlOptions::read(600))
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.contains("out/report%201.pdf"));
        assert!(url.contains("action=read"));

        let verified = storage.verify_signed_url(&url).unwrap();
        assert_eq!(verified.bucket, "b");
        assert_eq!(verified.key, "out/report 1.pdf");
        assert_eq!(verified.action, SignedUrlAction::Read);
    }

    /// Verify that a configured public URL is used as the base.
    #[tokio::test]
    async fn test_public_url_base() {
        let temp = TempDir::new().unwrap();
        let mut config = LocalConfig::new(temp.path());
        config.public_url = Some("http://localhost:8080/files/".to_string());
        let storage = LocalStorage::new(&config).await.unwrap();

        let url = storage
            .get_signed_url("b", "k", &SignedUrlOptions::write(60))
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:8080/files/b/k?action=write&expires="));
        assert_eq!(
            storage.verify_signed_url(&url).unwrap().action,
            SignedUrlAction::Write
        );
    }

    /// Verify that tampering with the action is detected.
    #[tokio::test]
    async fn test_tampered_url_rejected() {
        let (storage, _temp) = create_test_storage().await;
        let url = storage
            .get_signed_url("b", "k", &SignedUrlOptions::read(600))
            .await
            .unwrap();
        let tampered = url.replace("action=read", "action=write");

        assert!(matches!(
            storage.verify_signed_url(&tampered),
            Err(StorageError::PermissionDenied { .. })
        ));
    }

    /// Verify that a URL signed by another secret is rejected.
    #[tokio::test]
    async fn test_foreign_secret_rejected() {
        let temp = TempDir::new().unwrap();
        let mut config = LocalConfig::new(temp.path());
        config.signing_secret = Some(Zeroizing::new("one".to_string()));
        let first = LocalStorage::new(&config).await.unwrap();
        config.signing_secret = Some(Zeroizing::new("two".to_string()));
        let second = LocalStorage::new(&config).await.unwrap();

        let url = first
            .get_signed_url("b", "k", &SignedUrlOptions::default())
            .await
            .unwrap();
        assert!(first.verify_signed_url(&url).is_ok());
        assert!(second.verify_signed_url(&url).is_err());
    }

    /// Verify that an expired URL is rejected even with a valid signature.
    #[tokio::test]
    async fn test_expired_url_rejected() {
        let (storage, _temp) = create_test_storage().await;
        let expires = Utc::now().timestamp() - 10;
        let signature = hex::encode(
            storage
                .sign(SignedUrlAction::Read, "b", "k", expires)
                .unwrap(),
        );
        let url = format!(
            "{}/b/k?action=read&expires={}&signature={}",
            storage.public_url, expires, signature
        );

        let err = storage.verify_signed_url(&url).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    /// Verify that invalid expiry values are refused before signing.
    #[tokio::test]
    async fn test_zero_expiry_refused() {
        let (storage, _temp) = create_test_storage().await;
        assert!(matches!(
            storage
                .get_signed_url("b", "k", &SignedUrlOptions::read(0))
                .await,
            Err(StorageError::SigningFailed { .. })
        ));
    }

    /// Verify that signing applies the traversal guard.
    #[tokio::test]
    async fn test_signing_traversal_rejected() {
        let (storage, _temp) = create_test_storage().await;
        assert!(matches!(
            storage
                .get_signed_url("b", "../k", &SignedUrlOptions::default())
                .await,
            Err(StorageError::PathTraversal { .. })
        ));
    }
}
