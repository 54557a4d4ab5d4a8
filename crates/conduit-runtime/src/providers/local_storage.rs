//! # Filesystem Object Storage
//!
//! Local implementation of [`StorageProvider`] for development and testing.
//!
//! Objects live at `<base>/<bucket>/<key>`, with content type and metadata in
//! a `<key>.meta.json` sidecar. Writes go to a temporary file that is renamed
//! into place. Every key is normalized lexically and rejected if it would
//! leave its bucket directory, and the resolved path is checked against the
//! canonical base directory so symlinks cannot lead outside it.

use crate::error::{SerializationError, StorageError};
use crate::provider::{BucketNaming, LocalConfig, ProviderType};
use crate::storage::{
    validate_bucket, validate_key, DownloadedObject, SignedUrlAction, SignedUrlOptions,
    StorageProvider, UploadOptions, DEFAULT_CONTENT_TYPE,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use subtle::ConstantTimeEq;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "local_storage_tests.rs"]
mod tests;

/// Suffix of the sidecar file holding an object's content type and metadata
pub const SIDECAR_SUFFIX: &str = ".meta.json";

type HmacSha256 = Hmac<Sha256>;

/// Sidecar contents stored next to each object
#[derive(Debug, Serialize, Deserialize)]
struct ObjectSidecar {
    content_type: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    uploaded_at: String,
}

/// Claims carried by a verified local signed URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUrl {
    pub bucket: String,
    pub key: String,
    pub action: SignedUrlAction,
    pub expires_at: i64,
}

/// Filesystem-based object storage
pub struct LocalStorage {
    base_path: PathBuf,
    public_url: String,
    signing_key: Zeroizing<Vec<u8>>,
    bucket_naming: BucketNaming,
}

impl LocalStorage {
    /// Create storage rooted at `config.storage_path`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the base directory cannot be created or resolved.
    pub async fn new(config: &LocalConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.storage_path).await?;
        let base_path = fs::canonicalize(&config.storage_path).await?;

        let public_url = match config.public_url {
            Some(ref url) => url.trim_end_matches('/').to_string(),
            None => url::Url::from_directory_path(&base_path)
                .map_err(|_| StorageError::InvalidKey {
                    key: base_path.display().to_string(),
                    reason: "storage path cannot be expressed as a file URL".to_string(),
                })?
                .as_str()
                .trim_end_matches('/')
                .to_string(),
        };

        let signing_key = match config.signing_secret {
            Some(ref secret) => Zeroizing::new(secret.as_bytes().to_vec()),
            None => {
                // Two v4 UUIDs: 244 random bits.
                let mut key = Vec::with_capacity(32);
                key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
                key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
                Zeroizing::new(key)
            }
        };

        tracing::info!(base_path = %base_path.display(), "Local storage initialised");

        Ok(Self {
            base_path,
            public_url,
            signing_key,
            bucket_naming: config.bucket_naming.clone(),
        })
    }

    /// Root directory holding every bucket
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve `(bucket, key)` lexically to a path inside the bucket directory
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PathTraversal`] for keys that are absolute or
    /// climb above the bucket with `..`, and for bucket names that do not
    /// resolve to a single directory under the base path.
    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_bucket(bucket)?;

        let mut relative = PathBuf::new();
        for component in Path::new(key).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(StorageError::PathTraversal {
                            key: key.to_string(),
                        });
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::PathTraversal {
                        key: key.to_string(),
                    })
                }
            }
        }

        validate_key(key)?;
        if relative.as_os_str().is_empty() {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "key does not name an object".to_string(),
            });
        }
        if key.ends_with(SIDECAR_SUFFIX) {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: format!("keys ending in '{}' are reserved", SIDECAR_SUFFIX),
            });
        }

        // Prefix and suffix come from configuration and are not covered by validate_bucket.
        let bucket_dir = self.bucket_naming.resolve(bucket);
        let mut components = Path::new(&bucket_dir).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => validate_bucket(&bucket_dir)?,
            _ => {
                return Err(StorageError::PathTraversal {
                    key: format!("{}/{}", bucket_dir, key),
                })
            }
        }

        Ok(self.base_path.join(bucket_dir).join(relative))
    }

    /// Resolve `(bucket, key)` and confirm it stays under the base path on disk
    ///
    /// Symlinks are followed: the deepest existing ancestor of the object and
    /// of its sidecar must canonicalize to a path inside the base directory.
    async fn resolve_object(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let path = self.object_path(bucket, key)?;
        for candidate in [path.clone(), sidecar_path(&path)] {
            if !self.is_contained(&candidate).await {
                tracing::warn!(bucket = %bucket, key = %key, "Object path escapes the storage root");
                return Err(StorageError::PathTraversal {
                    key: key.to_string(),
                });
            }
        }
        Ok(path)
    }

    async fn is_contained(&self, path: &Path) -> bool {
        for ancestor in path.ancestors() {
            if let Ok(resolved) = fs::canonicalize(ancestor).await {
                return resolved.starts_with(&self.base_path);
            }
        }
        false
    }

    fn sign(
        &self,
        action: SignedUrlAction,
        bucket: &str,
        key: &str,
        expires: i64,
    ) -> Result<Vec<u8>, StorageError> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key).map_err(|e| {
            StorageError::SigningFailed {
                message: e.to_string(),
            }
        })?;
        mac.update(format!("{}\n{}\n{}\n{}", action.as_str(), bucket, key, expires).as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Check a URL produced by `get_signed_url`
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PermissionDenied`] when the URL was not issued
    /// by this storage, was altered, or has expired.
    pub fn verify_signed_url(&self, signed_url: &str) -> Result<VerifiedUrl, StorageError> {
        let denied = |reason: &str| StorageError::PermissionDenied {
            operation: format!("signed URL rejected: {}", reason),
        };

        let (location, query) = signed_url
            .split_once('?')
            .ok_or_else(|| denied("missing query"))?;
        let object = location
            .strip_prefix(&self.public_url)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| denied("foreign base URL"))?;
        let (bucket, encoded_key) = object
            .split_once('/')
            .ok_or_else(|| denied("missing key"))?;

        let key = encoded_key
            .split('/')
            .map(|segment| urlencoding::decode(segment).map(|s| s.into_owned()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| denied("malformed key encoding"))?
            .join("/");

        let mut action = None;
        let mut expires = None;
        let mut signature = None;
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "action" => action = Some(value.into_owned()),
                "expires" => expires = Some(value.into_owned()),
                "signature" => signature = Some(value.into_owned()),
                _ => {}
            }
        }

        let action: SignedUrlAction = action
            .ok_or_else(|| denied("missing action"))?
            .parse()
            .map_err(|_| denied("unknown action"))?;
        let expires: i64 = expires
            .ok_or_else(|| denied("missing expiry"))?
            .parse()
            .map_err(|_| denied("malformed expiry"))?;
        let given = signature
            .and_then(|s| hex::decode(s).ok())
            .ok_or_else(|| denied("missing or malformed signature"))?;

        let expected = self.sign(action, bucket, &key, expires)?;
        if !bool::from(expected.as_slice().ct_eq(given.as_slice())) {
            return Err(denied("signature mismatch"));
        }
        if Utc::now().timestamp() > expires {
            return Err(denied("expired"));
        }

        Ok(VerifiedUrl {
            bucket: bucket.to_string(),
            key,
            action,
            expires_at: expires,
        })
    }
}

fn sidecar_path(object_path: &Path) -> PathBuf {
    let mut name = object_path.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Write `data` to `path` through a temporary file and rename
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let temp_path = PathBuf::from(temp_name);

    let mut file = fs::File::create(&temp_path).await?;
    let written = async {
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    // Rename to final path (atomic on most filesystems)
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &UploadOptions,
    ) -> Result<String, StorageError> {
        let path = self.resolve_object(bucket, key).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let sidecar = ObjectSidecar {
            content_type: options.content_type().to_string(),
            metadata: options.metadata.clone(),
            uploaded_at: Utc::now().to_rfc3339(),
        };
        let sidecar_json =
            serde_json::to_vec_pretty(&sidecar).map_err(SerializationError::from)?;

        write_atomic(&path, &data).await?;
        write_atomic(&sidecar_path(&path), &sidecar_json).await?;

        let uri = url::Url::from_file_path(&path)
            .map(String::from)
            .unwrap_or_else(|_| format!("file://{}", path.display()));

        tracing::debug!(bucket = %bucket, key = %key, size = data.len(), "Object stored");
        Ok(uri)
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<DownloadedObject, StorageError> {
        let path = self.resolve_object(bucket, key).await?;

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let (content_type, metadata) = match fs::read(sidecar_path(&path)).await {
            Ok(raw) => {
                let sidecar: ObjectSidecar =
                    serde_json::from_slice(&raw).map_err(SerializationError::from)?;
                (sidecar.content_type, sidecar.metadata)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                (DEFAULT_CONTENT_TYPE.to_string(), HashMap::new())
            }
            Err(e) => return Err(e.into()),
        };

        Ok(DownloadedObject {
            data: Bytes::from(data),
            content_type,
            metadata,
        })
    }

    async fn get_signed_url(
        &self,
        bucket: &str,
        key: &str,
        options: &SignedUrlOptions,
    ) -> Result<String, StorageError> {
        options.validate()?;
        // Resolving first applies the traversal guard to signed keys too.
        self.resolve_object(bucket, key).await?;

        let bucket = self.bucket_naming.resolve(bucket);
        let expires = Utc::now().timestamp() + options.expires_in_seconds as i64;
        let signature = hex::encode(self.sign(options.action, &bucket, key, expires)?);
        let encoded_key = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        Ok(format!(
            "{}/{}/{}?action={}&expires={}&signature={}",
            self.public_url,
            bucket,
            encoded_key,
            options.action.as_str(),
            expires,
            signature
        ))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let path = self.resolve_object(bucket, key).await?;
        remove_if_present(&path).await?;
        remove_if_present(&sidecar_path(&path)).await?;

        tracing::debug!(bucket = %bucket, key = %key, "Object deleted");
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve_object(bucket, key).await?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }
}
