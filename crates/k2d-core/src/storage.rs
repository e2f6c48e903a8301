//! Object storage locations and scoped credentials.
//!
//! Credentials are handed to the store they authenticate and nowhere else;
//! two stores in one process can use different keys for different accounts.

use crate::config::StorageConfig;
use crate::secret::Secret;
use crate::{Error, Result};
use object_store::prefix::PrefixStore;
use object_store::ObjectStore;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// A table or checkpoint location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// Azure Data Lake Gen2 / Blob container
    Azure {
        /// Storage account name (absent for `az://container/path`)
        account: Option<String>,
        /// Container (filesystem) name
        container: String,
        /// Path inside the container
        path: String,
    },
    /// S3 bucket
    S3 {
        /// Bucket name
        bucket: String,
        /// Key prefix inside the bucket
        path: String,
    },
    /// Local directory
    Local {
        /// Directory path
        path: PathBuf,
    },
}

impl StorageLocation {
    /// Parse a location URI or a local path.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(Error::Config("storage location is empty".into()));
        }

        let Some((scheme, rest)) = uri.split_once("://") else {
            if uri.starts_with("dbfs:") {
                return Err(dbfs_error(uri));
            }
            return Ok(StorageLocation::Local {
                path: PathBuf::from(uri),
            });
        };

        match scheme.to_ascii_lowercase().as_str() {
            "abfss" | "abfs" => {
                let (authority, path) = split_authority(rest);
                let (container, host) = authority.split_once('@').ok_or_else(|| {
                    Error::Config(format!(
                        "{} must look like {}://container@account.dfs.core.windows.net/path",
                        uri, scheme
                    ))
                })?;
                let account = azure_account_from_host(host).ok_or_else(|| {
                    Error::Config(format!("{} has no storage account in its host", uri))
                })?;
                if container.is_empty() {
                    return Err(Error::Config(format!("{} has no container", uri)));
                }
                Ok(StorageLocation::Azure {
                    account: Some(account),
                    container: container.to_string(),
                    path,
                })
            }
            "az" | "azure" => {
                let (container, path) = split_authority(rest);
                if container.is_empty() {
                    return Err(Error::Config(format!("{} has no container", uri)));
                }
                Ok(StorageLocation::Azure {
                    account: None,
                    container: container.to_string(),
                    path,
                })
            }
            "s3" | "s3a" => {
                let (bucket, path) = split_authority(rest);
                if bucket.is_empty() {
                    return Err(Error::Config(format!("{} has no bucket", uri)));
                }
                Ok(StorageLocation::S3 {
                    bucket: bucket.to_string(),
                    path,
                })
            }
            "file" => Ok(StorageLocation::Local {
                path: PathBuf::from(rest),
            }),
            "dbfs" => Err(dbfs_error(uri)),
            other => Err(Error::Config(format!(
                "unsupported storage scheme '{}' in {}",
                other, uri
            ))),
        }
    }

    /// Storage account for Azure locations.
    pub fn azure_account(&self) -> Option<&str> {
        match self {
            StorageLocation::Azure { account, .. } => account.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLocation::Azure {
                account: Some(account),
                container,
                path,
            } => write!(
                f,
                "abfss://{}@{}.dfs.core.windows.net/{}",
                container, account, path
            ),
            StorageLocation::Azure {
                account: None,
                container,
                path,
            } => write!(f, "az://{}/{}", container, path),
            StorageLocation::S3 { bucket, path } => write!(f, "s3://{}/{}", bucket, path),
            StorageLocation::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

fn dbfs_error(uri: &str) -> Error {
    Error::Config(format!(
        "{} is a Databricks file system path; use the abfss:// URI or local mount path it points to",
        uri
    ))
}

/// Split `authority/some/path` into the authority and a trimmed path.
fn split_authority(rest: &str) -> (&str, String) {
    match rest.split_once('/') {
        Some((authority, path)) => (authority, path.trim_matches('/').to_string()),
        None => (rest, String::new()),
    }
}

/// `account.dfs.core.windows.net`, `account.blob.core.windows.net` and
/// `account.core.windows.net` all name `account`.
fn azure_account_from_host(host: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let (account, domain) = host.split_once('.')?;
    if account.is_empty() || !domain.ends_with("windows.net") {
        return None;
    }
    Some(account.to_string())
}

/// Credentials for exactly one store.
#[derive(Debug, Clone)]
pub enum StorageCredentials {
    /// Azure shared key
    AccountKey {
        /// Storage account name
        account: String,
        /// Account key
        key: Secret,
    },
    /// Azure SAS token
    Sas {
        /// Storage account name
        account: String,
        /// Query-string token
        token: Secret,
    },
    /// Static AWS keys
    AwsKeys {
        /// Access key ID
        access_key_id: String,
        /// Secret access key
        secret_access_key: Secret,
        /// Region
        region: Option<String>,
        /// Custom endpoint (MinIO etc.)
        endpoint: Option<String>,
    },
    /// Let the store read its own environment / managed identity
    Environment,
}

impl StorageCredentials {
    /// Pick the credentials configured for `location`.
    pub fn for_location(config: &StorageConfig, location: &StorageLocation) -> Self {
        match location {
            StorageLocation::Azure { account, .. } => {
                let account = account.clone().or_else(|| {
                    // az:// URIs carry no account; use the only one configured
                    let mut accounts = config.account_keys.keys().chain(config.sas_tokens.keys());
                    match (accounts.next(), accounts.next()) {
                        (Some(only), None) => Some(only.clone()),
                        _ => None,
                    }
                });
                let Some(account) = account else {
                    return StorageCredentials::Environment;
                };
                if let Some(key) = config.account_keys.get(&account) {
                    StorageCredentials::AccountKey {
                        account,
                        key: key.clone(),
                    }
                } else if let Some(token) = config.sas_tokens.get(&account) {
                    StorageCredentials::Sas {
                        account,
                        token: token.clone(),
                    }
                } else {
                    StorageCredentials::Environment
                }
            }
            StorageLocation::S3 { .. } => match (
                config.aws_access_key_id.as_ref(),
                config.aws_secret_access_key.as_ref(),
            ) {
                (Some(id), Some(secret)) => StorageCredentials::AwsKeys {
                    access_key_id: id.clone(),
                    secret_access_key: secret.clone(),
                    region: config.aws_region.clone(),
                    endpoint: config.s3_endpoint.clone(),
                },
                _ => StorageCredentials::Environment,
            },
            StorageLocation::Local { .. } => StorageCredentials::Environment,
        }
    }
}

/// Open a store rooted at `location`.
pub fn open_store(
    location: &StorageLocation,
    credentials: &StorageCredentials,
) -> Result<Arc<dyn ObjectStore>> {
    debug!(location = %location, "Opening object store");
    match location {
        StorageLocation::Azure {
            account,
            container,
            path,
        } => create_azure_store(account.as_deref(), container, path, credentials),
        StorageLocation::S3 { bucket, path } => create_s3_store(bucket, path, credentials),
        StorageLocation::Local { path } => create_local_store(path),
    }
}

/// Parse `uri`, pick its credentials from `config`, and open it.
pub fn open_location(uri: &str, config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    let location = StorageLocation::parse(uri)?;
    let credentials = StorageCredentials::for_location(config, &location);
    open_store(&location, &credentials)
}

fn rooted<T: ObjectStore>(store: T, prefix: &str) -> Arc<dyn ObjectStore> {
    if prefix.is_empty() {
        Arc::new(store)
    } else {
        Arc::new(PrefixStore::new(store, prefix))
    }
}

fn create_azure_store(
    account: Option<&str>,
    container: &str,
    prefix: &str,
    credentials: &StorageCredentials,
) -> Result<Arc<dyn ObjectStore>> {
    use object_store::azure::{AzureConfigKey, MicrosoftAzureBuilder};

    let mut builder = MicrosoftAzureBuilder::from_env().with_container_name(container);
    if let Some(account) = account {
        builder = builder.with_account(account);
    }

    match credentials {
        StorageCredentials::AccountKey { account, key } => {
            builder = builder.with_account(account).with_access_key(key.expose()?);
        }
        StorageCredentials::Sas { account, token } => {
            builder = builder
                .with_account(account)
                .with_config(AzureConfigKey::SasKey, token.expose()?);
        }
        StorageCredentials::AwsKeys { .. } => {
            return Err(Error::Config(
                "AWS credentials cannot be used for an Azure location".into(),
            ));
        }
        StorageCredentials::Environment => {}
    }

    let store = builder
        .build()
        .map_err(|e| Error::Storage(format!("Failed to create Azure store: {}", e)))?;
    Ok(rooted(store, prefix))
}

fn create_s3_store(
    bucket: &str,
    prefix: &str,
    credentials: &StorageCredentials,
) -> Result<Arc<dyn ObjectStore>> {
    use object_store::aws::{AmazonS3Builder, S3ConditionalPut};

    // Log commits rely on put-if-absent
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_conditional_put(S3ConditionalPut::ETagMatch);

    match credentials {
        StorageCredentials::AwsKeys {
            access_key_id,
            secret_access_key,
            region,
            endpoint,
        } => {
            builder = builder
                .with_access_key_id(access_key_id)
                .with_secret_access_key(secret_access_key.expose()?);
            if let Some(region) = region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
        }
        StorageCredentials::AccountKey { .. } | StorageCredentials::Sas { .. } => {
            return Err(Error::Config(
                "Azure credentials cannot be used for an S3 location".into(),
            ));
        }
        StorageCredentials::Environment => {}
    }

    let store = builder
        .build()
        .map_err(|e| Error::Storage(format!("Failed to create S3 store: {}", e)))?;
    Ok(rooted(store, prefix))
}

fn create_local_store(path: &std::path::Path) -> Result<Arc<dyn ObjectStore>> {
    use object_store::local::LocalFileSystem;

    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| {
            Error::Storage(format!(
                "Failed to create local directory {}: {}",
                path.display(),
                e
            ))
        })?;
    }

    let store = LocalFileSystem::new_with_prefix(path).map_err(|e| {
        Error::Storage(format!(
            "Failed to create local file system store: {}",
            e
        ))
    })?;

    Ok(Arc::new(store))
}
