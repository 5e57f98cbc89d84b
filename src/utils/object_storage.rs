//! Bucket resolution for block directories.
//!
//! A block lives in some object store: the local filesystem, S3, or an
//! in-memory store used by tests. [`get_object_store`] turns a path string
//! into an `ObjectStore` handle plus the path of the block within it:
//!
//! * `memory://path/to/block`: process-global in-memory store
//! * `s3://bucket/path/to/block` (`?anon=true` for unsigned requests)
//! * anything else: local filesystem, relative paths resolved against the
//!   current directory

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem};
use once_cell::sync::Lazy;
use url::Url;

/// Cache key for S3 stores; anonymous and signed access use separate stores.
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
struct S3CacheKey {
    bucket: String,
    anonymous: bool,
}

/// Global cache of S3 stores keyed by (bucket, anonymous).
///
/// Recreating a store per block open would refetch credentials each time;
/// the AWS credential chain refreshes cached stores transparently.
static S3_STORE_CACHE: Lazy<DashMap<S3CacheKey, Arc<dyn ObjectStore>>> = Lazy::new(DashMap::new);

/// Global in-memory store backing the `memory://` scheme.
static MEMORY_STORE: Lazy<Arc<InMemory>> = Lazy::new(|| Arc::new(InMemory::new()));

/// Writes a file into the `memory://` store. Test support: lets a block be
/// assembled in memory and then opened through the regular bucket path.
pub async fn register_memory_file(
    path: &str,
    data: Bytes,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use object_store::PutPayload;

    let obj_path = ObjectPath::from(normalize_memory_path(path));
    MEMORY_STORE
        .put(&obj_path, PutPayload::from_bytes(data))
        .await?;
    Ok(())
}

fn normalize_memory_path(path: &str) -> String {
    path.strip_prefix("memory://").unwrap_or(path).to_string()
}

/// Gets or creates a cached S3 store for the given bucket.
pub fn get_cached_s3_store(
    bucket: &str,
    anonymous: bool,
) -> Result<Arc<dyn ObjectStore>, Box<dyn std::error::Error + Send + Sync>> {
    let cache_key = S3CacheKey {
        bucket: bucket.to_string(),
        anonymous,
    };
    let entry = S3_STORE_CACHE.entry(cache_key);
    let store = entry.or_try_insert_with(|| create_s3_store(bucket, anonymous))?;
    Ok(Arc::clone(store.value()))
}

fn create_s3_store(
    bucket: &str,
    anonymous: bool,
) -> Result<Arc<dyn ObjectStore>, Box<dyn std::error::Error + Send + Sync>> {
    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
    if anonymous {
        // Skip credential loading and request signing for public buckets
        builder = builder.with_skip_signature(true);
    }
    Ok(Arc::new(builder.build()?))
}

/// Resolves a path string to an object store and the path within it.
///
/// S3 stores are cached per (bucket, anonymous) pair; the memory store is a
/// single process-wide instance. Local paths are anchored at the filesystem
/// root so the returned path stays absolute-equivalent.
pub async fn get_object_store(
    file_path: &str,
) -> Result<(Arc<dyn ObjectStore>, ObjectPath), Box<dyn std::error::Error + Send + Sync>> {
    if file_path.starts_with("memory://") {
        let store = Arc::clone(&MEMORY_STORE) as Arc<dyn ObjectStore>;
        let path = ObjectPath::from(normalize_memory_path(file_path));
        Ok((store, path))
    } else if file_path.starts_with("s3://") {
        let url = Url::parse(file_path)?;
        let bucket = url
            .host_str()
            .ok_or("Invalid S3 URL - no bucket specified")?;
        let key = url.path().trim_start_matches('/');
        let anonymous = url
            .query_pairs()
            .any(|(k, v)| k == "anon" && (v == "true" || v == "1"));
        let store = get_cached_s3_store(bucket, anonymous)?;
        Ok((store, ObjectPath::from(key)))
    } else {
        use std::path::Path as StdPath;

        let std_path = StdPath::new(file_path);
        let absolute_path = if std_path.is_absolute() {
            std_path.to_path_buf()
        } else {
            std::env::current_dir()?.join(std_path)
        };

        #[cfg(windows)]
        let (root, relative) = {
            let path_str = absolute_path.to_string_lossy();
            if let Some(pos) = path_str.find(":\\") {
                let root = format!("{}:\\", &path_str[..pos]);
                let relative = path_str[pos + 2..].trim_start_matches('\\').replace('\\', "/");
                (root, relative)
            } else {
                return Err("Invalid Windows path".into());
            }
        };

        #[cfg(not(windows))]
        let (root, relative) = {
            let path_str = absolute_path.to_string_lossy();
            ("/".to_string(), path_str.trim_start_matches('/').to_string())
        };

        let local_store = LocalFileSystem::new_with_prefix(root)?;
        let store: Arc<dyn ObjectStore> = Arc::new(local_store);
        Ok((store, ObjectPath::from(relative)))
    }
}
