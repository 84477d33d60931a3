//! File proxy: a short-lived in-memory store that rewrites binary
//! payloads into fetchable URLs.
//!
//! Staged entries are single-consumption: the first fetch removes the
//! entry, a second fetch misses. Nothing is ever written to disk.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use md5::{Digest, Md5};
use tracing::debug;

/// Default URL root segment for staged files.
pub const DEFAULT_FILE_ROOT: &str = "IM_TEMP_FILE";

/// In-memory hash → content store behind `{host}/{root}/{hash}/...` URLs.
pub struct FileProxy {
    files: Mutex<HashMap<String, Bytes>>,
    host: String,
    root: String,
}

impl FileProxy {
    /// Create a proxy serving URLs under `host` and the given root
    /// segment. Surrounding slashes on either part are trimmed.
    #[must_use]
    pub fn new(host: impl AsRef<str>, root: impl AsRef<str>) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            host: host.as_ref().trim_end_matches('/').to_owned(),
            root: root.as_ref().trim_matches('/').to_owned(),
        }
    }

    /// Stage a suffix-addressed blob; returns the URL to fetch it once.
    pub fn add_disposable(&self, content: Bytes, suffix: &str) -> String {
        let hash = stage_hash(suffix);
        debug!(hash = %hash, bytes = content.len(), "staged disposable file");
        self.files.lock().unwrap().insert(hash.clone(), content);

        if suffix.is_empty() {
            format!("{}/{}/{hash}/{hash}", self.host, self.root)
        } else {
            format!("{}/{}/{hash}/{hash}.{suffix}", self.host, self.root)
        }
    }

    /// Stage a blob addressed by its original file name.
    pub fn add_disposable_named(&self, content: Bytes, filename: &str) -> String {
        let hash = stage_hash(filename);
        debug!(hash = %hash, name = filename, bytes = content.len(), "staged named file");
        self.files.lock().unwrap().insert(hash.clone(), content);

        format!("{}/{}/{hash}/{filename}", self.host, self.root)
    }

    /// Fetch and remove a staged entry. `None` when absent or already
    /// consumed.
    #[must_use]
    pub fn fetch(&self, hash: &str) -> Option<Bytes> {
        self.files.lock().unwrap().remove(hash)
    }

    /// Remove an entry unconditionally.
    pub fn delete(&self, hash: &str) {
        self.files.lock().unwrap().remove(hash);
    }

    /// Number of staged entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Content hash for a staged entry: md5 over the current time and the
/// suffix or file name, hex encoded.
fn stage_hash(salt: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let mut hasher = Md5::new();
    hasher.update(now.to_string().as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> FileProxy {
        FileProxy::new("http://localhost:8324", DEFAULT_FILE_ROOT)
    }

    fn hash_from(url: &str) -> &str {
        url.split('/').rev().nth(1).unwrap()
    }

    #[test]
    fn test_single_consumption() {
        let proxy = proxy();
        let url = proxy.add_disposable(Bytes::from_static(b"payload"), "png");
        let hash = hash_from(&url);

        assert_eq!(proxy.fetch(hash), Some(Bytes::from_static(b"payload")));
        assert_eq!(proxy.fetch(hash), None);
    }

    #[test]
    fn test_url_shapes() {
        let proxy = proxy();

        let with_suffix = proxy.add_disposable(Bytes::from_static(b"x"), "png");
        let hash = hash_from(&with_suffix).to_owned();
        assert_eq!(
            with_suffix,
            format!("http://localhost:8324/IM_TEMP_FILE/{hash}/{hash}.png")
        );

        let bare = proxy.add_disposable(Bytes::from_static(b"x"), "");
        let hash = hash_from(&bare).to_owned();
        assert_eq!(
            bare,
            format!("http://localhost:8324/IM_TEMP_FILE/{hash}/{hash}")
        );

        let named = proxy.add_disposable_named(Bytes::from_static(b"x"), "report.pdf");
        assert!(named.ends_with("/report.pdf"));
        assert_eq!(hash_from(&named).len(), 32);
    }

    #[test]
    fn test_delete_is_unconditional() {
        let proxy = proxy();
        let url = proxy.add_disposable(Bytes::from_static(b"x"), "bin");
        let hash = hash_from(&url);

        proxy.delete(hash);
        proxy.delete(hash);
        assert!(proxy.is_empty());
        assert_eq!(proxy.fetch(hash), None);
    }

    #[test]
    fn test_root_slashes_are_trimmed() {
        let proxy = FileProxy::new("http://h/", "/tmp-root/");
        let url = proxy.add_disposable(Bytes::from_static(b"x"), "");
        assert!(url.starts_with("http://h/tmp-root/"));
    }
}
