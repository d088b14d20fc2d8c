use anyhow::{anyhow, Context};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const URL_SCHEME: &str = "local://";

/// The only three capabilities the rest of the daemon may assume of the
/// file-object store. Delete handlers treat `delete` as best-effort; callers
/// decide whether a failure is fatal.
pub trait FileStore {
    fn store(&self, name: &str, bytes: &[u8]) -> anyhow::Result<String>;
    fn delete(&self, url: &str) -> anyhow::Result<()>;
    fn sign(&self, url: &str, expires_in_secs: i64) -> anyhow::Result<String>;
}

/// Workspace-local object store. Objects live under `<workspace>/objects/`
/// and are addressed by `local://objects/<id>-<name>` urls. Signed urls carry
/// an expiry and a sha-256 token over a per-workspace secret.
pub struct LocalStore {
    root: PathBuf,
    secret: String,
}

impl LocalStore {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        let root = workspace.to_path_buf();
        std::fs::create_dir_all(root.join("objects"))?;

        let key_path = root.join("store.key");
        let secret = match std::fs::read_to_string(&key_path) {
            Ok(s) => s.trim().to_string(),
            Err(_) => {
                let s = Uuid::new_v4().to_string();
                std::fs::write(&key_path, &s).context("write store key")?;
                s
            }
        };
        Ok(LocalStore { root, secret })
    }

    fn object_rel(url: &str) -> anyhow::Result<String> {
        let rel = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| anyhow!("not a store url: {}", url))?;
        // Drop any query string a signed url may carry.
        let rel = rel.split('?').next().unwrap_or(rel);
        if rel.is_empty() || rel.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return Err(anyhow!("malformed store url: {}", url));
        }
        Ok(rel.to_string())
    }

    fn object_path(&self, url: &str) -> anyhow::Result<PathBuf> {
        Ok(self.root.join(Self::object_rel(url)?))
    }

    fn token(&self, rel: &str, expires_at: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(rel.as_bytes());
        hasher.update(b":");
        hasher.update(expires_at.to_string().as_bytes());
        let digest = hasher.finalize();
        digest.iter().take(16).map(|b| format!("{:02x}", b)).collect()
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

impl FileStore for LocalStore {
    fn store(&self, name: &str, bytes: &[u8]) -> anyhow::Result<String> {
        let rel = format!(
            "objects/{}-{}",
            &Uuid::new_v4().to_string()[..8],
            sanitize_name(name)
        );
        let path = self.root.join(&rel);
        std::fs::write(&path, bytes).with_context(|| format!("store {}", rel))?;
        Ok(format!("{}{}", URL_SCHEME, rel))
    }

    fn delete(&self, url: &str) -> anyhow::Result<()> {
        let path = self.object_path(url)?;
        std::fs::remove_file(&path).with_context(|| format!("delete {}", url))?;
        Ok(())
    }

    fn sign(&self, url: &str, expires_in_secs: i64) -> anyhow::Result<String> {
        let rel = Self::object_rel(url)?;
        let expires_at = chrono::Utc::now().timestamp() + expires_in_secs.max(0);
        let token = self.token(&rel, expires_at);
        Ok(format!(
            "{}{}?exp={}&sig={}",
            URL_SCHEME, rel, expires_at, token
        ))
    }
}

/// Deletes every url in turn, logging and swallowing failures. An orphaned
/// remote object is a lesser harm than a stuck database row, so this never
/// reports an error to the caller. Returns the number of attempts made.
pub fn cleanup_files(store: &dyn FileStore, urls: &[String]) -> usize {
    for url in urls {
        if let Err(e) = store.delete(url) {
            tracing::warn!(url = %url, error = %e, "remote file cleanup failed");
        }
    }
    urls.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn store_then_delete_removes_object() {
        let ws = temp_workspace("coursebook-store");
        let store = LocalStore::open(&ws).expect("open store");
        let url = store.store("notes.pdf", b"pdf bytes").expect("store");
        assert!(url.starts_with("local://objects/"));
        assert!(store.object_path(&url).expect("path").exists());

        store.delete(&url).expect("delete");
        assert!(!store.object_path(&url).expect("path").exists());

        // Second delete of the same url fails; best-effort callers swallow it.
        assert!(store.delete(&url).is_err());
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn signed_url_keeps_object_address_and_adds_token() {
        let ws = temp_workspace("coursebook-sign");
        let store = LocalStore::open(&ws).expect("open store");
        let url = store.store("a b.txt", b"x").expect("store");
        let signed = store.sign(&url, 600).expect("sign");
        assert!(signed.starts_with(&url));
        assert!(signed.contains("exp="));
        assert!(signed.contains("sig="));
        // Signed urls still resolve to the same object.
        assert_eq!(
            store.object_path(&url).expect("path"),
            store.object_path(&signed).expect("signed path")
        );
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn rejects_foreign_and_traversing_urls() {
        let ws = temp_workspace("coursebook-badurl");
        let store = LocalStore::open(&ws).expect("open store");
        assert!(store.delete("https://bucket/obj").is_err());
        assert!(store.delete("local://objects/../store.key").is_err());
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn cleanup_swallows_individual_failures() {
        let ws = temp_workspace("coursebook-cleanup");
        let store = LocalStore::open(&ws).expect("open store");
        let keep = store.store("ok.txt", b"1").expect("store");
        let gone = store.store("gone.txt", b"2").expect("store");
        std::fs::remove_file(store.object_path(&gone).expect("path")).expect("pre-remove");

        let attempted = cleanup_files(&store, &[keep.clone(), gone.clone()]);
        assert_eq!(attempted, 2);
        assert!(!store.object_path(&keep).expect("path").exists());
        let _ = std::fs::remove_dir_all(ws);
    }
}
