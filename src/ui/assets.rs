//! Static browser assets served from the public directory

use axum::body::Body;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio_util::io::ReaderStream;

/// A resolved asset ready to be sent
pub struct Asset {
    pub path: PathBuf,
    pub content_type: String,
    pub len: u64,
    pub body: Body,
}

/// Read-only view of the public directory
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a request path onto the public directory.
    ///
    /// Rejects anything that could leave the directory (`..`, absolute
    /// components, drive prefixes). A trailing slash or an empty path maps to
    /// `index.html`.
    pub fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let trimmed = request_path.trim_start_matches('/');
        let mut resolved = self.root.clone();

        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }

        if trimmed.is_empty() || trimmed.ends_with('/') {
            resolved.push("index.html");
        }
        Some(resolved)
    }

    /// Open the asset at `request_path`. `NotFound` for missing files,
    /// directories and rejected paths alike.
    pub async fn open(&self, request_path: &str) -> io::Result<Asset> {
        let path = self
            .resolve(request_path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "path outside public directory"))?;

        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not a file"));
        }

        let file = tokio::fs::File::open(&path).await?;
        let content_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .to_string();

        Ok(Asset {
            content_type,
            len: metadata.len(),
            body: Body::from_stream(ReaderStream::new(file)),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_inside_root() {
        let store = AssetStore::new("/srv/public");
        assert_eq!(
            store.resolve("/home/app.js"),
            Some(PathBuf::from("/srv/public/home/app.js"))
        );
        assert_eq!(
            store.resolve("/controller/"),
            Some(PathBuf::from("/srv/public/controller/index.html"))
        );
        assert_eq!(store.resolve("/"), Some(PathBuf::from("/srv/public/index.html")));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let store = AssetStore::new("/srv/public");
        assert_eq!(store.resolve("/../secret.txt"), None);
        assert_eq!(store.resolve("/home/../../etc/passwd"), None);
    }

    #[tokio::test]
    async fn test_open_guesses_content_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("style.css"), "body {}").unwrap();
        let store = AssetStore::new(dir.path());

        let asset = store.open("/style.css").await.unwrap();
        assert_eq!(asset.content_type, "text/css");
        assert_eq!(asset.len, 7);
    }

    #[tokio::test]
    async fn test_open_missing_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("home")).unwrap();
        let store = AssetStore::new(dir.path());

        let missing = store.open("/nope.js").await.err().unwrap();
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);

        // a directory without index.html
        let dir_err = store.open("/home").await.err().unwrap();
        assert_eq!(dir_err.kind(), io::ErrorKind::NotFound);
    }
}
