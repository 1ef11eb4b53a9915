use std::path::{Path, PathBuf};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::WrapErr;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::ports::file_system::{FileSystem, FileSystemError};

/// Serves mount directories through tower-http's `ServeDir`.
#[derive(Debug, Default, Clone)]
pub struct FileSystemAdapter;

impl FileSystemAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Map a directory request to its welcome file. Paths escaping `root`
    /// are rejected.
    async fn resolve_path(
        &self,
        root: &str,
        path: &str,
        welcome_file: &str,
    ) -> Result<String, FileSystemError> {
        let relative = path.trim_start_matches('/');
        let full_path = Path::new(root).join(relative);
        ensure_within_root(root, &full_path)?;

        let is_dir = match tokio::fs::metadata(&full_path).await {
            Ok(metadata) => metadata.is_dir(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(FileSystemError::Io(e)),
        };

        if relative.is_empty() || path.ends_with('/') || is_dir {
            let dir = relative.trim_end_matches('/');
            if dir.is_empty() {
                Ok(format!("/{welcome_file}"))
            } else {
                Ok(format!("/{dir}/{welcome_file}"))
            }
        } else {
            Ok(format!("/{relative}"))
        }
    }
}

/// Reject paths that resolve outside `root`.
fn ensure_within_root(root: &str, full_path: &Path) -> Result<(), FileSystemError> {
    let canonical_root = std::fs::canonicalize(root).map_err(FileSystemError::Io)?;

    // A missing file is checked through its closest existing ancestor
    let mut existing: PathBuf = full_path.to_path_buf();
    let canonical = loop {
        match std::fs::canonicalize(&existing) {
            Ok(p) => break p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match existing.parent() {
                Some(parent) => existing = parent.to_path_buf(),
                None => return Err(FileSystemError::Io(e)),
            },
            Err(e) => return Err(FileSystemError::Io(e)),
        }
    };

    if !canonical.starts_with(&canonical_root) {
        return Err(FileSystemError::OutsideRoot(
            full_path.display().to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl FileSystem for FileSystemAdapter {
    async fn serve_file(
        &self,
        root: &str,
        path: &str,
        welcome_file: &str,
        req: Request<AxumBody>,
    ) -> Result<Response<AxumBody>, FileSystemError> {
        let resolved = self.resolve_path(root, path, welcome_file).await?;
        let uri = hyper::Uri::try_from(resolved.as_str())
            .map_err(|_| FileSystemError::InvalidPath(resolved.clone()))?;

        let (parts, body) = req.into_parts();
        let mut new_req = Request::from_parts(parts, body);
        *new_req.uri_mut() = uri;

        let serve_dir = ServeDir::new(root).append_index_html_on_directories(false);

        let response = serve_dir
            .oneshot(new_req)
            .await
            .wrap_err("ServeDir failed to serve file")
            .map_err(|e| {
                FileSystemError::Io(std::io::Error::other(format!("ServeDir error: {e}")))
            })?;

        let (parts, tower_body) = response.into_parts();
        let axum_body = AxumBody::new(tower_body.map_err(|e| {
            tracing::error!("Error reading static file body: {}", e);
            axum::Error::new(e)
        }));

        Ok(Response::from_parts(parts, axum_body))
    }
}

#[cfg(test)]
mod tests {
    use hyper::StatusCode;
    use tempfile::TempDir;

    use super::*;

    async fn create_test_file(dir: &TempDir, path: &str, content: &str) -> std::io::Result<()> {
        let full_path = dir.path().join(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full_path, content).await
    }

    async fn serve(root: &TempDir, path: &str, welcome: &str) -> Result<(StatusCode, String), FileSystemError> {
        let req = Request::builder().uri(path).body(AxumBody::empty()).unwrap();
        let response = FileSystemAdapter::new()
            .serve_file(root.path().to_str().unwrap(), path, welcome, req)
            .await?;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        Ok((status, String::from_utf8_lossy(&bytes).into_owned()))
    }

    #[tokio::test]
    async fn test_serves_file() {
        let temp_dir = TempDir::new().unwrap();
        create_test_file(&temp_dir, "css/site.css", "body{}").await.unwrap();

        let (status, body) = serve(&temp_dir, "/css/site.css", "index.html").await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "body{}");
    }

    #[tokio::test]
    async fn test_directory_serves_welcome_file() {
        let temp_dir = TempDir::new().unwrap();
        create_test_file(&temp_dir, "home.html", "root").await.unwrap();
        create_test_file(&temp_dir, "docs/home.html", "docs").await.unwrap();

        assert_eq!(serve(&temp_dir, "/", "home.html").await.unwrap().1, "root");
        assert_eq!(serve(&temp_dir, "/docs", "home.html").await.unwrap().1, "docs");
        assert_eq!(serve(&temp_dir, "/docs/", "home.html").await.unwrap().1, "docs");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let (status, _) = serve(&temp_dir, "/nope.txt", "index.html").await.unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_path_traversal_protection() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("public");
        tokio::fs::create_dir_all(&root).await.unwrap();
        create_test_file(&temp_dir, "secret.txt", "s3cret").await.unwrap();

        let result = ensure_within_root(root.to_str().unwrap(), &root.join("../secret.txt"));
        assert!(matches!(result, Err(FileSystemError::OutsideRoot(_))));
    }
}
