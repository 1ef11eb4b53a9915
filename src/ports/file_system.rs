use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FileSystemError {
    #[error("Static resource I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The request path resolves outside the mount root.
    #[error("Path escapes the resource root: {0}")]
    OutsideRoot(String),

    #[error("Cannot map '{0}' to a resource")]
    InvalidPath(String),
}

pub type FileSystemResult<T> = Result<T, FileSystemError>;

/// Read-only access to the directories behind static resource mounts.
///
/// `path` is relative to `root`. A path naming a directory (or ending in `/`)
/// is answered with `welcome_file` from that directory. The request is passed
/// through so conditional and range headers keep working.
#[async_trait]
pub trait FileSystem: Send + Sync + 'static {
    async fn serve_file(
        &self,
        root: &str,
        path: &str,
        welcome_file: &str,
        req: Request<AxumBody>,
    ) -> FileSystemResult<Response<AxumBody>>;
}
