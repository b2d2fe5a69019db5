use std::path::PathBuf;

use axum::Router;
use tokio::task::JoinHandle;
use tower_http::services::ServeFile;

use crate::net::VirtualListener;

/// Serves `path` for every request, with `Range` and content-type handling.
pub fn router(path: impl Into<PathBuf>) -> Router {
    Router::new().fallback_service(ServeFile::new(path.into()))
}

/// Runs the media server on `listener` until the listener is closed.
/// Requests already in flight are allowed to finish.
pub fn spawn(listener: VirtualListener, path: impl Into<PathBuf>) -> JoinHandle<()> {
    let path = path.into();
    tokio::spawn(async move {
        let shutdown = listener.closed();
        log::debug!("Serving {} over the stream listener", path.display());

        if let Err(e) = axum::serve(listener, router(path.clone()))
            .with_graceful_shutdown(shutdown)
            .await
        {
            log::warn!("Stream server for {} failed: {}", path.display(), e);
        }

        log::debug!("Stream server for {} stopped", path.display());
    })
}
