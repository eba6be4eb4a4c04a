//! HTTP file server for staged chunks.
//!
//! Transfer descriptors handed to peers point here:
//!
//! ```text
//!  <context>/api/v1/proc/encrypt/<name>   worker: sealed chunks
//!  <context>/api/v1/proc/decrypt/<name>   worker: opened chunks
//!  <context>/api/v1/proc/file/<name>      orchestrator: chunks it hands out
//!  <context>/health
//! ```

use std::path::Path;

use axum::{routing::get, Router};
use tower_http::services::ServeDir;

/// Router serving both staging directories below `context_path`
pub fn file_router(proc_stage: &Path, store_stage: &Path, context_path: &str) -> Router {
    let api = Router::new()
        .nest_service("/api/v1/proc/encrypt", ServeDir::new(proc_stage))
        .nest_service("/api/v1/proc/decrypt", ServeDir::new(proc_stage))
        .nest_service("/api/v1/proc/file", ServeDir::new(store_stage))
        .route("/health", get(|| async { "ok" }));

    let prefix = context_path.trim_matches('/');
    if prefix.is_empty() {
        api
    } else {
        Router::new().nest(&format!("/{}", prefix), api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_serves_both_stages() {
        let proc_stage = tempfile::tempdir().unwrap();
        let store_stage = tempfile::tempdir().unwrap();
        std::fs::write(proc_stage.path().join("f_0.encrypt"), b"sealed").unwrap();
        std::fs::write(store_stage.path().join("f_doc_0"), b"plain").unwrap();

        let base = start(file_router(proc_stage.path(), store_stage.path(), "")).await;

        let sealed = reqwest::get(format!("{}/api/v1/proc/encrypt/f_0.encrypt", base))
            .await
            .unwrap();
        assert!(sealed.status().is_success());
        assert_eq!(sealed.bytes().await.unwrap().as_ref(), b"sealed");

        let plain = reqwest::get(format!("{}/api/v1/proc/file/f_doc_0", base))
            .await
            .unwrap();
        assert_eq!(plain.bytes().await.unwrap().as_ref(), b"plain");

        let missing = reqwest::get(format!("{}/api/v1/proc/file/f_0.encrypt", base))
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_context_path_prefix() {
        let stage = tempfile::tempdir().unwrap();
        let base = start(file_router(stage.path(), stage.path(), "/sao/")).await;

        let health = reqwest::get(format!("{}/sao/health", base)).await.unwrap();
        assert!(health.status().is_success());

        let unprefixed = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(unprefixed.status().as_u16(), 404);
    }
}
