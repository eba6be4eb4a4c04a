//! Transfers between nodes that share a filesystem.
//!
//! Descriptors still carry the HTTP URL a node advertised, but the bytes are
//! copied straight out of the directory mounted behind that URL.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::types::HttpRequest;
use super::{TransferHandle, Transport, TransportEvent, TransportFileInfo, EVENT_CHANNEL_SIZE};
use crate::context::Context;
use crate::crypto::partial_path;
use crate::error::{Error, Result};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Resolves advertised URLs against local directories
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    routes: RwLock<Vec<(String, PathBuf)>>,
}

impl LoopbackTransport {
    /// Transport with no routes
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve URLs starting with `prefix` from `dir`
    pub fn mount(&self, prefix: impl Into<String>, dir: impl Into<PathBuf>) {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let mut routes = self.routes.write();
        routes.push((prefix, dir.into()));
        // Longest prefix wins
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Local file behind `url`
    pub fn resolve(&self, url: &str) -> Result<PathBuf> {
        let routes = self.routes.read();
        for (prefix, dir) in routes.iter() {
            if let Some(name) = url.strip_prefix(prefix.as_str()) {
                let relative = Path::new(name);
                let safe = relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
                if name.is_empty() || !safe {
                    return Err(Error::Transfer(format!("invalid path in {}", url)));
                }
                return Ok(dir.join(relative));
            }
        }
        Err(Error::Transfer(format!("no local route for {}", url)))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn execute(
        &self,
        _ctx: &Context,
        params: &[u8],
        dest: &TransportFileInfo,
    ) -> Result<TransferHandle> {
        let request = HttpRequest::from_params(params)?;
        let source = self.resolve(&request.url)?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let dest = dest.clone();
        let task = tokio::spawn(async move {
            let mut received = 0u64;
            if let Err(e) = copy(&source, &dest, &tx, &mut received).await {
                let _ = tx.send(TransportEvent::failed(received, e)).await;
            }
        });
        Ok(TransferHandle::new(rx, task))
    }
}

async fn copy(
    source: &Path,
    dest: &TransportFileInfo,
    tx: &mpsc::Sender<TransportEvent>,
    received: &mut u64,
) -> Result<()> {
    let mut input = tokio::fs::File::open(source)
        .await
        .map_err(|e| Error::Transfer(format!("{}: {}", source.display(), e)))?;
    let tmp = partial_path(&dest.output_file);
    let mut output = tokio::fs::File::create(&tmp).await?;

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n]).await?;
        *received += n as u64;
        let _ = tx.send(TransportEvent::progress(*received)).await;
    }
    output.flush().await?;
    output.sync_all().await?;
    drop(output);
    tokio::fs::rename(&tmp, &dest.output_file).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{http_descriptor, transfer_file};

    #[test]
    fn test_resolve_longest_prefix() {
        let transport = LoopbackTransport::new();
        transport.mount("http://node-a/api/v1/proc", "/srv/a");
        transport.mount("http://node-a/api/v1/proc/file", "/srv/a-files");

        assert_eq!(
            transport.resolve("http://node-a/api/v1/proc/file/x_0").unwrap(),
            PathBuf::from("/srv/a-files/x_0")
        );
        assert_eq!(
            transport.resolve("http://node-a/api/v1/proc/encrypt/x").unwrap(),
            PathBuf::from("/srv/a/encrypt/x")
        );
        assert!(transport.resolve("http://node-b/whatever").is_err());
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let transport = LoopbackTransport::new();
        transport.mount("http://node-a/files", "/srv/a");
        assert!(transport.resolve("http://node-a/files/../secret").is_err());
        assert!(transport.resolve("http://node-a/files/").is_err());
    }

    #[tokio::test]
    async fn test_loopback_copy() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("part_0"), vec![3u8; 200_000]).unwrap();

        let transport = LoopbackTransport::new();
        transport.mount("http://orchestrator/api/v1/proc/file", src.path());

        let descriptor =
            http_descriptor("http://orchestrator/api/v1/proc/file/part_0", 200_000).unwrap();
        let out = dst.path().join("pulled");
        transfer_file(&Context::background(), &transport, &descriptor, "f", &out)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&out).unwrap(), vec![3u8; 200_000]);
    }

    #[tokio::test]
    async fn test_loopback_missing_source() {
        let dst = tempfile::tempdir().unwrap();
        let transport = LoopbackTransport::new();
        transport.mount("http://orchestrator/files", dst.path());

        let descriptor = http_descriptor("http://orchestrator/files/nothing", 10).unwrap();
        let result = transfer_file(
            &Context::background(),
            &transport,
            &descriptor,
            "f",
            &dst.path().join("out"),
        )
        .await;
        assert!(matches!(result, Err(Error::Transfer(_))));
    }
}
