//! Streaming HTTP pulls.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::{TransferHandle, Transport, TransportEvent, TransportFileInfo, EVENT_CHANNEL_SIZE};
use super::types::HttpRequest;
use crate::context::Context;
use crate::crypto::partial_path;
use crate::error::{Error, Result};

/// Pulls `"http"` descriptors with a GET request
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Transport with a default client
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    /// Transport sharing an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        _ctx: &Context,
        params: &[u8],
        dest: &TransportFileInfo,
    ) -> Result<TransferHandle> {
        let request = HttpRequest::from_params(params)?;
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let dest = dest.clone();
        let url = request.url;
        let task = tokio::spawn(async move {
            let mut received = 0u64;
            if let Err(e) = pull(builder, &dest, &tx, &mut received).await {
                tracing::debug!(url = %url, error = %e, "HTTP pull failed");
                let _ = tx.send(TransportEvent::failed(received, e)).await;
            }
        });

        Ok(TransferHandle::new(rx, task))
    }
}

async fn pull(
    builder: reqwest::RequestBuilder,
    dest: &TransportFileInfo,
    tx: &mpsc::Sender<TransportEvent>,
    received: &mut u64,
) -> Result<()> {
    let response = builder.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Transfer(format!("HTTP {}", status)));
    }

    let tmp = partial_path(&dest.output_file);
    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            *received += chunk.len() as u64;
            if *received > dest.file_size {
                return Err(Error::Transfer(format!(
                    "body exceeds expected {} bytes",
                    dest.file_size
                )));
            }
            file.write_all(&chunk).await?;
            let _ = tx.send(TransportEvent::progress(*received)).await;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok::<(), Error>(())
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    tokio::fs::rename(&tmp, &dest.output_file).await?;
    Ok(())
}
