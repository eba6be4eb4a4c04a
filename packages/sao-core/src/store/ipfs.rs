//! IPFS backend over the Kubo HTTP RPC API.
//!
//! `add` pins the object, `cat` reads it back and `pin/rm` releases it. When a
//! project id is configured every call carries basic auth, as hosted pinning
//! gateways require.

use std::io::SeekFrom;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::object_store::{ObjectReader, ObjectStore, StoreInfo, StoreReceipt};
use crate::config::IpfsConfig;
use crate::error::{Error, Result};

const UPLOAD_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

/// Object store backed by an IPFS node
#[derive(Debug, Clone)]
pub struct IpfsStore {
    client: reqwest::Client,
    url: String,
    auth: Option<(String, String)>,
}

impl IpfsStore {
    /// Store talking to the RPC endpoint in `config`
    pub fn new(config: &IpfsConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let auth = if config.project_id.is_empty() {
            None
        } else {
            Some((config.project_id.clone(), config.project_secret.clone()))
        };
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(format!("{}/api/v0/{}", self.url, path));
        match &self.auth {
            Some((id, secret)) => builder.basic_auth(id, Some(secret)),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, call: &str) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("ipfs {}: {}", call, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ObjectStore(format!(
                "ipfs {} returned {}: {}",
                call,
                status,
                body.trim()
            )));
        }
        Ok(response)
    }
}

/// Pump `reader` into a channel the request body streams from
fn body_from_reader(mut reader: ObjectReader) -> reqwest::Body {
    let (mut tx, rx) = futures::channel::mpsc::channel::<std::io::Result<Vec<u8>>>(4);
    tokio::spawn(async move {
        loop {
            let mut buf = vec![0u8; UPLOAD_BUFFER_SIZE];
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    if tx.send(Ok(buf)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    reqwest::Body::wrap_stream(rx)
}

#[async_trait]
impl ObjectStore for IpfsStore {
    async fn store_file(&self, reader: ObjectReader, info: &StoreInfo) -> Result<StoreReceipt> {
        let part = Part::stream_with_length(body_from_reader(reader), info.size)
            .file_name(info.filename.clone());
        let form = Form::new().part("file", part);

        let response = self
            .send(self.post("add?pin=true").multipart(form), "add")
            .await?;
        let added: AddResponse = response
            .json()
            .await
            .map_err(|e| Error::ObjectStore(format!("ipfs add: bad response: {}", e)))?;

        tracing::info!(file_id = %info.file_id, cid = %added.hash, size = info.size, "Added to IPFS");
        Ok(StoreReceipt {
            content_address: added.hash,
        })
    }

    async fn get_file(&self, content_address: &str) -> Result<ObjectReader> {
        let response = self
            .send(self.post("cat").query(&[("arg", content_address)]), "cat")
            .await?;

        // Spool to an anonymous file so the caller gets a plain reader.
        let spool = tempfile::tempfile()?;
        let mut file = tokio::fs::File::from_std(spool);
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::ObjectStore(format!("ipfs cat: {}", e)))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(Box::new(file))
    }

    async fn delete_file(&self, content_address: &str) -> Result<()> {
        self.send(self.post("pin/rm").query(&[("arg", content_address)]), "pin/rm")
            .await?;
        tracing::info!(cid = %content_address, "Unpinned from IPFS");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Bytes, extract::Query, http::HeaderMap, routing::post, Router};
    use std::collections::HashMap;

    async fn mock_node() -> String {
        let app = Router::new()
            .route(
                "/api/v0/add",
                post(|headers: HeaderMap, body: Bytes| async move {
                    assert!(headers.get("authorization").is_some());
                    let text = String::from_utf8_lossy(&body).to_string();
                    assert!(text.contains("chunk payload"));
                    r#"{"Name":"blob","Hash":"QmTestHash","Size":"13"}"#
                }),
            )
            .route(
                "/api/v0/cat",
                post(|Query(q): Query<HashMap<String, String>>| async move {
                    format!("content of {}", q.get("arg").cloned().unwrap_or_default())
                }),
            )
            .route(
                "/api/v0/pin/rm",
                post(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.get("arg").map(String::as_str) == Some("QmTestHash") {
                        (axum::http::StatusCode::OK, "{}")
                    } else {
                        (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "not pinned")
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn store(url: String) -> IpfsStore {
        IpfsStore::new(&IpfsConfig {
            url,
            project_id: "project".into(),
            project_secret: "secret".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_returns_hash() {
        let store = store(mock_node().await);
        let info = StoreInfo {
            file_id: "f".into(),
            filename: "blob".into(),
            size: 13,
        };
        let receipt = store
            .store_file(Box::new(&b"chunk payload"[..]), &info)
            .await
            .unwrap();
        assert_eq!(receipt.content_address, "QmTestHash");
    }

    #[tokio::test]
    async fn test_cat_spools_body() {
        let store = store(mock_node().await);
        let mut reader = store.get_file("QmAbc").await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "content of QmAbc");
    }

    #[tokio::test]
    async fn test_unpin_failure_reported() {
        let store = store(mock_node().await);
        store.delete_file("QmTestHash").await.unwrap();
        assert!(matches!(
            store.delete_file("QmOther").await,
            Err(Error::ObjectStore(msg)) if msg.contains("not pinned")
        ));
    }
}
