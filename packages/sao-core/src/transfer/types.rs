//! Transfer descriptors and progress events.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Descriptor kind handled by the HTTP transports
pub const HTTP_KIND: &str = "http";

/// Capability describing how to pull one byte range
///
/// Field names match the JSON envelopes exchanged with other nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    /// Transfer kind, e.g. `"http"`
    #[serde(rename = "Type")]
    pub kind: String,
    /// Optional id supplied by the requesting client
    #[serde(rename = "ClientID", default)]
    pub client_id: String,
    /// Kind-specific parameters, base64 in JSON
    #[serde(rename = "Params", default, with = "params_base64")]
    pub params: Vec<u8>,
    /// Number of bytes the pull yields
    #[serde(rename = "Size")]
    pub size: u64,
}

/// Parameters of an `"http"` descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// URL to GET
    #[serde(rename = "URL")]
    pub url: String,
    /// Extra request headers, e.g. `Authorization`
    #[serde(rename = "Headers", default, deserialize_with = "null_as_empty")]
    pub headers: HashMap<String, String>,
}

impl HttpRequest {
    /// Decode from descriptor params
    pub fn from_params(params: &[u8]) -> Result<Self> {
        serde_json::from_slice(params)
            .map_err(|e| Error::Decode(format!("invalid http transfer params: {}", e)))
    }
}

/// Build an `"http"` descriptor for `size` bytes at `url`
pub fn http_descriptor(url: impl Into<String>, size: u64) -> Result<TransferDescriptor> {
    let request = HttpRequest {
        url: url.into(),
        headers: HashMap::new(),
    };
    Ok(TransferDescriptor {
        kind: HTTP_KIND.to_string(),
        client_id: String::new(),
        params: serde_json::to_vec(&request)?,
        size,
    })
}

/// Where a transfer writes and how much it expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFileInfo {
    /// Destination path
    pub output_file: PathBuf,
    /// File the bytes belong to, for logging
    pub file_id: String,
    /// Expected number of bytes
    pub file_size: u64,
}

/// Progress report from a running transfer
#[derive(Debug)]
pub struct TransportEvent {
    /// Total bytes received so far
    pub bytes_received: u64,
    /// Set when the transfer failed; the stream ends after it
    pub error: Option<Error>,
}

impl TransportEvent {
    /// Progress without error
    pub fn progress(bytes_received: u64) -> Self {
        Self {
            bytes_received,
            error: None,
        }
    }

    /// Terminal failure
    pub fn failed(bytes_received: u64, error: Error) -> Self {
        Self {
            bytes_received,
            error: Some(error),
        }
    }
}

/// Lifecycle of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Handle created, no bytes yet
    Started,
    /// Bytes are arriving
    Ongoing,
    /// Every byte arrived
    Completed,
    /// Error, cancellation or deadline
    Failed,
}

impl TransferStatus {
    /// Whether the transfer can still change state
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

mod params_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_wire_names() {
        let descriptor = http_descriptor("http://node/api/v1/proc/file/a_0", 42).unwrap();
        let json: serde_json::Value = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(json["Type"], "http");
        assert_eq!(json["Size"], 42);
        assert_eq!(json["ClientID"], "");
        assert!(json["Params"].is_string());

        let back: TransferDescriptor = serde_json::from_value(json).unwrap();
        let request = HttpRequest::from_params(&back.params).unwrap();
        assert_eq!(request.url, "http://node/api/v1/proc/file/a_0");
    }

    #[test]
    fn test_null_params_accepted() {
        let descriptor: TransferDescriptor =
            serde_json::from_str(r#"{"Type":"","ClientID":"","Params":null,"Size":0}"#).unwrap();
        assert!(descriptor.params.is_empty());
        assert_eq!(descriptor, TransferDescriptor::default());
    }

    #[test]
    fn test_http_request_decodes_go_params() {
        // Go encodes an unset map as null
        let request =
            HttpRequest::from_params(br#"{"URL":"http://10.0.0.5:5151/x","Headers":null}"#)
                .unwrap();
        assert!(request.headers.is_empty());

        let request = HttpRequest::from_params(br#"{"URL":"http://10.0.0.5:5151/x"}"#).unwrap();
        assert_eq!(request.url, "http://10.0.0.5:5151/x");
    }

    #[test]
    fn test_status_terminal() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(!TransferStatus::Ongoing.is_terminal());
    }
}
