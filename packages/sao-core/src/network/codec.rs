//! # Request-Response Codec
//!
//! One codec type serves both worker protocols. Each stream carries exactly
//! one JSON request and one response, with no length prefix: the writer
//! closes its half of the stream and the reader reads to end of stream.
//!
//! Reads are bounded by `max_message_size`, and inbound request reads are
//! also bounded by the read deadline. A request that fails either bound
//! or does not decode still reaches the worker as [`Frame::Malformed`] so
//! it can be refused, instead of resetting the stream.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, StreamProtocol};
use serde::{de::DeserializeOwned, Serialize};

use super::protocols::Frame;

/// Default read bound for one message (1 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default time allowed to read an inbound request
pub const DEFAULT_READ_DEADLINE: Duration = Duration::from_secs(10);

/// Encoding used for responses
///
/// Requests are always JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// `serde_json`
    #[default]
    Json,
    /// CBOR through `ciborium`
    Cbor,
}

// ============================================================================
// CODEC
// ============================================================================

/// Codec for one `Req`/`Resp` exchange
pub struct SaoCodec<Req, Resp> {
    format: WireFormat,
    max_message_size: usize,
    read_deadline: Duration,
    _marker: PhantomData<fn() -> (Req, Resp)>,
}

impl<Req, Resp> SaoCodec<Req, Resp> {
    /// Codec with explicit bounds
    pub fn new(format: WireFormat, max_message_size: usize, read_deadline: Duration) -> Self {
        Self {
            format,
            max_message_size,
            read_deadline,
            _marker: PhantomData,
        }
    }

    /// Response encoding in use
    pub fn format(&self) -> WireFormat {
        self.format
    }

    fn encode_response(&self, response: &Resp) -> std::io::Result<Vec<u8>>
    where
        Resp: Serialize,
    {
        let mut buf = Vec::new();
        match self.format {
            WireFormat::Json => serde_json::to_writer(&mut buf, response).map_err(invalid_data)?,
            WireFormat::Cbor => ciborium::into_writer(response, &mut buf).map_err(invalid_data)?,
        }
        Ok(buf)
    }

    fn decode_response(&self, bytes: &[u8]) -> std::io::Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        match self.format {
            WireFormat::Json => serde_json::from_slice(bytes).map_err(invalid_data),
            WireFormat::Cbor => ciborium::from_reader(bytes).map_err(invalid_data),
        }
    }
}

impl<Req, Resp> Default for SaoCodec<Req, Resp> {
    fn default() -> Self {
        Self::new(
            WireFormat::Json,
            DEFAULT_MAX_MESSAGE_SIZE,
            DEFAULT_READ_DEADLINE,
        )
    }
}

impl<Req, Resp> Clone for SaoCodec<Req, Resp> {
    fn clone(&self) -> Self {
        Self::new(self.format, self.max_message_size, self.read_deadline)
    }
}

impl<Req, Resp> std::fmt::Debug for SaoCodec<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaoCodec")
            .field("format", &self.format)
            .field("max_message_size", &self.max_message_size)
            .field("read_deadline", &self.read_deadline)
            .finish()
    }
}

#[async_trait]
impl<Req, Resp> request_response::Codec for SaoCodec<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Send + 'static,
    Resp: Serialize + DeserializeOwned + Send + 'static,
{
    type Protocol = StreamProtocol;
    type Request = Frame<Req>;
    type Response = Resp;

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let read = tokio::time::timeout(self.read_deadline, read_bounded(io, self.max_message_size));
        let bytes = match read.await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Ok(Frame::Malformed(e.to_string()))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(Frame::Malformed("read deadline exceeded".into())),
        };

        Ok(match serde_json::from_slice(&bytes) {
            Ok(request) => Frame::Valid(request),
            Err(e) => Frame::Malformed(e.to_string()),
        })
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let bytes = read_bounded(io, self.max_message_size).await?;
        self.decode_response(&bytes)
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        request: Self::Request,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let request = match request {
            Frame::Valid(request) => request,
            Frame::Malformed(reason) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("refusing to send malformed request: {}", reason),
                ))
            }
        };
        let bytes = serde_json::to_vec(&request).map_err(invalid_data)?;
        write_bounded(io, &bytes, self.max_message_size).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        response: Self::Response,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let bytes = self.encode_response(&response)?;
        write_bounded(io, &bytes, self.max_message_size).await
    }
}

// ============================================================================
// STREAM HELPERS
// ============================================================================

/// Read to end of stream, failing with `InvalidData` past `max` bytes
async fn read_bounded<T>(io: &mut T, max: usize) -> std::io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    io.take(max as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > max {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Message too large (max {} bytes)", max),
        ));
    }
    Ok(buf)
}

async fn write_bounded<T>(io: &mut T, bytes: &[u8], max: usize) -> std::io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    if bytes.len() > max {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "Serialized message too large: {} bytes (max {})",
                bytes.len(),
                max
            ),
        ));
    }
    io.write_all(bytes).await?;
    io.flush().await?;
    Ok(())
}

fn invalid_data<E: std::fmt::Display>(e: E) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocols::{
        FileEncryptRequest, FileEncryptResponse, ENCRYPT_PROTOCOL,
    };
    use crate::transfer::http_descriptor;
    use futures::io::Cursor;
    use libp2p::request_response::Codec;

    type TestCodec = SaoCodec<FileEncryptRequest, FileEncryptResponse>;

    fn protocol() -> StreamProtocol {
        StreamProtocol::new(ENCRYPT_PROTOCOL)
    }

    fn request() -> FileEncryptRequest {
        FileEncryptRequest {
            file_id: "f1".into(),
            client_id: "client".into(),
            offset: 28,
            size: 100,
            transfer: http_descriptor("http://orchestrator/api/v1/proc/file/f1_0", 100).unwrap(),
        }
    }

    fn response() -> FileEncryptResponse {
        FileEncryptResponse {
            file_key: "key-1".into(),
            transfer: http_descriptor("http://worker/api/v1/proc/encrypt/f1_28.encrypt", 128)
                .unwrap(),
            accepted: true,
        }
    }

    #[tokio::test]
    async fn test_request_over_stream() {
        let mut codec = TestCodec::default();
        let mut wire = Vec::new();
        codec
            .write_request(&protocol(), &mut wire, Frame::Valid(request()))
            .await
            .unwrap();

        // No length prefix, plain JSON
        assert_eq!(wire[0], b'{');

        let read = codec
            .read_request(&protocol(), &mut Cursor::new(wire))
            .await
            .unwrap();
        assert_eq!(read, Frame::Valid(request()));
    }

    #[tokio::test]
    async fn test_garbage_request_is_malformed() {
        let mut codec = TestCodec::default();
        let read = codec
            .read_request(&protocol(), &mut Cursor::new(b"not json".to_vec()))
            .await
            .unwrap();
        assert!(matches!(read, Frame::Malformed(_)));
    }

    #[tokio::test]
    async fn test_oversized_request_is_malformed() {
        let mut codec = TestCodec::new(WireFormat::Json, 16, DEFAULT_READ_DEADLINE);
        let read = codec
            .read_request(&protocol(), &mut Cursor::new(vec![b' '; 64]))
            .await
            .unwrap();
        assert!(matches!(read, Frame::Malformed(msg) if msg.contains("too large")));
    }

    #[tokio::test]
    async fn test_malformed_frame_not_sent() {
        let mut codec = TestCodec::default();
        let mut wire = Vec::new();
        let result = codec
            .write_request(&protocol(), &mut wire, Frame::Malformed("x".into()))
            .await;
        assert!(result.is_err());
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_cbor_response() {
        let mut codec = TestCodec::new(WireFormat::Cbor, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_DEADLINE);
        let mut wire = Vec::new();
        codec
            .write_response(&protocol(), &mut wire, response())
            .await
            .unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&wire).is_err());

        let read = codec
            .read_response(&protocol(), &mut Cursor::new(wire))
            .await
            .unwrap();
        assert_eq!(read, response());
    }

    #[tokio::test]
    async fn test_undecodable_response_is_error() {
        let mut codec = TestCodec::default();
        let result = codec
            .read_response(&protocol(), &mut Cursor::new(b"[1,2".to_vec()))
            .await;
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::InvalidData);
    }
}
