//! Length-delimited, self-describing frames over a byte stream.
//!
//! A frame is a 4-byte big-endian length followed by a JSON body. Enum
//! values carry their variant tag in the body, so a decoder holding only the
//! closed type registry rebuilds the concrete variant; an unrecognized tag
//! is a decode error. One [`Framer::receive`] consumes exactly one logical
//! value and leaves the stream positioned at the next frame.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::Result;

/// Upper bound on a single frame body; results carry whole files, so this is
/// generous, but a stream that claims more is corrupt.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("stream ended mid-frame")]
    Truncated,

    #[error("frame of {0} bytes exceeds the wire limit")]
    FrameTooLarge(usize),
}

/// Value <-> bytes packaging, kept behind a trait so the body encoding can
/// change without touching the framing.
pub trait Packager {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes>;
    fn decode<'de, T: Deserialize<'de>>(&self, bytes: &'de Bytes) -> Result<T>;
}

#[derive(Debug, Default)]
pub struct JsonPackager;

impl Packager for JsonPackager {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        Ok(serde_json::to_vec(value)?.into())
    }

    fn decode<'de, T: Deserialize<'de>>(&self, bytes: &'de Bytes) -> Result<T> {
        let decoded = serde_json::from_slice(bytes)?;
        Ok(decoded)
    }
}

/// Single-shot stream operations, the shape the reactor provides: one call,
/// one underlying transfer, however short. Exact-length loops live in the
/// [`Framer`], not here.
#[async_trait]
pub trait ByteStream: Send {
    async fn recv(&mut self, buf: Vec<u8>) -> Result<(usize, Vec<u8>)>;
    async fn send(&mut self, buf: Vec<u8>) -> Result<(usize, Vec<u8>)>;
}

/// Encodes and decodes framed protocol values over a [`ByteStream`].
pub struct Framer<S, P = JsonPackager> {
    stream: S,
    packager: P,
}

impl<S: ByteStream> Framer<S> {
    pub fn new(stream: S) -> Self {
        Framer {
            stream,
            packager: JsonPackager,
        }
    }
}

impl<S: ByteStream, P: Packager> Framer<S, P> {
    pub fn with_packager(stream: S, packager: P) -> Self {
        Framer { stream, packager }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Encodes `value` into one frame and writes the whole frame out.
    pub async fn send<M: Serialize>(&mut self, value: &M) -> Result<()> {
        let body = self.packager.encode(value)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(body.len()).into());
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        self.write_all(frame).await
    }

    /// Reads exactly one frame and decodes it. A stream that ends mid-frame
    /// is truncated, and a body that is not a known value is a decode error.
    pub async fn receive<M: DeserializeOwned>(&mut self) -> Result<M> {
        let header = self.read_exact(4).await?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(len).into());
        }
        let body = Bytes::from(self.read_exact(len).await?);
        self.packager.decode(&body)
    }

    async fn write_all(&mut self, mut buf: Vec<u8>) -> Result<()> {
        while !buf.is_empty() {
            let (n, mut rest) = self.stream.send(buf).await?;
            if n == 0 {
                return Err(WireError::Truncated.into());
            }
            rest.drain(..n);
            buf = rest;
        }
        Ok(())
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let want = len - out.len();
            let (n, chunk) = self.stream.recv(vec![0u8; want]).await?;
            if n == 0 {
                return Err(WireError::Truncated.into());
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::{Command, CommandResult, Request},
        RingtailError,
    };

    /// In-memory stream delivering at most `chunk` bytes per call, to make
    /// the short-read/short-write loops do real work.
    struct MemStream {
        input: Vec<u8>,
        pos: usize,
        output: Vec<u8>,
        chunk: usize,
    }

    impl MemStream {
        fn new(input: Vec<u8>, chunk: usize) -> Self {
            MemStream {
                input,
                pos: 0,
                output: Vec::new(),
                chunk,
            }
        }
    }

    #[async_trait]
    impl ByteStream for MemStream {
        async fn recv(&mut self, mut buf: Vec<u8>) -> Result<(usize, Vec<u8>)> {
            let n = buf.len().min(self.chunk).min(self.input.len() - self.pos);
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Ok((n, buf))
        }

        async fn send(&mut self, buf: Vec<u8>) -> Result<(usize, Vec<u8>)> {
            let n = buf.len().min(self.chunk);
            self.output.extend_from_slice(&buf[..n]);
            Ok((n, buf))
        }
    }

    async fn roundtrip<M>(value: &M) -> M
    where
        M: Serialize + DeserializeOwned,
    {
        let mut tx = Framer::new(MemStream::new(Vec::new(), 3));
        tx.send(value).await.unwrap();
        let encoded = tx.into_inner().output;
        let mut rx = Framer::new(MemStream::new(encoded, 3));
        rx.receive().await.unwrap()
    }

    #[tokio::test]
    async fn request_variants_roundtrip() {
        let requests = vec![
            Request::ListCommands {
                agent_id: "machine-a".into(),
            },
            Request::ReportResults {
                agent_id: "machine-a".into(),
                results: vec![
                    CommandResult::success("c1", b"output".to_vec()),
                    CommandResult::failure("c2", "no such file"),
                ],
            },
            Request::ReadFile {
                agent_id: "machine-b".into(),
                path: "/etc/hostname".into(),
            },
        ];
        for request in requests {
            assert_eq!(roundtrip(&request).await, request);
        }
    }

    #[tokio::test]
    async fn command_sequence_keeps_order_and_variants() {
        let batch = vec![
            Command::ReadFile {
                id: "r1".into(),
                path: "/tmp/a".into(),
            },
            Command::ReadFile {
                id: "r2".into(),
                path: "/tmp/b".into(),
            },
        ];
        assert_eq!(roundtrip(&batch).await, batch);
    }

    #[tokio::test]
    async fn consecutive_frames_decode_independently() {
        let mut tx = Framer::new(MemStream::new(Vec::new(), 7));
        tx.send(&Request::ListCommands {
            agent_id: "a".into(),
        })
        .await
        .unwrap();
        tx.send(&Request::ReadFile {
            agent_id: "a".into(),
            path: "/x".into(),
        })
        .await
        .unwrap();
        let mut rx = Framer::new(MemStream::new(tx.into_inner().output, 7));
        let first: Request = rx.receive().await.unwrap();
        let second: Request = rx.receive().await.unwrap();
        assert!(matches!(first, Request::ListCommands { .. }));
        assert!(matches!(second, Request::ReadFile { .. }));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let mut tx = Framer::new(MemStream::new(Vec::new(), 64));
        tx.send(&Request::ListCommands {
            agent_id: "machine-a".into(),
        })
        .await
        .unwrap();
        let mut encoded = tx.into_inner().output;
        encoded.truncate(encoded.len() - 5);
        let mut rx = Framer::new(MemStream::new(encoded, 64));
        let err = rx.receive::<Request>().await.unwrap_err();
        assert!(matches!(err, RingtailError::Wire(WireError::Truncated)));
    }

    #[tokio::test]
    async fn unknown_variant_tag_is_rejected() {
        let body = br#"{"SelfDestruct":{"id":"x"}}"#;
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        let mut rx = Framer::new(MemStream::new(frame, 64));
        let err = rx.receive::<Command>().await.unwrap_err();
        assert!(matches!(err, RingtailError::Conversion(_)));
    }

    #[tokio::test]
    async fn oversize_length_prefix_is_rejected() {
        let frame = (u32::MAX).to_be_bytes().to_vec();
        let mut rx = Framer::new(MemStream::new(frame, 64));
        let err = rx.receive::<Request>().await.unwrap_err();
        assert!(matches!(
            err,
            RingtailError::Wire(WireError::FrameTooLarge(_))
        ));
    }
}
