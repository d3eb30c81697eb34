//! Request descriptors and request payloads.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Error, Result};

/// Chunk size used when moving streaming bodies.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Connect/read timeout pair.
///
/// `read` bounds every wait for the peer: a request fails once it has made no
/// progress for that long, however long the whole transfer takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeout {
    pub connect: Duration,
    pub read: Duration,
}

impl Timeout {
    pub const fn new(connect: Duration, read: Duration) -> Self {
        Self { connect, read }
    }
}

/// One HTTP request, ready to be sent (possibly several times).
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub payload: Payload,
    /// Hint that the response body will be consumed incrementally.
    pub stream: bool,
    pub timeout: Option<Timeout>,
    /// Statuses counted as success. Empty means any 2xx.
    pub success_codes: Vec<u16>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            payload: Payload::Empty,
            stream: false,
            timeout: None,
            success_codes: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a header given as strings.
    pub fn header_str(self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("invalid header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidRequest(format!("invalid value for header {}: {}", name, e)))?;
        Ok(self.header(name, value))
    }

    /// Merges `headers` over the existing ones; later values win.
    pub fn headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn timeout(mut self, timeout: Option<Timeout>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn success_codes(mut self, codes: &[u16]) -> Self {
        self.success_codes = codes.to_vec();
        self
    }

    pub fn is_success(&self, status: u16) -> bool {
        if self.success_codes.is_empty() {
            (200..300).contains(&status)
        } else {
            self.success_codes.contains(&status)
        }
    }
}

/// Request body.
#[derive(Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Bytes(Bytes),
    Stream(StreamPayload),
}

impl Payload {
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| Error::InvalidRequest(format!("failed to encode JSON body: {}", e)))?;
        Ok(Payload::Bytes(Bytes::from(body)))
    }

    /// Whether the payload can be sent again from its starting position.
    pub fn is_rewindable(&self) -> bool {
        match self {
            Payload::Stream(stream) => stream.is_rewindable(),
            _ => true,
        }
    }

    /// Resets a streaming payload to where the first attempt started.
    pub fn rewind(&self) -> io::Result<()> {
        match self {
            Payload::Stream(stream) => stream.rewind(),
            _ => Ok(()),
        }
    }

    /// Body length, when known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            Payload::Empty => Some(0),
            Payload::Bytes(bytes) => Some(bytes.len() as u64),
            Payload::Stream(stream) => stream.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<StreamPayload> for Payload {
    fn from(stream: StreamPayload) -> Self {
        Payload::Stream(stream)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => write!(f, "Empty"),
            Payload::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Payload::Stream(stream) => fmt::Debug::fmt(stream, f),
        }
    }
}

trait SeekRead: Read + Seek + Send {}

impl<T: Read + Seek + Send> SeekRead for T {}

type ReaderFactory = dyn Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync;

#[derive(Clone)]
enum Source {
    Seekable {
        reader: Arc<Mutex<Box<dyn SeekRead>>>,
        origin: u64,
    },
    Factory(Arc<ReaderFactory>),
    OneShot(Arc<Mutex<Option<Box<dyn Read + Send>>>>),
}

/// A streaming request body.
///
/// Clones share the underlying source, so a request can be cloned into a
/// backend while the executor keeps the ability to rewind it.
#[derive(Clone)]
pub struct StreamPayload {
    source: Source,
    len: Option<u64>,
}

impl StreamPayload {
    /// Streams from a seekable reader, starting at its current position.
    /// Retries seek back to that position.
    pub fn seekable<R>(mut reader: R) -> io::Result<Self>
    where
        R: Read + Seek + Send + 'static,
    {
        let origin = reader.stream_position()?;
        let end = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(origin))?;

        let reader: Box<dyn SeekRead> = Box::new(reader);
        Ok(Self {
            source: Source::Seekable {
                reader: Arc::new(Mutex::new(reader)),
                origin,
            },
            len: Some(end.saturating_sub(origin)),
        })
    }

    /// Streams from a fresh reader produced for every attempt.
    pub fn factory<F, R>(factory: F) -> Self
    where
        F: Fn() -> io::Result<R> + Send + Sync + 'static,
        R: Read + Send + 'static,
    {
        Self {
            source: Source::Factory(Arc::new(move || {
                factory().map(|reader| Box::new(reader) as Box<dyn Read + Send>)
            })),
            len: None,
        }
    }

    /// Streams from a reader that can only be consumed once. Requests carrying
    /// it are never retried.
    pub fn one_shot<R>(reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        let reader: Box<dyn Read + Send> = Box::new(reader);
        Self {
            source: Source::OneShot(Arc::new(Mutex::new(Some(reader)))),
            len: None,
        }
    }

    /// Declares the body length (sent as `Content-Length`).
    pub fn with_len(mut self, len: u64) -> Self {
        self.len = Some(len);
        self
    }

    pub fn len(&self) -> Option<u64> {
        self.len
    }

    pub fn is_rewindable(&self) -> bool {
        !matches!(self.source, Source::OneShot(_))
    }

    pub fn rewind(&self) -> io::Result<()> {
        match &self.source {
            Source::Seekable { reader, origin } => {
                lock(reader)?.seek(SeekFrom::Start(*origin))?;
                Ok(())
            }
            Source::Factory(_) => Ok(()),
            Source::OneShot(reader) => {
                if lock(reader)?.is_some() {
                    Ok(())
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "one-shot payload was already consumed",
                    ))
                }
            }
        }
    }

    /// Opens a reader over the body for one attempt.
    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.source {
            Source::Seekable { reader, .. } => Ok(Box::new(SharedReader {
                inner: Arc::clone(reader),
            })),
            Source::Factory(factory) => factory(),
            Source::OneShot(reader) => lock(reader)?.take().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    "one-shot payload was already consumed",
                )
            }),
        }
    }
}

impl fmt::Debug for StreamPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::Seekable { .. } => "seekable",
            Source::Factory(_) => "factory",
            Source::OneShot(_) => "one-shot",
        };
        f.debug_struct("StreamPayload")
            .field("source", &source)
            .field("len", &self.len)
            .finish()
    }
}

struct SharedReader {
    inner: Arc<Mutex<Box<dyn SeekRead>>>,
}

impl Read for SharedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        lock(&self.inner)?.read(buf)
    }
}

fn lock<T: ?Sized>(mutex: &Arc<Mutex<T>>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::other("payload lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(stream: &StreamPayload) -> Vec<u8> {
        let mut out = Vec::new();
        stream.open().unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_is_success_defaults_to_2xx() {
        let request = Request::get("http://localhost/");
        assert!(request.is_success(200));
        assert!(request.is_success(204));
        assert!(!request.is_success(302));
        assert!(!request.is_success(404));

        let request = request.success_codes(&[201]);
        assert!(request.is_success(201));
        assert!(!request.is_success(200));
    }

    #[test]
    fn test_header_str_rejects_invalid_value() {
        let result = Request::get("http://localhost/").header_str("X-Test", "bad\nvalue");
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let request = Request::get("http://localhost/")
            .header_str("Content-Type", "text/plain")
            .unwrap()
            .header_str("content-type", "application/json")
            .unwrap();

        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.headers["CONTENT-TYPE"], "application/json");
    }

    #[test]
    fn test_seekable_payload_rewinds_to_origin() {
        let mut cursor = Cursor::new(b"skip-payload".to_vec());
        cursor.set_position(5);

        let stream = StreamPayload::seekable(cursor).unwrap();
        assert_eq!(stream.len(), Some(7));

        assert_eq!(read_all(&stream), b"payload");
        assert!(read_all(&stream).is_empty());

        stream.rewind().unwrap();
        assert_eq!(read_all(&stream), b"payload");
    }

    #[test]
    fn test_factory_payload_opens_fresh_reader() {
        let stream = StreamPayload::factory(|| Ok(Cursor::new(b"abc".to_vec())));
        assert!(stream.is_rewindable());
        assert_eq!(read_all(&stream), b"abc");
        assert_eq!(read_all(&stream), b"abc");
    }

    #[test]
    fn test_one_shot_payload_is_not_rewindable() {
        let stream = StreamPayload::one_shot(Cursor::new(b"once".to_vec()));
        assert!(!stream.is_rewindable());
        assert!(!Payload::Stream(stream.clone()).is_rewindable());

        assert_eq!(read_all(&stream), b"once");
        assert!(stream.open().is_err());
        assert!(stream.rewind().is_err());
    }

    #[test]
    fn test_payload_len() {
        assert_eq!(Payload::Empty.len(), Some(0));
        assert_eq!(Payload::from(vec![1, 2, 3]).len(), Some(3));
        let stream = StreamPayload::one_shot(Cursor::new(Vec::new())).with_len(10);
        assert_eq!(Payload::from(stream).len(), Some(10));
    }
}
