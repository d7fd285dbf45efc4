//! Where stream data comes from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_channel::mpsc;
use futures_util::future::{self, LocalBoxFuture};
use futures_util::stream::{self, LocalBoxStream, StreamExt};
use futures_util::FutureExt;
use thiserror::Error;

use crate::message::StreamRequest;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("no stream source for {url}")]
    NotFound { url: String },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("stream transport failed: {0}")]
    Transport(String),
}

pub type ChunkStream = LocalBoxStream<'static, Result<Vec<u8>, SourceError>>;

/// Opens streams on behalf of the task worker.
///
/// Sources are shared with the worker thread, but the streams they return are only ever polled
/// on that thread.
pub trait StreamSource: Send + Sync {
    fn open(
        &self,
        request: StreamRequest,
    ) -> LocalBoxFuture<'static, Result<ChunkStream, SourceError>>;
}

enum Entry {
    /// Served in full on every open.
    Chunks(Vec<Vec<u8>>),
    /// Fed by a [`ChunkSender`]; served once.
    Live(mpsc::UnboundedReceiver<Result<Vec<u8>, SourceError>>),
    Fail(String),
}

/// In-process source keyed by URL.
#[derive(Clone, Default)]
pub struct MemorySource {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, chunks: Vec<Vec<u8>>) {
        self.entries().insert(url.into(), Entry::Chunks(chunks));
    }

    /// Opening `url` fails with [`SourceError::Transport`].
    pub fn insert_failing(&self, url: impl Into<String>, message: impl Into<String>) {
        self.entries().insert(url.into(), Entry::Fail(message.into()));
    }

    /// Serve `url` from chunks pushed later through the returned sender.
    pub fn insert_live(&self, url: impl Into<String>) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded();
        self.entries().insert(url.into(), Entry::Live(rx));
        ChunkSender { tx }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamSource for MemorySource {
    fn open(
        &self,
        request: StreamRequest,
    ) -> LocalBoxFuture<'static, Result<ChunkStream, SourceError>> {
        let mut entries = self.entries();
        let opened = match entries.get(&request.url) {
            None => Err(SourceError::NotFound { url: request.url }),
            Some(Entry::Fail(message)) => Err(SourceError::Transport(message.clone())),
            Some(Entry::Chunks(chunks)) => {
                Ok(stream::iter(chunks.clone().into_iter().map(Ok)).boxed_local())
            }
            Some(Entry::Live(_)) => match entries.remove(&request.url) {
                Some(Entry::Live(rx)) => Ok(rx.boxed_local()),
                _ => Err(SourceError::NotFound { url: request.url }),
            },
        };
        future::ready(opened).boxed_local()
    }
}

/// Producer half of a live [`MemorySource`] entry. Dropping it ends the stream.
#[derive(Debug, Clone)]
pub struct ChunkSender {
    tx: mpsc::UnboundedSender<Result<Vec<u8>, SourceError>>,
}

impl ChunkSender {
    pub fn send(&self, chunk: Vec<u8>) {
        // A closed receiver means the stream was abandoned.
        let _ = self.tx.unbounded_send(Ok(chunk));
    }

    pub fn fail(&self, message: impl Into<String>) {
        let _ = self
            .tx
            .unbounded_send(Err(SourceError::Transport(message.into())));
    }
}

#[cfg(feature = "http")]
pub use http::HttpSource;

#[cfg(feature = "http")]
mod http {
    use futures_util::future::LocalBoxFuture;
    use futures_util::{FutureExt, StreamExt};

    use super::{ChunkStream, SourceError, StreamSource};
    use crate::message::StreamRequest;

    fn transport(err: impl std::fmt::Display) -> SourceError {
        SourceError::Transport(err.to_string())
    }

    /// Streams response bodies of real HTTP requests.
    #[derive(Debug, Clone, Default)]
    pub struct HttpSource {
        client: reqwest::Client,
    }

    impl HttpSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    impl StreamSource for HttpSource {
        fn open(
            &self,
            request: StreamRequest,
        ) -> LocalBoxFuture<'static, Result<ChunkStream, SourceError>> {
            let client = self.client.clone();
            async move {
                let method =
                    reqwest::Method::from_bytes(request.method.as_bytes()).map_err(transport)?;
                let mut builder = client
                    .request(method, request.url.as_str())
                    .body(request.body);
                for (name, value) in &request.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                let response = builder.send().await.map_err(transport)?;
                let status = response.status();
                if !status.is_success() {
                    return Err(SourceError::Status {
                        url: request.url,
                        status: status.as_u16(),
                    });
                }
                let chunks = response
                    .bytes_stream()
                    .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(transport));
                Ok(chunks.boxed_local())
            }
            .boxed_local()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready<T>(f: impl core::future::Future<Output = T>) -> T {
        f.now_or_never().expect("memory sources never pend")
    }

    #[test]
    fn memory_source_serves_chunks_and_reports_missing_urls() {
        let source = MemorySource::new();
        source.insert("mem://a", vec![b"ab".to_vec(), b"c".to_vec()]);

        let stream = ready(source.open(StreamRequest::get("mem://a"))).unwrap();
        let chunks: Vec<_> = ready(stream.collect::<Vec<_>>());
        assert_eq!(chunks, vec![Ok(b"ab".to_vec()), Ok(b"c".to_vec())]);

        assert!(matches!(
            ready(source.open(StreamRequest::get("mem://missing"))),
            Err(SourceError::NotFound { .. })
        ));
    }

    #[test]
    fn live_entries_are_served_once() {
        let source = MemorySource::new();
        let tx = source.insert_live("mem://live");
        tx.send(b"x".to_vec());
        drop(tx);

        let stream = ready(source.open(StreamRequest::get("mem://live"))).unwrap();
        assert_eq!(ready(stream.collect::<Vec<_>>()), vec![Ok(b"x".to_vec())]);
        assert!(ready(source.open(StreamRequest::get("mem://live"))).is_err());
    }
}
