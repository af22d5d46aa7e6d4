//! Row source contract and stock implementations.
//!
//! A [`RowSource`] is a blocking pull of chunks. Each chunk holds
//! [`RowResolver`]s addressable by column name or index, and each resolver
//! may carry an opaque source context that injecting methods receive.
//!
//! [`ChunkedRowSource`] runs a producer on its own thread and hands chunks
//! over a bounded channel, so a slow consumer applies backpressure. The
//! producer observes the query's [`CancellationToken`] on every send.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use musoq_error::{MusoqError, Result};
use musoq_types::{CancellationToken, Row, Table, Value};
use tracing::{debug, warn};

/// Opaque per-row object handed to methods that request injection.
pub type SourceContext = Arc<dyn Any + Send + Sync>;

/// One row as seen by the engine.
pub trait RowResolver: Send {
    fn get_by_name(&self, name: &str) -> Option<Value>;

    fn get_by_index(&self, index: usize) -> Option<Value>;

    fn context(&self) -> Option<SourceContext> {
        None
    }
}

/// Lazy, possibly chunked sequence of rows.
pub trait RowSource: Send {
    /// Next chunk, or `None` once the source is exhausted.
    fn next_chunk(&mut self) -> Result<Option<Vec<Box<dyn RowResolver>>>>;
}

/// Resolver over an owned value vector with a shared name index.
pub struct ObjectResolver {
    names: Arc<HashMap<String, usize>>,
    values: Vec<Value>,
    context: Option<SourceContext>,
}

impl ObjectResolver {
    #[must_use]
    pub fn new(names: Arc<HashMap<String, usize>>, values: Vec<Value>) -> Self {
        Self {
            names,
            values,
            context: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: SourceContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Lowercased name → index map for a column list.
    #[must_use]
    pub fn name_index<'a>(names: impl IntoIterator<Item = &'a str>) -> Arc<HashMap<String, usize>> {
        Arc::new(
            names
                .into_iter()
                .enumerate()
                .map(|(i, n)| (n.to_ascii_lowercase(), i))
                .collect(),
        )
    }
}

impl RowResolver for ObjectResolver {
    fn get_by_name(&self, name: &str) -> Option<Value> {
        let idx = self.names.get(&name.to_ascii_lowercase())?;
        self.values.get(*idx).cloned()
    }

    fn get_by_index(&self, index: usize) -> Option<Value> {
        self.values.get(index).cloned()
    }

    fn context(&self) -> Option<SourceContext> {
        self.context.clone()
    }
}

/// In-memory source that yields pre-built resolvers in fixed-size chunks.
pub struct VecRowSource {
    rows: std::vec::IntoIter<Box<dyn RowResolver>>,
    chunk_size: usize,
}

impl VecRowSource {
    #[must_use]
    pub fn new(rows: Vec<Box<dyn RowResolver>>, chunk_size: usize) -> Self {
        Self {
            rows: rows.into_iter(),
            chunk_size: chunk_size.max(1),
        }
    }
}

impl RowSource for VecRowSource {
    fn next_chunk(&mut self) -> Result<Option<Vec<Box<dyn RowResolver>>>> {
        let chunk: Vec<_> = self.rows.by_ref().take(self.chunk_size).collect();
        Ok(if chunk.is_empty() { None } else { Some(chunk) })
    }
}

/// Producer side of a [`ChunkedRowSource`].
pub struct ChunkSender {
    tx: mpsc::SyncSender<Result<Vec<Box<dyn RowResolver>>>>,
    token: CancellationToken,
    buffer: Vec<Box<dyn RowResolver>>,
    chunk_size: usize,
}

impl ChunkSender {
    /// Queue one row, flushing a full chunk to the consumer.
    ///
    /// Fails with [`MusoqError::Cancelled`] once the token is cancelled or
    /// the consumer has gone away; producers should stop on any error.
    pub fn send(&mut self, row: Box<dyn RowResolver>) -> Result<()> {
        self.buffer.push(row);
        if self.buffer.len() >= self.chunk_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.token.checkpoint()?;
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        self.tx.send(Ok(chunk)).map_err(|_| MusoqError::Cancelled)
    }

    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Row source fed by a producer thread over a bounded channel.
pub struct ChunkedRowSource {
    name: String,
    rx: mpsc::Receiver<Result<Vec<Box<dyn RowResolver>>>>,
    token: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl ChunkedRowSource {
    /// Start `produce` on a named thread. At most `capacity` chunks are
    /// buffered ahead of the consumer. The producer sees a child of `token`.
    pub fn spawn<F>(
        name: &str,
        token: CancellationToken,
        chunk_size: usize,
        capacity: usize,
        produce: F,
    ) -> Result<Self>
    where
        F: FnOnce(&mut ChunkSender) -> Result<()> + Send + 'static,
    {
        // Dropping the source cancels only this producer.
        let token = token.child();
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let mut sender = ChunkSender {
            tx,
            token: token.clone(),
            buffer: Vec::new(),
            chunk_size: chunk_size.max(1),
        };
        let source_name = name.to_owned();
        let worker = thread::Builder::new()
            .name(format!("musoq-source-{name}"))
            .spawn(move || {
                let outcome = produce(&mut sender).and_then(|()| sender.flush());
                match outcome {
                    Ok(()) => debug!(target: "musoq.exec", source = %source_name, "producer finished"),
                    Err(MusoqError::Cancelled) => {
                        debug!(target: "musoq.exec", source = %source_name, "producer cancelled");
                    }
                    Err(err) => {
                        warn!(target: "musoq.exec", source = %source_name, error = %err, "producer failed");
                        // Receiver may already be gone.
                        let _ = sender.tx.send(Err(err));
                    }
                }
            })
            .map_err(|err| MusoqError::SourceFailure {
                source_name: name.to_owned(),
                detail: format!("failed to spawn producer thread: {err}"),
            })?;
        Ok(Self {
            name: name.to_owned(),
            rx,
            token,
            worker: Some(worker),
        })
    }

    fn join_worker(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.join().map_err(|_| MusoqError::SourceFailure {
                source_name: self.name.clone(),
                detail: "producer thread panicked".to_owned(),
            })?;
        }
        Ok(())
    }
}

impl RowSource for ChunkedRowSource {
    fn next_chunk(&mut self) -> Result<Option<Vec<Box<dyn RowResolver>>>> {
        self.token.checkpoint()?;
        match self.rx.recv() {
            Ok(Ok(chunk)) => Ok(Some(chunk)),
            Ok(Err(err)) => Err(match err {
                MusoqError::SourceFailure { .. } | MusoqError::Cancelled => err,
                other => MusoqError::SourceFailure {
                    source_name: self.name.clone(),
                    detail: other.to_string(),
                },
            }),
            Err(mpsc::RecvError) => {
                self.join_worker()?;
                self.token.checkpoint()?;
                Ok(None)
            }
        }
    }
}

impl Drop for ChunkedRowSource {
    fn drop(&mut self) {
        // Unblock a producer waiting on a full channel, then let it exit.
        self.token.cancel_with_reason("row source dropped");
        while self.rx.try_recv().is_ok() {}
    }
}

/// Materialized table rows exposed as a source (CTEs, derived tables).
pub struct TableRowSource {
    names: Arc<HashMap<String, usize>>,
    rows: std::vec::IntoIter<Row>,
    chunk_size: usize,
}

impl TableRowSource {
    #[must_use]
    pub fn new(table: Table, chunk_size: usize) -> Self {
        let names = ObjectResolver::name_index(table.columns().iter().map(|c| c.name.as_str()));
        Self {
            names,
            rows: table.into_rows().into_iter(),
            chunk_size: chunk_size.max(1),
        }
    }
}

impl RowSource for TableRowSource {
    fn next_chunk(&mut self) -> Result<Option<Vec<Box<dyn RowResolver>>>> {
        let chunk: Vec<Box<dyn RowResolver>> = self
            .rows
            .by_ref()
            .take(self.chunk_size)
            .map(|row| {
                Box::new(ObjectResolver::new(Arc::clone(&self.names), row.into_values()))
                    as Box<dyn RowResolver>
            })
            .collect();
        Ok(if chunk.is_empty() { None } else { Some(chunk) })
    }
}

/// Drain a source into plain value rows, reading `width` columns by index.
pub fn drain_source(source: &mut dyn RowSource, width: usize) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    while let Some(chunk) = source.next_chunk()? {
        for resolver in chunk {
            rows.push(Row::new(
                (0..width)
                    .map(|i| resolver.get_by_index(i).unwrap_or(Value::Null))
                    .collect(),
            ));
        }
    }
    Ok(rows)
}
