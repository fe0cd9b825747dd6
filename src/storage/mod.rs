//! Chunked large-object store.
//!
//! Payloads too large to travel inline are split into bounded chunks and
//! written to a side table keyed by a generated id:
//!
//! ```text
//! object_id TEXT | seq INTEGER | kind TEXT | content BLOB/TEXT | total_length INTEGER
//! ```
//!
//! Chunks of one object are numbered from zero without gaps, and
//! `total_length` (bytes) is repeated on every row so a truncated tail is
//! detected as well as a hole in the middle.
use crate::core::db::{PooledConnection, Runtime};
use crate::core::{Result, SprocketError};
use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension, Statement, ToSql, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor, Read};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Result of looking something up by id: either it is there or it is not.
/// Store failures are reported separately as errors.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Lookup::NotFound)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
        }
    }
}

/// How a chunked object's content was given to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Binary,
    Text,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Binary => "binary",
            ContentKind::Text => "text",
        }
    }

    fn parse(id: Uuid, kind: &str) -> Result<Self> {
        match kind {
            "binary" => Ok(ContentKind::Binary),
            "text" => Ok(ContentKind::Text),
            other => Err(SprocketError::corrupted(id, format!("unknown content kind {:?}", other))),
        }
    }
}

/// A payload stored through [`LargeObjectStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LargeObject {
    Binary(Vec<u8>),
    Text(String),
}

impl LargeObject {
    pub fn kind(&self) -> ContentKind {
        match self {
            LargeObject::Binary(_) => ContentKind::Binary,
            LargeObject::Text(_) => ContentKind::Text,
        }
    }

    /// Length in bytes (UTF-8 bytes for text).
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            LargeObject::Binary(bytes) => bytes,
            LargeObject::Text(text) => text.as_bytes(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            LargeObject::Binary(bytes) => bytes,
            LargeObject::Text(text) => text.into_bytes(),
        }
    }
}

impl From<Vec<u8>> for LargeObject {
    fn from(bytes: Vec<u8>) -> Self {
        LargeObject::Binary(bytes)
    }
}

impl From<String> for LargeObject {
    fn from(text: String) -> Self {
        LargeObject::Text(text)
    }
}

/// A text field that may have been diverted into the chunk store.
///
/// Embed this in a record in place of a long string; it serializes to
/// `{"storage":"inline","value":"..."}` or `{"storage":"chunked","value":"<uuid>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "storage", content = "value", rename_all = "lowercase")]
pub enum LargeText {
    Inline(String),
    Chunked(Uuid),
}

impl Default for LargeText {
    fn default() -> Self {
        LargeText::Inline(String::new())
    }
}

/// Splits text into pieces of at most `size` bytes that end on character
/// boundaries. A piece only exceeds `size` when one character is wider.
fn split_text(text: &str, size: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while rest.len() > size {
        let mut end = size;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        pieces.push(head);
        rest = tail;
    }
    if !rest.is_empty() || pieces.is_empty() {
        pieces.push(rest);
    }
    pieces
}

fn split_bytes(bytes: &[u8], size: usize) -> Vec<&[u8]> {
    if bytes.is_empty() {
        return vec![bytes];
    }
    bytes.chunks(size).collect()
}

/// Reassembles chunks read in ascending `seq` order, checking contiguity.
struct Assembler {
    id: Uuid,
    kind: ContentKind,
    total_length: usize,
    next_seq: i64,
    bytes: Vec<u8>,
}

impl Assembler {
    fn new(id: Uuid, kind: ContentKind, total_length: i64) -> Result<Self> {
        let total_length = usize::try_from(total_length)
            .map_err(|_| SprocketError::corrupted(id, format!("invalid total length {}", total_length)))?;
        Ok(Assembler {
            id,
            kind,
            total_length,
            next_seq: 0,
            bytes: Vec::with_capacity(total_length.min(1 << 24)),
        })
    }

    fn push(&mut self, seq: i64, kind: ContentKind, total_length: i64, content: Value) -> Result<()> {
        if seq != self.next_seq {
            return Err(SprocketError::corrupted(
                self.id,
                format!("expected chunk {} but found chunk {}", self.next_seq, seq),
            ));
        }
        if kind != self.kind || total_length as usize != self.total_length {
            return Err(SprocketError::corrupted(
                self.id,
                format!("chunk {} disagrees with chunk 0 about kind or length", seq),
            ));
        }
        match content {
            Value::Blob(bytes) => self.bytes.extend_from_slice(&bytes),
            Value::Text(text) => self.bytes.extend_from_slice(text.as_bytes()),
            Value::Null => {}
            _ => {
                return Err(SprocketError::corrupted(self.id, format!("chunk {} has non-binary content", seq)));
            }
        }
        if self.bytes.len() > self.total_length {
            return Err(SprocketError::corrupted(
                self.id,
                format!("content exceeds recorded length {}", self.total_length),
            ));
        }
        self.next_seq += 1;
        Ok(())
    }

    fn finish(self) -> Result<LargeObject> {
        if self.bytes.len() != self.total_length {
            return Err(SprocketError::corrupted(
                self.id,
                format!(
                    "assembled {} of {} bytes from {} chunks",
                    self.bytes.len(),
                    self.total_length,
                    self.next_seq
                ),
            ));
        }
        match self.kind {
            ContentKind::Binary => Ok(LargeObject::Binary(self.bytes)),
            ContentKind::Text => String::from_utf8(self.bytes)
                .map(LargeObject::Text)
                .map_err(|e| SprocketError::corrupted(self.id, e.to_string())),
        }
    }
}

/// Database-backed store for chunked large objects.
///
/// Cloning is cheap; clones share the runtime and its pool.
#[derive(Debug, Clone)]
pub struct LargeObjectStore {
    runtime: Arc<Runtime>,
    table: String,
    chunk_size: usize,
    inline_threshold: usize,
}

impl LargeObjectStore {
    /// Opens the store, creating the chunk table when missing.
    pub fn new(runtime: Arc<Runtime>) -> Result<Self> {
        let chunks = &runtime.config().chunks;
        let store = LargeObjectStore {
            table: chunks.table.clone(),
            chunk_size: chunks.chunk_size,
            inline_threshold: chunks.inline_threshold,
            runtime,
        };
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                object_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                content BLOB,
                total_length INTEGER NOT NULL,
                PRIMARY KEY (object_id, seq)
            )",
            store.table
        );
        store
            .runtime
            .acquire()?
            .execute_batch(&ddl)
            .map_err(|e| SprocketError::execution(format!("create {}", store.table), e))?;
        Ok(store)
    }

    /// Overrides the configured chunk size for this handle.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Stores `payload` and returns its new id.
    ///
    /// Either every chunk is durable when this returns, or none is left
    /// behind.
    pub fn set(&self, payload: &LargeObject) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let mut conn = self.runtime.acquire()?;
        match self.write_chunks(&mut conn, id, payload) {
            Ok(count) => {
                debug!("Stored large object {} ({} bytes, {} chunks)", id, payload.len(), count);
                Ok(id)
            }
            Err(e) => {
                error!("Failed to store large object {}: {}", id, e);
                if let Err(cleanup) = self.delete_on(&conn, id) {
                    warn!("Cleanup of large object {} failed: {}", id, cleanup);
                }
                Err(e)
            }
        }
    }

    fn write_chunks(&self, conn: &mut PooledConnection, id: Uuid, payload: &LargeObject) -> Result<usize> {
        let context = format!("set large object {}", id);
        let to_err = |e: rusqlite::Error| SprocketError::execution(context.as_str(), e);

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(to_err)?;
        let count = {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT INTO {} (object_id, seq, kind, content, total_length) VALUES (?1, ?2, ?3, ?4, ?5)",
                    self.table
                ))
                .map_err(to_err)?;
            let id_text = id.to_string();
            let total = payload.len() as i64;
            let kind = payload.kind().as_str();
            let written = match payload {
                LargeObject::Binary(bytes) => {
                    insert_chunks(&mut stmt, &id_text, kind, total, &split_bytes(bytes, self.chunk_size))
                }
                LargeObject::Text(text) => {
                    insert_chunks(&mut stmt, &id_text, kind, total, &split_text(text, self.chunk_size))
                }
            };
            written.map_err(to_err)?
        };
        tx.commit().map_err(to_err)?;
        Ok(count)
    }

    /// Reads an object back, or reports that no chunk exists for `id`.
    pub fn get(&self, id: Uuid) -> Result<Lookup<LargeObject>> {
        let conn = self.runtime.acquire()?;
        let context = format!("get large object {}", id);
        let to_err = |e: rusqlite::Error| SprocketError::execution(context.as_str(), e);

        let mut stmt = conn
            .prepare(&format!(
                "SELECT seq, kind, content, total_length FROM {} WHERE object_id = ?1 ORDER BY seq",
                self.table
            ))
            .map_err(to_err)?;
        let mut rows = stmt.query([id.to_string()]).map_err(to_err)?;

        let mut assembler: Option<Assembler> = None;
        while let Some(row) = rows.next().map_err(to_err)? {
            let seq: i64 = row.get(0).map_err(to_err)?;
            let kind: String = row.get(1).map_err(to_err)?;
            let content: Value = row.get(2).map_err(to_err)?;
            let total_length: i64 = row.get(3).map_err(to_err)?;
            let kind = ContentKind::parse(id, &kind)?;
            if assembler.is_none() {
                assembler = Some(Assembler::new(id, kind, total_length)?);
            }
            if let Some(assembler) = assembler.as_mut() {
                assembler.push(seq, kind, total_length, content)?;
            }
        }

        match assembler {
            Some(assembler) => assembler.finish().map(Lookup::Found),
            None => Ok(Lookup::NotFound),
        }
    }

    /// Removes every chunk of `id` in one statement; returns the chunk count.
    pub fn delete(&self, id: Uuid) -> Result<usize> {
        let conn = self.runtime.acquire()?;
        let removed = self.delete_on(&conn, id)?;
        debug!("Deleted large object {} ({} chunks)", id, removed);
        Ok(removed)
    }

    fn delete_on(&self, conn: &PooledConnection, id: Uuid) -> Result<usize> {
        conn.execute(
            &format!("DELETE FROM {} WHERE object_id = ?1", self.table),
            [id.to_string()],
        )
        .map_err(|e| SprocketError::execution(format!("delete large object {}", id), e))
    }

    /// Opens a reader that pulls one chunk at a time.
    pub fn open_reader(&self, id: Uuid) -> Result<Lookup<ChunkReader>> {
        let conn = self.runtime.acquire()?;
        let context = format!("read large object {}", id);
        let header: (Option<String>, Option<String>, Option<i64>, Option<i64>, i64) = conn
            .query_row(
                &format!(
                    "SELECT min(kind), max(kind), min(total_length), max(total_length), count(*) \
                     FROM {} WHERE object_id = ?1",
                    self.table
                ),
                [id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .map_err(|e| SprocketError::execution(context.as_str(), e))?;

        let (kind, total_length) = match header {
            (_, _, _, _, 0) => return Ok(Lookup::NotFound),
            (Some(kind), Some(max_kind), Some(total_length), Some(max_length), _) => {
                if kind != max_kind || total_length != max_length {
                    return Err(SprocketError::corrupted(id, "chunks disagree about kind or length"));
                }
                (ContentKind::parse(id, &kind)?, total_length)
            }
            _ => return Err(SprocketError::corrupted(id, "chunk rows without kind or length")),
        };
        let total_length = u64::try_from(total_length)
            .map_err(|_| SprocketError::corrupted(id, format!("invalid total length {}", total_length)))?;

        Ok(Lookup::Found(ChunkReader {
            conn: Some(conn),
            table: self.table.clone(),
            id,
            kind,
            total_length,
            delivered: 0,
            next_seq: 0,
            buffer: Cursor::new(Vec::new()),
        }))
    }

    /// Keeps short text inline and diverts longer text into the store.
    pub fn store_text(&self, text: &str) -> Result<LargeText> {
        if text.chars().count() <= self.inline_threshold {
            return Ok(LargeText::Inline(text.to_string()));
        }
        self.set(&LargeObject::Text(text.to_string())).map(LargeText::Chunked)
    }

    /// Brings back the full text behind a [`LargeText`].
    pub fn resolve(&self, text: &LargeText) -> Result<Lookup<String>> {
        match text {
            LargeText::Inline(text) => Ok(Lookup::Found(text.clone())),
            LargeText::Chunked(id) => match self.get(*id)? {
                Lookup::Found(LargeObject::Text(text)) => Ok(Lookup::Found(text)),
                Lookup::Found(LargeObject::Binary(_)) => {
                    Err(SprocketError::corrupted(*id, "object holds binary content, expected text"))
                }
                Lookup::NotFound => Ok(Lookup::NotFound),
            },
        }
    }

    pub async fn set_async(&self, payload: LargeObject) -> Result<Uuid> {
        let store = self.clone();
        blocking(move || store.set(&payload)).await
    }

    pub async fn get_async(&self, id: Uuid) -> Result<Lookup<LargeObject>> {
        let store = self.clone();
        blocking(move || store.get(id)).await
    }

    pub async fn delete_async(&self, id: Uuid) -> Result<usize> {
        let store = self.clone();
        blocking(move || store.delete(id)).await
    }
}

/// Writes chunks in increasing `seq` order.
fn insert_chunks<C: ToSql>(
    stmt: &mut Statement<'_>,
    id: &str,
    kind: &str,
    total_length: i64,
    chunks: &[C],
) -> rusqlite::Result<usize> {
    for (seq, chunk) in chunks.iter().enumerate() {
        stmt.execute(params![id, seq as i64, kind, chunk, total_length])?;
    }
    Ok(chunks.len())
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SprocketError::execution("large object store", format!("worker failed: {}", e)))?
}

/// Lazy reader over one chunked object.
///
/// Holds a pooled connection until the last chunk has been read or the
/// reader is dropped. Gaps and truncation surface as `InvalidData` errors.
pub struct ChunkReader {
    conn: Option<PooledConnection>,
    table: String,
    id: Uuid,
    kind: ContentKind,
    total_length: u64,
    delivered: u64,
    next_seq: i64,
    buffer: Cursor<Vec<u8>>,
}

impl ChunkReader {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Whether the reader still holds its connection.
    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Loads the next chunk into the buffer; `false` once the object is exhausted.
    fn fetch_next(&mut self) -> Result<bool> {
        if self.delivered == self.total_length {
            self.conn = None;
        }
        let Some(conn) = self.conn.as_ref() else { return Ok(false) };

        let chunk: Option<(String, i64, Value)> = conn
            .query_row(
                &format!(
                    "SELECT kind, total_length, content FROM {} WHERE object_id = ?1 AND seq = ?2",
                    self.table
                ),
                params![self.id.to_string(), self.next_seq],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| SprocketError::execution(format!("read large object {}", self.id), e))?;

        if let Some((kind, total_length, _)) = &chunk {
            if kind != self.kind.as_str() || u64::try_from(*total_length).ok() != Some(self.total_length) {
                return Err(SprocketError::corrupted(
                    self.id,
                    format!("chunk {} disagrees with chunk 0 about kind or length", self.next_seq),
                ));
            }
        }
        let bytes = match chunk.map(|(_, _, content)| content) {
            Some(Value::Blob(bytes)) => bytes,
            Some(Value::Text(text)) => text.into_bytes(),
            Some(Value::Null) => Vec::new(),
            Some(_) => return Err(SprocketError::corrupted(self.id, "chunk has non-binary content")),
            None => {
                return Err(SprocketError::corrupted(
                    self.id,
                    format!(
                        "chunk {} missing after {} of {} bytes",
                        self.next_seq, self.delivered, self.total_length
                    ),
                ))
            }
        };
        self.delivered += bytes.len() as u64;
        if self.delivered > self.total_length {
            return Err(SprocketError::corrupted(
                self.id,
                format!("content exceeds recorded length {}", self.total_length),
            ));
        }
        self.next_seq += 1;
        self.buffer = Cursor::new(bytes);
        Ok(true)
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.buffer.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            let more = self.fetch_next().map_err(|e| match e {
                SprocketError::CorruptedObject { .. } => io::Error::new(io::ErrorKind::InvalidData, e),
                other => io::Error::new(io::ErrorKind::Other, other),
            })?;
            if !more {
                return Ok(0);
            }
        }
    }
}
