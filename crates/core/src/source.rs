//! Record sources.
//!
//! A [`RecordSource`] is a cursor: it yields records one at a time until it
//! returns `Ok(None)`. A [`SourceFactory`] hands out an independent cursor per
//! session, so several consumers can read the same data without sharing a
//! position.

use crate::error::{Error, Result};
use crate::framing::DEFAULT_MAX_FRAME_LEN;
use crate::record::Record;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, warn};

/// A lazy, possibly unbounded sequence of records.
#[async_trait]
pub trait RecordSource: Send {
    /// Next record, or `Ok(None)` at end of stream.
    async fn next_record(&mut self) -> Result<Option<Record>>;
}

#[async_trait]
impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        (**self).next_record().await
    }
}

/// Opens a fresh cursor for each streaming session.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn RecordSource>>;
}

/// Records held in memory, shared read-only between sessions.
#[derive(Debug, Clone)]
pub struct SharedRecords {
    records: Arc<[Record]>,
}

impl SharedRecords {
    pub fn new(records: impl Into<Arc<[Record]>>) -> Self {
        Self {
            records: records.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// A cursor starting at the first record.
    pub fn cursor(&self) -> VecSource {
        VecSource {
            records: self.records.clone(),
            position: 0,
        }
    }
}

#[async_trait]
impl SourceFactory for SharedRecords {
    async fn open(&self) -> Result<Box<dyn RecordSource>> {
        Ok(Box::new(self.cursor()))
    }
}

/// Cursor over [`SharedRecords`].
#[derive(Debug, Clone)]
pub struct VecSource {
    records: Arc<[Record]>,
    position: usize,
}

impl VecSource {
    pub fn new(records: Vec<Record>) -> Self {
        SharedRecords::new(records).cursor()
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

#[async_trait]
impl RecordSource for VecSource {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        let record = self.records.get(self.position).cloned();
        if record.is_some() {
            self.position += 1;
        }
        Ok(record)
    }
}

/// Adapts any iterator of records.
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Record> + Send,
{
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

#[async_trait]
impl<I> RecordSource for IterSource<I>
where
    I: Iterator<Item = Record> + Send,
{
    async fn next_record(&mut self) -> Result<Option<Record>> {
        Ok(self.iter.next())
    }
}

/// How input lines are turned into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineFormat {
    /// Each line is a text record.
    #[default]
    Text,
    /// Each line is parsed as JSON; lines that fail to parse are skipped.
    Json,
}

impl std::str::FromStr for LineFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LineFormat::Text),
            "json" | "jsonl" | "ndjson" => Ok(LineFormat::Json),
            other => Err(format!("unknown line format '{}'", other)),
        }
    }
}

/// Reads records line by line from any buffered reader.
///
/// At most `max_line_len` bytes of a line are buffered; longer lines are
/// read through, logged and skipped.
pub struct LinesSource<R> {
    reader: R,
    format: LineFormat,
    max_line_len: usize,
    buf: Vec<u8>,
    line_no: u64,
}

impl<R> LinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, format: LineFormat) -> Self {
        Self {
            reader,
            format,
            max_line_len: DEFAULT_MAX_FRAME_LEN,
            buf: Vec::new(),
            line_no: 0,
        }
    }

    pub fn with_max_line_len(mut self, max: usize) -> Self {
        self.max_line_len = max;
        self
    }

    // Room for the line, a CR and the LF.
    fn read_limit(&self) -> u64 {
        self.max_line_len as u64 + 2
    }

    /// Next line without its terminator, `None` at end of input.
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            self.buf.clear();
            let limit = self.read_limit();
            let n = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let terminated = self.buf.last() == Some(&b'\n');
            if terminated {
                self.buf.pop();
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
            } else if n as u64 == limit {
                self.skip_rest_of_line().await?;
            }

            if self.buf.len() > self.max_line_len {
                warn!(
                    line = self.line_no,
                    max = self.max_line_len,
                    "Skipping line longer than the maximum"
                );
                continue;
            }
            return Ok(Some(std::mem::take(&mut self.buf)));
        }
    }

    async fn skip_rest_of_line(&mut self) -> Result<()> {
        let limit = self.read_limit();
        let mut scratch = Vec::new();
        loop {
            scratch.clear();
            let n = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut scratch)
                .await?;
            if n == 0 || scratch.last() == Some(&b'\n') {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl<R> RecordSource for LinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };

            match self.format {
                LineFormat::Text => return Ok(Some(Record::from_payload(Bytes::from(line)))),
                LineFormat::Json => {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice::<serde_json::Value>(&line) {
                        Ok(value) => return Ok(Some(Record::Json(value))),
                        Err(e) => {
                            warn!(line = self.line_no, error = %e, "Skipping invalid JSON line");
                        }
                    }
                }
            }
        }
    }
}

/// A file read line by line, reopened for every session.
#[derive(Debug, Clone)]
pub struct FileLines {
    path: PathBuf,
    format: LineFormat,
    max_line_len: usize,
}

impl FileLines {
    pub fn new(path: impl Into<PathBuf>, format: LineFormat) -> Self {
        Self {
            path: path.into(),
            format,
            max_line_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_line_len(mut self, max: usize) -> Self {
        self.max_line_len = max;
        self
    }
}

#[async_trait]
impl SourceFactory for FileLines {
    async fn open(&self) -> Result<Box<dyn RecordSource>> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            Error::Source(format!("cannot open {}: {}", self.path.display(), e))
        })?;
        debug!(path = %self.path.display(), "Opened input file");
        let lines = LinesSource::new(BufReader::new(file), self.format)
            .with_max_line_len(self.max_line_len);
        Ok(Box::new(lines))
    }
}

/// Hands out one pre-built source exactly once (e.g. stdin).
pub struct OnceFactory {
    source: Mutex<Option<Box<dyn RecordSource>>>,
}

impl OnceFactory {
    pub fn new(source: impl RecordSource + 'static) -> Self {
        Self {
            source: Mutex::new(Some(Box::new(source))),
        }
    }
}

#[async_trait]
impl SourceFactory for OnceFactory {
    async fn open(&self) -> Result<Box<dyn RecordSource>> {
        let mut slot = self
            .source
            .lock()
            .map_err(|_| Error::Source("source lock poisoned".to_string()))?;
        slot.take()
            .ok_or_else(|| Error::Source("source can only be streamed once".to_string()))
    }
}

/// Synthetic `{"id": n, "message": "<prefix>-n"}` records.
#[derive(Debug, Clone)]
pub struct GeneratorSource {
    prefix: String,
    count: Option<u64>,
    next: u64,
}

impl GeneratorSource {
    /// `count = None` generates forever.
    pub fn new(prefix: impl Into<String>, count: Option<u64>) -> Self {
        Self {
            prefix: prefix.into(),
            count,
            next: 0,
        }
    }
}

#[async_trait]
impl RecordSource for GeneratorSource {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        if self.count.is_some_and(|count| self.next >= count) {
            return Ok(None);
        }
        let id = self.next;
        self.next += 1;
        Ok(Some(Record::Json(serde_json::json!({
            "id": id,
            "message": format!("{}-{}", self.prefix, id),
        }))))
    }
}

#[async_trait]
impl SourceFactory for GeneratorSource {
    async fn open(&self) -> Result<Box<dyn RecordSource>> {
        Ok(Box::new(GeneratorSource::new(self.prefix.clone(), self.count)))
    }
}

/// Replaces each JSON record by one of its fields.
///
/// String fields become text records, other values are sent as JSON.
/// Records without the field are skipped.
pub struct FieldProjection<S> {
    inner: S,
    field: String,
    skipped: u64,
}

impl<S: RecordSource> FieldProjection<S> {
    pub fn new(inner: S, field: impl Into<String>) -> Self {
        Self {
            inner,
            field: field.into(),
            skipped: 0,
        }
    }

    /// Records skipped because they had no such field.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn project(&self, record: &Record) -> Option<Record> {
        let value = match record {
            Record::Json(value) => value.get(&self.field)?.clone(),
            other => other
                .parse_json::<serde_json::Value>()
                .ok()?
                .get(&self.field)?
                .clone(),
        };
        Some(match value {
            serde_json::Value::String(s) => Record::Text(s),
            other => Record::Json(other),
        })
    }
}

#[async_trait]
impl<S: RecordSource> RecordSource for FieldProjection<S> {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        while let Some(record) = self.inner.next_record().await? {
            match self.project(&record) {
                Some(projected) => return Ok(Some(projected)),
                None => {
                    self.skipped += 1;
                    debug!(field = %self.field, "Record has no such field, skipping");
                }
            }
        }
        Ok(None)
    }
}

/// Factory wrapping every opened cursor in a [`FieldProjection`].
pub struct ProjectedFactory {
    inner: Arc<dyn SourceFactory>,
    field: String,
}

impl ProjectedFactory {
    pub fn new(inner: Arc<dyn SourceFactory>, field: impl Into<String>) -> Self {
        Self {
            inner,
            field: field.into(),
        }
    }
}

#[async_trait]
impl SourceFactory for ProjectedFactory {
    async fn open(&self) -> Result<Box<dyn RecordSource>> {
        let inner = self.inner.open().await?;
        Ok(Box::new(FieldProjection::new(inner, self.field.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    async fn drain(source: &mut dyn RecordSource) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(record) = source.next_record().await.unwrap() {
            out.push(record);
        }
        out
    }

    #[tokio::test]
    async fn test_shared_records_give_independent_cursors() {
        let shared = SharedRecords::new(vec![Record::text("a"), Record::text("b")]);
        let mut first = shared.open().await.unwrap();
        let mut second = shared.open().await.unwrap();

        assert_eq!(first.next_record().await.unwrap(), Some(Record::text("a")));
        assert_eq!(drain(second.as_mut()).await.len(), 2);
        assert_eq!(first.next_record().await.unwrap(), Some(Record::text("b")));
        assert_eq!(first.next_record().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lines_source_json_skips_bad_lines() {
        let input: &[u8] = b"{\"id\":1}\nnot json\n\n{\"id\":2}\n";
        let mut source = LinesSource::new(input, LineFormat::Json);
        let records = drain(&mut source).await;
        assert_eq!(records, vec![Record::Json(json!({"id": 1})), Record::Json(json!({"id": 2}))]);
    }

    #[tokio::test]
    async fn test_lines_source_text() {
        let input: &[u8] = b"hello\r\nworld";
        let mut source = LinesSource::new(input, LineFormat::Text);
        assert_eq!(drain(&mut source).await, vec![Record::text("hello"), Record::text("world")]);
    }

    #[tokio::test]
    async fn test_lines_source_skips_overlong_lines() {
        let input: &[u8] = b"ok\n0123456789abcdef0123\nfine\r\n12345678\nend";
        let mut source = LinesSource::new(input, LineFormat::Text).with_max_line_len(8);
        assert_eq!(
            drain(&mut source).await,
            vec![
                Record::text("ok"),
                Record::text("fine"),
                Record::text("12345678"),
                Record::text("end"),
            ]
        );
    }

    #[tokio::test]
    async fn test_lines_source_non_utf8_is_binary() {
        let input: &[u8] = b"a\xff\n";
        let mut source = LinesSource::new(input, LineFormat::Text);
        assert_eq!(
            drain(&mut source).await,
            vec![Record::binary(Bytes::from_static(b"a\xff"))]
        );
    }

    #[tokio::test]
    async fn test_file_lines_reopens_per_session() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"id\":1}}").unwrap();
        writeln!(file, "{{\"id\":2}}").unwrap();

        let factory = FileLines::new(file.path(), LineFormat::Json);
        for _ in 0..2 {
            let mut source = factory.open().await.unwrap();
            assert_eq!(drain(source.as_mut()).await.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_file_lines_missing_file() {
        let factory = FileLines::new("/nonexistent/linefeed/input.jsonl", LineFormat::Json);
        assert!(matches!(factory.open().await, Err(Error::Source(_))));
    }

    #[tokio::test]
    async fn test_once_factory() {
        let factory = OnceFactory::new(VecSource::new(vec![Record::text("x")]));
        assert!(factory.open().await.is_ok());
        assert!(matches!(factory.open().await, Err(Error::Source(_))));
    }

    #[tokio::test]
    async fn test_generator_count() {
        let mut source = GeneratorSource::new("message", Some(3));
        let records = drain(&mut source).await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[2], Record::Json(json!({"id": 2, "message": "message-2"})));
    }

    #[tokio::test]
    async fn test_field_projection() {
        let inner = VecSource::new(vec![
            Record::Json(json!({"text": "first tweet", "lang": "en"})),
            Record::Json(json!({"delete": {"id": 4}})),
            Record::text("{\"text\":\"second\"}"),
            Record::Json(json!({"text": 42})),
        ]);
        let mut source = FieldProjection::new(inner, "text");
        let records = drain(&mut source).await;
        assert_eq!(
            records,
            vec![Record::text("first tweet"), Record::text("second"), Record::Json(json!(42))]
        );
        assert_eq!(source.skipped(), 1);
    }
}
