//! Command model and dispatcher.
//!
//! A [`Command`] names what to run (a catalog procedure or inline statement
//! text), carries the single input parameter, and declares the result shape
//! the caller expects. The [`Dispatcher`] runs commands through the
//! execution runtime and turns raw results into typed values with the
//! coercion layer.

use crate::coerce::{self, FromRaw, ToParam};
use crate::config::Config;
use crate::core::db::{CallControl, ResultStream, Runtime};
use crate::core::{Result, SprocketError};
use crate::storage::LargeObjectStore;
use rusqlite::types::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What a command executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Name of a procedure in the catalog table
    Procedure(String),
    /// Inline statement text
    Statement(String),
}

impl Target {
    pub fn procedure(name: impl Into<String>) -> Self {
        Target::Procedure(name.into())
    }

    pub fn statement(text: impl Into<String>) -> Self {
        Target::Statement(text.into())
    }

    /// Procedure name or statement text, used in error reports.
    pub fn identifier(&self) -> &str {
        match self {
            Target::Procedure(name) => name,
            Target::Statement(text) => text,
        }
    }
}

/// Result shape declared by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shape {
    /// Report rows affected only
    #[default]
    None,
    /// First column of the first row
    Scalar,
    /// First column of every row
    ResultSet,
}

/// Raw result of one command, matching the declared [`Shape`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Affected(usize),
    Scalar(Value),
    Rows(Vec<Value>),
}

impl Outcome {
    pub fn affected(&self) -> Option<usize> {
        match self {
            Outcome::Affected(n) => Some(*n),
            _ => None,
        }
    }

    /// Deserializes a scalar outcome. Any other shape yields the default.
    pub fn into_scalar<T: FromRaw>(self) -> Result<T> {
        match self {
            Outcome::Scalar(raw) => coerce::deserialize(raw),
            _ => Ok(T::default()),
        }
    }

    /// Deserializes each row of a result-set outcome on its own.
    pub fn into_rows<T: FromRaw>(self) -> Result<Vec<T>> {
        match self {
            Outcome::Rows(rows) => rows.into_iter().map(coerce::deserialize).collect(),
            Outcome::Scalar(raw) if !coerce::is_absent(&raw) => Ok(vec![coerce::deserialize(raw)?]),
            _ => Ok(Vec::new()),
        }
    }
}

/// One call against the database with its single input parameter.
///
/// The target is fixed at construction; input, shape and timeout are set
/// with the builder methods.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    target: Target,
    input: Value,
    shape: Shape,
    timeout: Option<Duration>,
}

impl Command {
    pub fn new(target: Target) -> Self {
        Command {
            target,
            input: Value::Null,
            shape: Shape::None,
            timeout: None,
        }
    }

    pub fn procedure(name: impl Into<String>) -> Self {
        Command::new(Target::procedure(name))
    }

    pub fn statement(text: impl Into<String>) -> Self {
        Command::new(Target::statement(text))
    }

    /// Serializes `input` into the command's single parameter.
    pub fn with_input<I: ToParam + ?Sized>(mut self, input: &I) -> Result<Self> {
        self.input = coerce::serialize(input)?;
        Ok(self)
    }

    /// Uses an already serialized parameter value.
    pub fn with_raw_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn expecting(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn identifier(&self) -> &str {
        self.target.identifier()
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Typed front end over the execution [`Runtime`].
///
/// Cloning is cheap and clones share the runtime, so a dispatcher can be
/// handed to every request handler of a process.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    runtime: Arc<Runtime>,
}

impl Dispatcher {
    /// Opens the runtime described by `config`.
    pub fn open(config: Config) -> Result<Self> {
        Ok(Dispatcher::new(Arc::new(Runtime::open(config)?)))
    }

    pub fn new(runtime: Arc<Runtime>) -> Self {
        Dispatcher { runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn config(&self) -> &Config {
        self.runtime.config()
    }

    /// The large-object store sharing this dispatcher's runtime.
    pub fn large_objects(&self) -> Result<LargeObjectStore> {
        LargeObjectStore::new(Arc::clone(&self.runtime))
    }

    /// Runs a command and returns the outcome its declared shape asks for.
    pub fn execute(&self, command: &Command) -> Result<Outcome> {
        self.runtime.run(command, None)
    }

    /// Runs `target` with `input` and reports the rows affected.
    pub fn exec<I: ToParam + ?Sized>(&self, target: Target, input: &I) -> Result<usize> {
        let command = Command::new(target).with_input(input)?;
        Ok(self.execute(&command)?.affected().unwrap_or(0))
    }

    /// Runs `target` with `input` and reads the first column of the first row.
    ///
    /// No rows yields `T::default()`.
    pub fn scalar<T: FromRaw, I: ToParam + ?Sized>(&self, target: Target, input: &I) -> Result<T> {
        let command = Command::new(target).with_input(input)?.expecting(Shape::Scalar);
        self.execute(&command)?.into_scalar()
    }

    /// Runs `target` with `input` and deserializes the JSON column of every row.
    pub fn rows<T: FromRaw, I: ToParam + ?Sized>(&self, target: Target, input: &I) -> Result<Vec<T>> {
        let command = Command::new(target).with_input(input)?.expecting(Shape::ResultSet);
        self.execute(&command)?.into_rows()
    }

    /// Runs `target` and deserializes the concatenation of every row's first
    /// column, for procedures that split one JSON document across rows.
    pub fn fetch_json<T: FromRaw, I: ToParam + ?Sized>(&self, target: Target, input: &I) -> Result<T> {
        let command = Command::new(target).with_input(input)?.expecting(Shape::ResultSet);
        let rows = match self.execute(&command)? {
            Outcome::Rows(rows) => rows,
            _ => Vec::new(),
        };
        let mut text = String::new();
        for row in rows {
            let part: String = coerce::deserialize(row)?;
            text.push_str(&part);
        }
        coerce::deserialize(Value::Text(text))
    }

    /// Opens a lazily read stream over the command's result.
    pub fn open_stream(&self, command: Command) -> Result<ResultStream> {
        self.runtime.open_stream(command)
    }

    /// Asynchronous [`execute`](Self::execute).
    ///
    /// The statement runs on tokio's blocking pool. Dropping the returned
    /// future interrupts the statement.
    pub async fn execute_async(&self, command: Command) -> Result<Outcome> {
        self.execute_cancellable(command, std::future::pending()).await
    }

    /// Asynchronous execution that aborts when `cancel` completes.
    ///
    /// On cancellation the in-flight statement is interrupted and the call
    /// waits until its connection is back in the pool. The worker's own
    /// result is returned: [`SprocketError::Cancelled`] when the interrupt
    /// stopped the statement (or it never started), the outcome when the
    /// statement had already completed.
    pub async fn execute_cancellable<F>(&self, command: Command, cancel: F) -> Result<Outcome>
    where
        F: Future<Output = ()>,
    {
        enum Race<T> {
            Finished(T),
            Cancelled,
        }

        let identifier = command.identifier().to_string();
        let control = Arc::new(CallControl::default());
        let guard = control.interrupt_on_drop();

        let runtime = Arc::clone(&self.runtime);
        let worker = Arc::clone(&control);
        let mut task = tokio::task::spawn_blocking(move || runtime.run(&command, Some(&worker)));

        tokio::pin!(cancel);
        let race = tokio::select! {
            joined = &mut task => Race::Finished(joined),
            () = &mut cancel => Race::Cancelled,
        };

        let result = match race {
            Race::Finished(joined) => joined
                .map_err(|e| SprocketError::execution(identifier.as_str(), format!("worker failed: {}", e)))?,
            Race::Cancelled => {
                debug!(command = %identifier, "cancelling in-flight command");
                control.cancel();
                // the worker may have finished before the interrupt landed
                match task.await {
                    Ok(result) => result,
                    Err(e) => Err(SprocketError::execution(identifier.as_str(), format!("worker failed: {}", e))),
                }
            }
        };
        guard.disarm();
        result
    }

    pub async fn exec_async<I: ToParam + ?Sized>(&self, target: Target, input: &I) -> Result<usize> {
        let command = Command::new(target).with_input(input)?;
        Ok(self.execute_async(command).await?.affected().unwrap_or(0))
    }

    pub async fn scalar_async<T: FromRaw, I: ToParam + ?Sized>(
        &self,
        target: Target,
        input: &I,
    ) -> Result<T> {
        let command = Command::new(target).with_input(input)?.expecting(Shape::Scalar);
        self.execute_async(command).await?.into_scalar()
    }

    pub async fn rows_async<T: FromRaw, I: ToParam + ?Sized>(
        &self,
        target: Target,
        input: &I,
    ) -> Result<Vec<T>> {
        let command = Command::new(target).with_input(input)?.expecting(Shape::ResultSet);
        self.execute_async(command).await?.into_rows()
    }

    /// Stores (or replaces) a procedure body in the catalog.
    pub fn define_procedure(&self, name: &str, body: &str) -> Result<()> {
        self.runtime.define_procedure(name, body)
    }

    /// Removes a procedure; returns whether it existed.
    pub fn drop_procedure(&self, name: &str) -> Result<bool> {
        self.runtime.drop_procedure(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coerce::Json;
    use crate::test_utils::TestDatabase;
    use serde::{Deserialize, Serialize};
    use std::io::Read;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tag {
        id: i64,
        label: String,
    }

    fn tags_fixture() -> TestDatabase {
        let db = TestDatabase::new();
        db.dispatcher
            .exec(
                Target::statement("CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT NOT NULL UNIQUE)"),
                &(),
            )
            .unwrap();
        db.dispatcher
            .define_procedure(
                "tag_add",
                "INSERT INTO tags (label) VALUES (json_extract(@Data, '$.label')) RETURNING id",
            )
            .unwrap();
        db.dispatcher
            .define_procedure(
                "tag_list",
                "SELECT json_object('id', id, 'label', label) FROM tags ORDER BY id",
            )
            .unwrap();
        db
    }

    #[test]
    fn test_command_builder() {
        let command = Command::procedure("tag_add")
            .with_input(&Json(Tag { id: 0, label: "x".into() }))
            .unwrap()
            .expecting(Shape::Scalar)
            .with_timeout(Duration::from_secs(2));
        assert_eq!(command.target(), &Target::Procedure("tag_add".into()));
        assert_eq!(command.shape(), Shape::Scalar);
        assert_eq!(command.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(command.input(), &Value::Text(r#"{"id":0,"label":"x"}"#.into()));
    }

    #[test]
    fn test_no_input_binds_null() {
        let command = Command::statement("SELECT 1");
        assert_eq!(command.input(), &Value::Null);
        let command = command.with_input(&None::<Json<Tag>>).unwrap();
        assert_eq!(command.input(), &Value::Null);
    }

    #[test]
    fn test_shapes_follow_declaration() {
        let db = tags_fixture();
        let d = &db.dispatcher;

        let id: i64 = d
            .scalar(Target::procedure("tag_add"), &Json(Tag { id: 0, label: "red".into() }))
            .unwrap();
        assert_eq!(id, 1);
        d.scalar::<i64, _>(Target::procedure("tag_add"), &Json(Tag { id: 0, label: "blue".into() }))
            .unwrap();

        let tags: Vec<Json<Tag>> = d.rows(Target::procedure("tag_list"), &()).unwrap();
        let labels: Vec<_> = tags.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["red", "blue"]);

        let outcome = d
            .execute(&Command::statement("UPDATE tags SET label = upper(label)"))
            .unwrap();
        assert_eq!(outcome, Outcome::Affected(2));

        let outcome = d
            .execute(&Command::statement("SELECT label FROM tags").expecting(Shape::Scalar))
            .unwrap();
        assert_eq!(outcome, Outcome::Scalar(Value::Text("RED".into())));
    }

    #[test]
    fn test_scalar_without_rows_is_default() {
        let db = tags_fixture();
        let missing: Json<Tag> = db
            .dispatcher
            .scalar(
                Target::statement("SELECT json_object('id', id) FROM tags WHERE id = @Data"),
                &42i64,
            )
            .unwrap();
        assert_eq!(missing.into_inner(), Tag::default());
    }

    #[test]
    fn test_statement_without_parameter_ignores_input() {
        let db = tags_fixture();
        let count: i64 = db
            .dispatcher
            .scalar(Target::statement("SELECT COUNT(*) FROM tags"), &"unused")
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_select_reports_zero_affected() {
        let db = tags_fixture();
        let affected = db.dispatcher.exec(Target::procedure("tag_list"), &()).unwrap();
        assert_eq!(affected, 0);
    }

    #[test]
    fn test_fetch_json_concatenates_rows() {
        let db = TestDatabase::new();
        let tag: Json<Tag> = db
            .dispatcher
            .fetch_json(
                Target::statement(
                    "SELECT part FROM (SELECT 1 AS n, '{\"id\":7,' AS part UNION ALL SELECT 2, '\"label\":\"split\"}') ORDER BY n",
                ),
                &(),
            )
            .unwrap();
        assert_eq!(tag.0, Tag { id: 7, label: "split".into() });
    }

    #[test]
    fn test_missing_procedure_is_execution_error() {
        let db = TestDatabase::new();
        match db.dispatcher.exec(Target::procedure("nope"), &()) {
            Err(SprocketError::Execution { command, message }) => {
                assert_eq!(command, "nope");
                assert!(message.contains("no procedure"), "{}", message);
            }
            other => panic!("Expected Execution error, got {:?}", other),
        }
    }

    #[test]
    fn test_constraint_violation_is_execution_error() {
        let db = tags_fixture();
        let tag = Json(Tag { id: 0, label: "dup".into() });
        db.dispatcher.scalar::<i64, _>(Target::procedure("tag_add"), &tag).unwrap();
        let err = db
            .dispatcher
            .scalar::<i64, _>(Target::procedure("tag_add"), &tag)
            .unwrap_err();
        assert_eq!(err.command(), Some("tag_add"));
        assert!(err.to_string().contains("UNIQUE"), "{}", err);
    }

    #[test]
    fn test_drop_procedure() {
        let db = tags_fixture();
        assert!(db.dispatcher.drop_procedure("tag_list").unwrap());
        assert!(!db.dispatcher.drop_procedure("tag_list").unwrap());
        assert!(db.dispatcher.exec(Target::procedure("tag_list"), &()).is_err());
    }

    #[test]
    fn test_open_stream_reads_all_rows() {
        let db = tags_fixture();
        for label in ["a", "b", "c"] {
            db.dispatcher
                .scalar::<i64, _>(Target::procedure("tag_add"), &Json(Tag { id: 0, label: label.into() }))
                .unwrap();
        }
        let mut stream = db
            .dispatcher
            .open_stream(Command::statement("SELECT label FROM tags ORDER BY id"))
            .unwrap();
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert_eq!(text, "abc");
    }

    #[test]
    fn test_timeout_is_distinct_error() {
        let db = TestDatabase::new();
        let command = Command::statement(crate::test_utils::SLOW_QUERY)
            .expecting(Shape::Scalar)
            .with_timeout(Duration::from_millis(50));
        match db.dispatcher.execute(&command) {
            Err(e @ SprocketError::Timeout { .. }) => assert!(e.is_retryable_read()),
            other => panic!("Expected Timeout, got {:?}", other),
        }
        // the interrupted connection is reusable
        let one: i64 = db.dispatcher.scalar(Target::statement("SELECT 1"), &()).unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_matches_sync() {
        let db = tags_fixture();
        let d = &db.dispatcher;
        let id: i64 = d
            .scalar_async(Target::procedure("tag_add"), &Json(Tag { id: 0, label: "async".into() }))
            .await
            .unwrap();
        assert_eq!(id, 1);
        let tags: Vec<Json<Tag>> = d.rows_async(Target::procedure("tag_list"), &()).await.unwrap();
        assert_eq!(tags.len(), 1);
        let affected = d
            .exec_async(Target::statement("DELETE FROM tags WHERE id = @Data"), &id)
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation_interrupts_statement() {
        let db = TestDatabase::new();
        let command = Command::statement(crate::test_utils::SLOW_QUERY).expecting(Shape::Scalar);
        let started = std::time::Instant::now();
        let result = db
            .dispatcher
            .execute_cancellable(command, tokio::time::sleep(Duration::from_millis(50)))
            .await;
        match result {
            Err(SprocketError::Cancelled { command }) => assert!(command.contains("RECURSIVE")),
            other => panic!("Expected Cancelled, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(10));

        let one: i64 = db
            .dispatcher
            .scalar_async(Target::statement("SELECT 1"), &())
            .await
            .unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_completed_write_is_not_reported_cancelled() {
        let db = TestDatabase::with_pool_size(2);
        db.dispatcher
            .exec(Target::statement("CREATE TABLE events (n INTEGER)"), &())
            .unwrap();
        let observer = rusqlite::Connection::open(&db.dispatcher.config().database.path).unwrap();

        for n in 0..20i64 {
            let command = Command::statement("INSERT INTO events (n) VALUES (@Data)").with_input(&n).unwrap();
            // fires only once the insert is committed and visible elsewhere
            let committed = async {
                loop {
                    let seen: i64 = observer
                        .query_row("SELECT COUNT(*) FROM events WHERE n = ?1", [n], |row| row.get(0))
                        .unwrap();
                    if seen > 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            };
            match db.dispatcher.execute_cancellable(command, committed).await {
                Ok(outcome) => assert_eq!(outcome.affected(), Some(1)),
                other => panic!("Committed insert {} reported as {:?}", n, other),
            }
        }
        let total: i64 = db
            .dispatcher
            .scalar(Target::statement("SELECT COUNT(*) FROM events"), &())
            .unwrap();
        assert_eq!(total, 20);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_timeout() {
        let db = TestDatabase::new();
        let command = Command::statement(crate::test_utils::SLOW_QUERY)
            .expecting(Shape::Scalar)
            .with_timeout(Duration::from_millis(50));
        assert!(matches!(
            db.dispatcher.execute_async(command).await,
            Err(SprocketError::Timeout { .. })
        ));
    }
}
