/// Query Execution Module
///
/// Runs one framed statement per acquired connection with the single named
/// parameter bound, and classifies provider failures. Timeouts are checked
/// by a progress handler on the executing connection; cancellation goes
/// through the connection's interrupt handle.

use crate::command::{Command, Outcome, Shape, Target};
use crate::config::Config;
use crate::core::db::connection::{Pool, PooledConnection};
use crate::core::{Result, SprocketError};
use rusqlite::types::Value;
use rusqlite::{Batch, Connection, ErrorCode, InterruptHandle, OptionalExtension, Statement};
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// VM instructions between two deadline checks
const PROGRESS_STEPS: i32 = 1_000;

/// Interrupts a connection's statement once it runs past a deadline.
///
/// Installed as the connection's progress handler, so the deadline is
/// checked from the executing thread itself. Dropping the watchdog removes
/// the handler before the connection can go back to the pool.
pub struct Watchdog<'c> {
    conn: &'c Connection,
    fired: Arc<AtomicBool>,
}

impl<'c> Watchdog<'c> {
    pub fn arm(conn: &'c Connection, timeout: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        // no deadline when the timeout does not fit in an Instant
        let deadline = Instant::now().checked_add(timeout);
        conn.progress_handler(
            PROGRESS_STEPS,
            Some(move || {
                let expired = deadline.map_or(false, |deadline| Instant::now() >= deadline);
                if expired {
                    flag.store(true, Ordering::SeqCst);
                }
                expired
            }),
        );
        Watchdog { conn, fired }
    }

    /// Whether the deadline passed and the statement was interrupted.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }
}

/// Cancellation state shared between an async caller and the blocking
/// worker running its statement.
#[derive(Default)]
pub struct CallControl {
    cancelled: AtomicBool,
    handle: Mutex<Option<InterruptHandle>>,
}

impl CallControl {
    /// Marks the call cancelled and interrupts its statement if one is running.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.as_ref() {
            handle.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Guard that cancels the call unless disarmed, for futures dropped mid-call.
    pub fn interrupt_on_drop(self: &Arc<Self>) -> InterruptOnDrop {
        InterruptOnDrop {
            control: Some(Arc::clone(self)),
        }
    }

    /// Registers the connection so `cancel` can reach it. Returns `None` if
    /// the call was cancelled before it got a connection.
    fn attach(&self, conn: &Connection) -> Option<Attachment<'_>> {
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn.get_interrupt_handle());
        if self.is_cancelled() {
            self.detach();
            return None;
        }
        Some(Attachment { control: self })
    }

    fn detach(&self) {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Keeps a [`CallControl`] attached until the statement finishes.
struct Attachment<'a> {
    control: &'a CallControl,
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        self.control.detach();
    }
}

/// See [`CallControl::interrupt_on_drop`].
pub struct InterruptOnDrop {
    control: Option<Arc<CallControl>>,
}

impl InterruptOnDrop {
    pub fn disarm(mut self) {
        self.control.take();
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            control.cancel();
        }
    }
}

fn is_interrupt(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted)
}

/// Binds `input` to the named parameter when the statement references it.
fn bind_input(stmt: &mut Statement<'_>, name: &str, input: &Value) -> rusqlite::Result<()> {
    if let Some(index) = stmt.parameter_index(name)? {
        stmt.raw_bind_parameter(index, input)?;
    }
    Ok(())
}

fn total_changes(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT total_changes()", [], |row| row.get(0))
}

/// Fails unless `sql` is exactly one statement. Preparing only compiles
/// the first statement of a text, so anything after it would be dropped.
fn ensure_single_statement(conn: &Connection, identifier: &str, sql: &str) -> Result<()> {
    let mut batch = Batch::new(conn, sql);
    if batch.next().map_err(|e| SprocketError::execution(identifier, e))?.is_none() {
        return Err(SprocketError::execution(identifier, "statement text is empty"));
    }
    match batch.next() {
        Ok(None) => Ok(()),
        Ok(Some(_)) | Err(_) => Err(SprocketError::execution(
            identifier,
            "statement text holds more than one statement",
        )),
    }
}

/// Executes `sql` once and collects what `shape` asks for.
fn execute_shape(conn: &Connection, sql: &str, parameter: &str, input: &Value, shape: Shape) -> rusqlite::Result<Outcome> {
    let mut stmt = conn.prepare(sql)?;
    bind_input(&mut stmt, parameter, input)?;
    match shape {
        Shape::None if stmt.column_count() == 0 => Ok(Outcome::Affected(stmt.raw_execute()?)),
        Shape::None => {
            // Statements returning rows (SELECT, RETURNING) are drained and
            // measured through the connection's change counter
            let before = total_changes(conn)?;
            {
                let mut rows = stmt.raw_query();
                while rows.next()?.is_some() {}
            }
            let after = total_changes(conn)?;
            Ok(Outcome::Affected((after - before).max(0) as usize))
        }
        Shape::Scalar => {
            let mut rows = stmt.raw_query();
            let value = match rows.next()? {
                Some(row) => row.get::<_, Value>(0)?,
                None => Value::Null,
            };
            Ok(Outcome::Scalar(value))
        }
        Shape::ResultSet => {
            let mut rows = stmt.raw_query();
            let mut values = Vec::new();
            while let Some(row) = rows.next()? {
                values.push(row.get::<_, Value>(0)?);
            }
            Ok(Outcome::Rows(values))
        }
    }
}

/// Owns the pool and configuration; every command goes through here.
#[derive(Debug)]
pub struct Runtime {
    pool: Pool,
    config: Arc<Config>,
}

impl Runtime {
    /// Validates `config`, builds the pool and makes sure the procedure
    /// catalog exists.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let pool = Pool::new(&config.database)?;
        let runtime = Runtime {
            pool,
            config: Arc::new(config),
        };
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (name TEXT PRIMARY KEY, body TEXT NOT NULL)",
            runtime.config.database.procedure_table
        );
        runtime
            .acquire()?
            .execute_batch(&ddl)
            .map_err(|e| SprocketError::execution(ddl.as_str(), e))?;
        debug!("Runtime ready on {}", runtime.config.database.path);
        Ok(runtime)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn acquire(&self) -> Result<PooledConnection> {
        self.pool.get()
    }

    /// The single parameter name every command binds.
    pub fn parameter_name(&self) -> &str {
        &self.config.execution.parameter_name
    }

    /// Turns a target into statement text. Procedures are looked up in the
    /// catalog; statements are used as written.
    fn frame(&self, conn: &Connection, target: &Target) -> Result<String> {
        match target {
            Target::Statement(text) => Ok(text.clone()),
            Target::Procedure(name) => {
                let sql = format!(
                    "SELECT body FROM {} WHERE name = ?1",
                    self.config.database.procedure_table
                );
                conn.query_row(&sql, [name], |row| row.get::<_, String>(0))
                    .optional()
                    .map_err(|e| SprocketError::execution(name.as_str(), e))?
                    .ok_or_else(|| SprocketError::execution(name.as_str(), format!("no procedure named {:?}", name)))
            }
        }
    }

    fn classify(&self, command: &Command, timeout: Duration, fired: bool, control: Option<&CallControl>, err: rusqlite::Error) -> SprocketError {
        let identifier = command.identifier().to_string();
        if is_interrupt(&err) {
            if fired {
                return SprocketError::Timeout { command: identifier, timeout };
            }
            if control.map_or(false, CallControl::is_cancelled) {
                return SprocketError::Cancelled { command: identifier };
            }
        }
        SprocketError::execution(identifier, err)
    }

    /// Runs one command on a freshly acquired connection.
    ///
    /// The connection goes back to the pool on every exit path. Interrupts
    /// are disarmed before that happens.
    pub fn run(&self, command: &Command, control: Option<&CallControl>) -> Result<Outcome> {
        let conn = self.acquire()?;
        let _attachment = match control {
            Some(control) => Some(control.attach(&conn).ok_or_else(|| SprocketError::Cancelled {
                command: command.identifier().to_string(),
            })?),
            None => None,
        };

        let sql = self.frame(&conn, command.target())?;
        ensure_single_statement(&conn, command.identifier(), &sql)?;
        let timeout = command.timeout().unwrap_or_else(|| self.config.execution.default_timeout());
        let started = Instant::now();

        let watchdog = Watchdog::arm(&conn, timeout);
        let result = execute_shape(&conn, &sql, self.parameter_name(), command.input(), command.shape());
        let fired = watchdog.fired();
        drop(watchdog);

        match result {
            Ok(outcome) => {
                debug!(
                    command = %command.identifier(),
                    shape = ?command.shape(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "command completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                let err = self.classify(command, timeout, fired, control, e);
                debug!(command = %command.identifier(), error = %err, "command failed");
                Err(err)
            }
        }
    }

    /// Prepares a stream over the command's result.
    ///
    /// The stream holds a pooled connection from here on. The statement
    /// starts on the first read and rows are stepped one at a time as the
    /// caller reads; the connection is released once the last row has been
    /// read or the stream is dropped. The command's timeout bounds the whole
    /// stream, including time spent waiting on the reader.
    pub fn open_stream(&self, command: Command) -> Result<ResultStream> {
        let conn = self.acquire()?;
        let sql = self.frame(&conn, command.target())?;
        ensure_single_statement(&conn, command.identifier(), &sql)?;
        let timeout = command.timeout().unwrap_or_else(|| self.config.execution.default_timeout());
        Ok(ResultStream {
            pending: Some(StreamJob {
                conn,
                sql,
                parameter: self.parameter_name().to_string(),
                command,
                timeout,
            }),
            producer: None,
            buffer: Cursor::new(Vec::new()),
        })
    }

    /// Stores (or replaces) a procedure body. The body must compile as a
    /// single statement against the current schema.
    pub fn define_procedure(&self, name: &str, body: &str) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (name, body) VALUES (?1, ?2)",
            self.config.database.procedure_table
        );
        let conn = self.acquire()?;
        ensure_single_statement(&conn, name, body)?;
        conn.execute(&sql, [name, body])
            .map_err(|e| SprocketError::execution(name, e))?;
        debug!("Defined procedure {}", name);
        Ok(())
    }

    pub fn drop_procedure(&self, name: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE name = ?1", self.config.database.procedure_table);
        let removed = self
            .acquire()?
            .execute(&sql, [name])
            .map_err(|e| SprocketError::execution(name, e))?;
        Ok(removed > 0)
    }
}

/// What the producer thread hands to the reader, one at a time.
enum Piece {
    Row(Vec<u8>),
    Failed(SprocketError),
    Done,
}

/// Why the producer stopped stepping rows early.
enum Stop {
    Failed(rusqlite::Error),
    ReaderGone,
}

/// Everything needed to start a stream's statement.
struct StreamJob {
    conn: PooledConnection,
    sql: String,
    parameter: String,
    command: Command,
    timeout: Duration,
}

impl StreamJob {
    /// Runs on the producer thread. The connection is dropped only after the
    /// reader has taken the last piece or gone away.
    fn produce(self, out: SyncSender<Piece>) {
        let StreamJob {
            conn,
            sql,
            parameter,
            command,
            timeout,
        } = self;
        let watchdog = Watchdog::arm(&conn, timeout);
        let result = step_rows(&conn, &sql, &parameter, command.input(), &out);
        let fired = watchdog.fired();
        drop(watchdog);

        let last = match result {
            Ok(()) => Piece::Done,
            Err(Stop::ReaderGone) => return,
            Err(Stop::Failed(e)) if fired && is_interrupt(&e) => Piece::Failed(SprocketError::Timeout {
                command: command.identifier().to_string(),
                timeout,
            }),
            Err(Stop::Failed(e)) => Piece::Failed(SprocketError::execution(command.identifier(), e)),
        };
        let _ = out.send(last);
    }
}

/// Steps the statement and sends the first column of each row. Text goes out
/// as UTF-8 bytes, blobs as-is, numbers in their decimal form; NULL is skipped.
fn step_rows(
    conn: &Connection,
    sql: &str,
    parameter: &str,
    input: &Value,
    out: &SyncSender<Piece>,
) -> std::result::Result<(), Stop> {
    let mut stmt = conn.prepare(sql).map_err(Stop::Failed)?;
    bind_input(&mut stmt, parameter, input).map_err(Stop::Failed)?;
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next().map_err(Stop::Failed)? {
        let bytes = match row.get::<_, Value>(0).map_err(Stop::Failed)? {
            Value::Null => continue,
            Value::Integer(i) => i.to_string().into_bytes(),
            Value::Real(f) => f.to_string().into_bytes(),
            Value::Text(s) => s.into_bytes(),
            Value::Blob(b) => b,
        };
        out.send(Piece::Row(bytes)).map_err(|_| Stop::ReaderGone)?;
    }
    Ok(())
}

/// A running stream: the producer thread owns the connection and hands over
/// rows through a rendezvous channel, so it never runs ahead of the reader.
struct Producer {
    pieces: Receiver<Piece>,
    interrupt: InterruptHandle,
    worker: thread::JoinHandle<()>,
}

impl Producer {
    fn start(job: StreamJob) -> io::Result<Self> {
        let interrupt = job.conn.get_interrupt_handle();
        let (out, pieces) = mpsc::sync_channel(0);
        let worker = thread::Builder::new()
            .name("sprocket-stream".to_string())
            .spawn(move || job.produce(out))?;
        Ok(Producer {
            pieces,
            interrupt,
            worker,
        })
    }

    /// Stops the producer and waits until its connection is back in the pool.
    ///
    /// `interrupt` must only be set while the producer still owns the
    /// connection, i.e. before the final piece has been received.
    fn close(self, interrupt: bool) {
        if interrupt {
            self.interrupt.interrupt();
        }
        drop(self.pieces);
        if self.worker.join().is_err() {
            warn!("Stream worker panicked");
        }
    }
}

/// `Read` over the first column of every row of a command's result, in
/// row order. Text is read as UTF-8 bytes, blobs as-is, NULL rows are skipped.
pub struct ResultStream {
    pending: Option<StreamJob>,
    producer: Option<Producer>,
    buffer: Cursor<Vec<u8>>,
}

impl ResultStream {
    /// Whether the stream still holds its connection.
    pub fn is_open(&self) -> bool {
        self.pending.is_some() || self.producer.is_some()
    }

    fn finish(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.close(false);
        }
    }
}

impl Read for ResultStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.buffer.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            if let Some(job) = self.pending.take() {
                self.producer = Some(Producer::start(job)?);
            }
            let Some(producer) = self.producer.as_ref() else { return Ok(0) };
            match producer.pieces.recv() {
                Ok(Piece::Row(bytes)) => self.buffer = Cursor::new(bytes),
                Ok(Piece::Failed(e)) => {
                    self.finish();
                    return Err(io::Error::new(io::ErrorKind::Other, e));
                }
                Ok(Piece::Done) | Err(_) => {
                    self.finish();
                    return Ok(0);
                }
            }
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        // the reader never saw the final piece, so the producer still owns its connection
        if let Some(producer) = self.producer.take() {
            producer.close(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestDatabase, SLOW_QUERY};

    #[test]
    fn test_watchdog_fires_after_deadline() {
        let conn = Connection::open_in_memory().unwrap();
        let watchdog = Watchdog::arm(&conn, Duration::from_millis(20));
        let err = conn
            .query_row(SLOW_QUERY, [], |row| row.get::<_, i64>(0))
            .unwrap_err();
        assert!(is_interrupt(&err));
        assert!(watchdog.fired());
    }

    #[test]
    fn test_disarmed_watchdog_stays_quiet() {
        let conn = Connection::open_in_memory().unwrap();
        let watchdog = Watchdog::arm(&conn, Duration::from_secs(60));
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
        assert!(!watchdog.fired());
    }

    #[test]
    fn test_cancel_before_attach_refuses_connection() {
        let conn = Connection::open_in_memory().unwrap();
        let control = CallControl::default();
        control.cancel();
        assert!(control.attach(&conn).is_none());
    }

    #[test]
    fn test_run_cancelled_call_is_reported() {
        let db = TestDatabase::new();
        let control = CallControl::default();
        control.cancel();
        let command = Command::statement("SELECT 1").expecting(Shape::Scalar);
        assert!(matches!(
            db.runtime().run(&command, Some(&control)),
            Err(SprocketError::Cancelled { .. })
        ));
        // connection went back to the pool
        assert_eq!(db.runtime().pool().status().idle, db.runtime().pool().status().open);
    }

    #[test]
    fn test_connection_released_after_failure() {
        let db = TestDatabase::with_pool_size(1);
        for _ in 0..3 {
            let command = Command::statement("SELECT * FROM missing_table").expecting(Shape::ResultSet);
            assert!(matches!(
                db.runtime().run(&command, None),
                Err(SprocketError::Execution { .. })
            ));
        }
        assert_eq!(db.runtime().pool().status().idle, 1);
    }

    #[test]
    fn test_named_parameter_is_configurable() {
        let mut config = TestDatabase::config();
        config.execution.parameter_name = ":payload".to_string();
        let db = TestDatabase::with_config(config);
        let command = Command::statement("SELECT :payload || '!'")
            .with_input("hi")
            .unwrap()
            .expecting(Shape::Scalar);
        assert_eq!(
            db.runtime().run(&command, None).unwrap(),
            Outcome::Scalar(Value::Text("hi!".into()))
        );
    }

    #[test]
    fn test_stream_holds_connection_until_read() {
        let db = TestDatabase::with_pool_size(1);
        let mut stream = db
            .runtime()
            .open_stream(Command::statement("SELECT 'abc' UNION ALL SELECT NULL UNION ALL SELECT x'0102'"))
            .unwrap();
        assert!(stream.is_open());
        assert_eq!(db.runtime().pool().status().idle, 0);

        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"abc\x01\x02");
        assert!(!stream.is_open());
        assert_eq!(db.runtime().pool().status().idle, 1);
    }

    #[test]
    fn test_partly_read_stream_keeps_connection() {
        let db = TestDatabase::with_pool_size(1);
        let mut stream = db.runtime().open_stream(Command::statement("SELECT 'abcdef'")).unwrap();

        let mut first = [0u8; 1];
        stream.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"a");
        assert!(stream.is_open());
        assert_eq!(db.runtime().pool().status().idle, 0);

        let mut rest = String::new();
        stream.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "bcdef");
        assert!(!stream.is_open());
        assert_eq!(db.runtime().pool().status().idle, 1);
    }

    #[test]
    fn test_stream_steps_rows_on_demand() {
        let db = TestDatabase::with_pool_size(1);
        // endless result: only what is read gets produced
        let mut stream = db
            .runtime()
            .open_stream(Command::statement(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT x FROM n",
            ))
            .unwrap();
        let mut head = [0u8; 5];
        stream.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"12345");

        drop(stream);
        assert_eq!(db.runtime().pool().status().idle, 1);
        let one: i64 = db.runtime().acquire().unwrap().query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn test_stream_rejects_bad_statement_on_open() {
        let db = TestDatabase::with_pool_size(1);
        assert!(matches!(
            db.runtime().open_stream(Command::statement("SELECT * FROM missing_table")),
            Err(SprocketError::Execution { .. })
        ));
        assert_eq!(db.runtime().pool().status().idle, 1);
    }

    #[test]
    fn test_multiple_statements_are_rejected() {
        let db = TestDatabase::new();
        let runtime = db.runtime();
        runtime
            .run(&Command::statement("CREATE TABLE t (x INTEGER)"), None)
            .unwrap();

        let err = runtime
            .define_procedure("two", "INSERT INTO t VALUES (1); INSERT INTO t VALUES (2)")
            .unwrap_err();
        assert!(err.to_string().contains("more than one statement"), "{}", err);

        let err = runtime
            .run(&Command::statement("INSERT INTO t VALUES (1); INSERT INTO t VALUES (2)"), None)
            .unwrap_err();
        assert!(matches!(err, SprocketError::Execution { .. }));

        let count = Command::statement("SELECT COUNT(*) FROM t;").expecting(Shape::Scalar);
        assert_eq!(runtime.run(&count, None).unwrap(), Outcome::Scalar(Value::Integer(0)));
    }

    #[test]
    fn test_dropped_watchdog_removes_handler() {
        let conn = Connection::open_in_memory().unwrap();
        drop(Watchdog::arm(&conn, Duration::ZERO));
        let total: i64 = conn
            .query_row(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 100000) SELECT SUM(x) FROM n",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(total, 5_000_050_000);
    }

    #[test]
    fn test_dropped_stream_releases_connection() {
        let db = TestDatabase::with_pool_size(1);
        let stream = db.runtime().open_stream(Command::statement("SELECT 1")).unwrap();
        drop(stream);
        assert_eq!(db.runtime().pool().status().idle, 1);
    }
}
