//! The unit-of-work context.
//!
//! A [`TransactionalContext`] is either *free* or *bound*:
//!
//! - **Free**: every call checks a connection out of the pool for the
//!   duration of that one statement and returns it immediately. No
//!   transaction wraps the call, and no session state survives between
//!   calls.
//! - **Bound**: the context owns one checked-out connection with one open
//!   transaction; every call runs inside it until the context is closed.
//!
//! The bound variant carries the connection and the transaction status
//! together, so a bound context without a connection cannot be expressed.
//! Only [`ContextManager`](crate::ContextManager) moves a context from free
//! to bound; [`TransactionalContext::close`] (or dropping the context) moves
//! it back.
//!
//! Each query shape has a blocking form and an `_async` form. The async form
//! runs the blocking driver call on tokio's blocking pool and honours a
//! [`CancelSignal`]. The blocking forms must not be called from an async
//! task.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use postgres::{CancelToken, Client, NoTls};

use crate::cancel::CancelSignal;
use crate::error::DbError;
use crate::isolation::IsolationLevel;
use crate::params::{self, Params};
use crate::pool::{self, DbPool, PooledSession};
use crate::row::FromRow;

/// Observable lifecycle state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// Connection-per-call.
    Free,
    /// Holding a transaction at the given isolation level.
    Bound(IsolationLevel),
}

enum ContextState {
    Free,
    Bound(BoundTransaction),
}

struct BoundTransaction {
    session: Arc<Mutex<BoundSession>>,
    cancel_token: CancelToken,
    isolation: IsolationLevel,
}

struct BoundSession {
    conn: PooledSession,
    status: TransactionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    /// Interrupted by cancellation or a failed commit/rollback; the
    /// connection is discarded on close.
    Aborted,
}

impl BoundSession {
    fn ensure_active(&self) -> Result<(), DbError> {
        let finished = match self.status {
            TransactionStatus::Active => return Ok(()),
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled back",
            TransactionStatus::Aborted => "aborted",
        };
        Err(DbError::illegal_state(format!(
            "transaction was already {finished}; close the context before starting another"
        )))
    }
}

#[derive(Debug, Clone, Copy)]
enum Completion {
    Commit,
    Rollback,
}

impl Completion {
    fn statement(self) -> &'static str {
        match self {
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        }
    }

    fn status(self) -> TransactionStatus {
        match self {
            Self::Commit => TransactionStatus::Committed,
            Self::Rollback => TransactionStatus::RolledBack,
        }
    }
}

/// What a single call runs on: a transient pooled connection or the bound
/// transaction's connection.
enum SessionLease {
    Pooled(PooledSession),
    Bound(Arc<Mutex<BoundSession>>),
}

impl SessionLease {
    fn run<T, F>(self, op: F, interrupt: Option<&Interrupt>) -> Result<T, DbError>
    where
        F: FnOnce(&mut Client) -> Result<T, DbError>,
    {
        match self {
            Self::Pooled(mut conn) => {
                if interrupt.is_some_and(|i| !i.start()) {
                    return Err(DbError::Cancelled);
                }
                let result = op(conn.client()?);
                if interrupt.is_some_and(Interrupt::finish) {
                    conn.discard();
                }
                result
            }
            Self::Bound(session) => {
                let mut guard = lock_session(&session)?;
                guard.ensure_active()?;
                // Concurrent calls on one bound context queue on the session
                // lock; a cancel before this point must not reach the
                // statement of whichever call holds it now.
                if interrupt.is_some_and(|i| !i.start()) {
                    return Err(DbError::Cancelled);
                }
                let result = op(guard.conn.client()?);
                if interrupt.is_some_and(Interrupt::finish) {
                    guard.status = TransactionStatus::Aborted;
                    guard.conn.discard();
                }
                result
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptState {
    Waiting,
    Running,
    Finished,
    Interrupted,
}

/// Handshake between a blocking call and its canceller: whichever takes the
/// lock first decides whether the call completed or was interrupted. A call
/// still waiting for its connection is stopped without a server round trip.
struct Interrupt {
    state: Mutex<InterruptState>,
}

impl Interrupt {
    fn new() -> Self {
        Self {
            state: Mutex::new(InterruptState::Waiting),
        }
    }

    /// Called by the worker once it owns the connection. Returns `false` if
    /// the call was cancelled while waiting and must not run.
    fn start(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == InterruptState::Interrupted {
            return false;
        }
        *state = InterruptState::Running;
        true
    }

    /// Called by the worker when the call returns. Returns `true` if the
    /// canceller got there first.
    fn finish(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == InterruptState::Interrupted {
            return true;
        }
        *state = InterruptState::Finished;
        false
    }

    /// Marks the call interrupted unless it already finished, calling
    /// `send_cancel` only if the statement is running. The lock is held while
    /// sending so the worker cannot hand the connection back in the meantime.
    fn interrupt<F: FnOnce()>(&self, send_cancel: F) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            InterruptState::Finished | InterruptState::Interrupted => false,
            InterruptState::Waiting => {
                *state = InterruptState::Interrupted;
                true
            }
            InterruptState::Running => {
                *state = InterruptState::Interrupted;
                send_cancel();
                true
            }
        }
    }
}

fn send_cancel(token: &CancelToken) {
    if let Err(e) = token.cancel_query(NoTls) {
        tracing::warn!(error = %e, "failed to send cancel request");
    }
}

fn lock_session(session: &Mutex<BoundSession>) -> Result<MutexGuard<'_, BoundSession>, DbError> {
    session
        .lock()
        .map_err(|_| DbError::illegal_state("bound session was poisoned by a panicked call"))
}

/// A unit of work over the shared connection pool.
pub struct TransactionalContext {
    pool: DbPool,
    state: ContextState,
}

impl TransactionalContext {
    pub(crate) fn new(pool: DbPool) -> Self {
        Self {
            pool,
            state: ContextState::Free,
        }
    }

    pub fn mode(&self) -> ContextMode {
        match &self.state {
            ContextState::Free => ContextMode::Free,
            ContextState::Bound(bound) => ContextMode::Bound(bound.isolation),
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.state, ContextState::Bound(_))
    }

    // ── lifecycle ────────────────────────────────────────────────────

    fn ensure_free(&self) -> Result<(), DbError> {
        match self.state {
            ContextState::Free => Ok(()),
            ContextState::Bound(_) => Err(DbError::illegal_state(
                "context is already bound to a transaction; nested transactions are not supported",
            )),
        }
    }

    pub(crate) fn begin_transaction(&mut self, isolation: IsolationLevel) -> Result<(), DbError> {
        self.ensure_free()?;
        let (conn, cancel_token) = open_transaction(&self.pool, isolation)?;
        self.install(conn, cancel_token, isolation);
        Ok(())
    }

    pub(crate) async fn begin_transaction_async(
        &mut self,
        isolation: IsolationLevel,
    ) -> Result<(), DbError> {
        self.ensure_free()?;
        let pool = self.pool.clone();
        let (conn, cancel_token) =
            tokio::task::spawn_blocking(move || open_transaction(&pool, isolation)).await??;
        self.install(conn, cancel_token, isolation);
        Ok(())
    }

    fn install(&mut self, conn: PooledSession, cancel_token: CancelToken, isolation: IsolationLevel) {
        self.state = ContextState::Bound(BoundTransaction {
            session: Arc::new(Mutex::new(BoundSession {
                conn,
                status: TransactionStatus::Active,
            })),
            cancel_token,
            isolation,
        });
        tracing::debug!(isolation = %isolation, "context bound to transaction");
    }

    fn bound_session(&self, action: &str) -> Result<Arc<Mutex<BoundSession>>, DbError> {
        match &self.state {
            ContextState::Bound(bound) => Ok(Arc::clone(&bound.session)),
            ContextState::Free => Err(DbError::illegal_state(format!(
                "cannot {action}: context has no open transaction"
            ))),
        }
    }

    /// Commits the bound transaction. The context stays bound (and rejects
    /// further statements) until closed.
    pub fn commit(&mut self) -> Result<(), DbError> {
        let session = self.bound_session("commit")?;
        finish_session(&session, Completion::Commit)
    }

    /// Rolls back the bound transaction.
    pub fn rollback(&mut self) -> Result<(), DbError> {
        let session = self.bound_session("roll back")?;
        finish_session(&session, Completion::Rollback)
    }

    pub async fn commit_async(&mut self) -> Result<(), DbError> {
        let session = self.bound_session("commit")?;
        tokio::task::spawn_blocking(move || finish_session(&session, Completion::Commit)).await?
    }

    pub async fn rollback_async(&mut self) -> Result<(), DbError> {
        let session = self.bound_session("roll back")?;
        tokio::task::spawn_blocking(move || finish_session(&session, Completion::Rollback)).await?
    }

    /// Ends the unit of work: rolls back an unfinished transaction, returns
    /// the connection to the pool and leaves the context free. Closing a
    /// free context does nothing.
    pub fn close(&mut self) {
        if let ContextState::Bound(bound) = std::mem::replace(&mut self.state, ContextState::Free) {
            release(bound);
        }
    }

    /// [`close`](Self::close) without blocking the async runtime.
    pub async fn close_async(&mut self) {
        if let ContextState::Bound(bound) = std::mem::replace(&mut self.state, ContextState::Free) {
            if let Err(e) = tokio::task::spawn_blocking(move || release(bound)).await {
                tracing::warn!(error = %e, "releasing bound context failed");
            }
        }
    }

    // ── connection routing ───────────────────────────────────────────

    fn lease(&self) -> Result<SessionLease, DbError> {
        match &self.state {
            ContextState::Free => {
                let (conn, _) = checkout(&self.pool)?;
                Ok(SessionLease::Pooled(conn))
            }
            ContextState::Bound(bound) => Ok(SessionLease::Bound(Arc::clone(&bound.session))),
        }
    }

    fn with_client<T, F>(&self, op: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut Client) -> Result<T, DbError>,
    {
        self.lease()?.run(op, None)
    }

    async fn with_client_async<T, F>(&self, cancel: &CancelSignal, op: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Client) -> Result<T, DbError> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }

        let (lease, cancel_token) = match &self.state {
            ContextState::Free => {
                let pool = self.pool.clone();
                let pending = tokio::task::spawn_blocking(move || checkout(&pool));
                let (conn, token) = tokio::select! {
                    joined = pending => joined??,
                    () = cancel.cancelled() => return Err(DbError::Cancelled),
                };
                (SessionLease::Pooled(conn), token)
            }
            ContextState::Bound(bound) => (
                SessionLease::Bound(Arc::clone(&bound.session)),
                bound.cancel_token.clone(),
            ),
        };

        let interrupt = Arc::new(Interrupt::new());
        let mut task = tokio::task::spawn_blocking({
            let interrupt = Arc::clone(&interrupt);
            move || lease.run(op, Some(interrupt.as_ref()))
        });

        tokio::select! {
            joined = &mut task => joined?,
            () = cancel.cancelled() => {
                let interrupted = tokio::task::spawn_blocking(move || {
                    interrupt.interrupt(|| send_cancel(&cancel_token))
                })
                .await?;
                let outcome = task.await?;
                if interrupted {
                    tracing::debug!("database call cancelled by caller");
                    Err(DbError::Cancelled)
                } else {
                    outcome
                }
            }
        }
    }

    // ── query shapes ─────────────────────────────────────────────────

    /// Exactly one row; zero rows is [`DbError::NotFound`], more than one is
    /// [`DbError::MultipleRows`].
    pub fn query_single<T: FromRow>(&self, sql: &str, params: &Params) -> Result<T, DbError> {
        self.with_client(|client| exactly_one(fetch(client, sql, params)?))
    }

    /// At most one row; zero rows is `Ok(None)`.
    pub fn query_single_or_default<T: FromRow>(
        &self,
        sql: &str,
        params: &Params,
    ) -> Result<Option<T>, DbError> {
        self.with_client(|client| at_most_one(fetch(client, sql, params)?))
    }

    /// Every row, fully buffered.
    pub fn query_many<T: FromRow>(&self, sql: &str, params: &Params) -> Result<Vec<T>, DbError> {
        self.with_client(|client| fetch(client, sql, params))
    }

    /// The first row; zero rows is [`DbError::NotFound`].
    pub fn query_first<T: FromRow>(&self, sql: &str, params: &Params) -> Result<T, DbError> {
        self.with_client(|client| first(fetch(client, sql, params)?).ok_or(DbError::NotFound))
    }

    /// The first row, or `Ok(None)` when there are none.
    pub fn query_first_or_default<T: FromRow>(
        &self,
        sql: &str,
        params: &Params,
    ) -> Result<Option<T>, DbError> {
        self.with_client(|client| Ok(first(fetch(client, sql, params)?)))
    }

    /// Runs one statement and returns the number of rows affected.
    pub fn execute(&self, sql: &str, params: &Params) -> Result<u64, DbError> {
        self.with_client(|client| execute(client, sql, params))
    }

    /// Runs parameterless, possibly multi-statement SQL text verbatim.
    pub fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        self.with_client(|client| client.batch_execute(sql).map_err(DbError::from))
    }

    pub async fn query_single_async<T>(
        &self,
        sql: &str,
        params: Params,
        cancel: &CancelSignal,
    ) -> Result<T, DbError>
    where
        T: FromRow + Send + 'static,
    {
        let sql = sql.to_owned();
        self.with_client_async(cancel, move |client| {
            exactly_one(fetch(client, &sql, &params)?)
        })
        .await
    }

    pub async fn query_single_or_default_async<T>(
        &self,
        sql: &str,
        params: Params,
        cancel: &CancelSignal,
    ) -> Result<Option<T>, DbError>
    where
        T: FromRow + Send + 'static,
    {
        let sql = sql.to_owned();
        self.with_client_async(cancel, move |client| {
            at_most_one(fetch(client, &sql, &params)?)
        })
        .await
    }

    pub async fn query_many_async<T>(
        &self,
        sql: &str,
        params: Params,
        cancel: &CancelSignal,
    ) -> Result<Vec<T>, DbError>
    where
        T: FromRow + Send + 'static,
    {
        let sql = sql.to_owned();
        self.with_client_async(cancel, move |client| fetch(client, &sql, &params))
            .await
    }

    pub async fn query_first_async<T>(
        &self,
        sql: &str,
        params: Params,
        cancel: &CancelSignal,
    ) -> Result<T, DbError>
    where
        T: FromRow + Send + 'static,
    {
        let sql = sql.to_owned();
        self.with_client_async(cancel, move |client| {
            first(fetch(client, &sql, &params)?).ok_or(DbError::NotFound)
        })
        .await
    }

    pub async fn query_first_or_default_async<T>(
        &self,
        sql: &str,
        params: Params,
        cancel: &CancelSignal,
    ) -> Result<Option<T>, DbError>
    where
        T: FromRow + Send + 'static,
    {
        let sql = sql.to_owned();
        self.with_client_async(cancel, move |client| {
            Ok(first(fetch(client, &sql, &params)?))
        })
        .await
    }

    pub async fn execute_async(
        &self,
        sql: &str,
        params: Params,
        cancel: &CancelSignal,
    ) -> Result<u64, DbError> {
        let sql = sql.to_owned();
        self.with_client_async(cancel, move |client| execute(client, &sql, &params))
            .await
    }

    pub async fn execute_batch_async(&self, sql: &str, cancel: &CancelSignal) -> Result<(), DbError> {
        let sql = sql.to_owned();
        self.with_client_async(cancel, move |client| {
            client.batch_execute(&sql).map_err(DbError::from)
        })
        .await
    }
}

impl Drop for TransactionalContext {
    fn drop(&mut self) {
        if let ContextState::Bound(bound) = std::mem::replace(&mut self.state, ContextState::Free) {
            pool::off_runtime(move || release(bound));
        }
    }
}

impl fmt::Debug for TransactionalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalContext")
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

fn open_transaction(
    pool: &DbPool,
    isolation: IsolationLevel,
) -> Result<(PooledSession, CancelToken), DbError> {
    let (mut conn, cancel_token) = checkout(pool)?;
    conn.client()?.batch_execute(&isolation.begin_statement())?;
    conn.mark_in_transaction(true);
    Ok((conn, cancel_token))
}

fn checkout(pool: &DbPool) -> Result<(PooledSession, CancelToken), DbError> {
    let mut conn = pool.get()?;
    conn.prepare_for_use()?;
    let cancel_token = conn.client()?.cancel_token();
    Ok((conn, cancel_token))
}

fn finish_session(session: &Mutex<BoundSession>, completion: Completion) -> Result<(), DbError> {
    let mut guard = lock_session(session)?;
    guard.ensure_active()?;
    match guard.conn.client()?.batch_execute(completion.statement()) {
        Ok(()) => {
            guard.conn.mark_in_transaction(false);
            guard.status = completion.status();
            tracing::debug!(outcome = completion.statement(), "transaction finished");
            Ok(())
        }
        Err(e) => {
            guard.status = TransactionStatus::Aborted;
            guard.conn.discard();
            Err(e.into())
        }
    }
}

fn release(bound: BoundTransaction) {
    let mut guard = bound
        .session
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if guard.status == TransactionStatus::Active {
        let rolled_back = guard
            .conn
            .client()
            .and_then(|client| client.batch_execute("ROLLBACK").map_err(DbError::from));
        match rolled_back {
            Ok(()) => {
                guard.conn.mark_in_transaction(false);
                tracing::debug!("rolled back unfinished transaction on close");
            }
            Err(e) => {
                tracing::warn!(error = %e, "rollback on close failed, discarding connection");
                guard.conn.discard();
            }
        }
        guard.status = TransactionStatus::RolledBack;
    }
}

fn fetch<T: FromRow>(client: &mut Client, sql: &str, params: &Params) -> Result<Vec<T>, DbError> {
    let statement = params::bind(sql, params)?;
    let rows = client.query(statement.sql.as_ref(), &statement.values)?;
    rows.into_iter()
        .map(|row| T::from_row(row).map_err(DbError::from))
        .collect()
}

fn execute(client: &mut Client, sql: &str, params: &Params) -> Result<u64, DbError> {
    let statement = params::bind(sql, params)?;
    Ok(client.execute(statement.sql.as_ref(), &statement.values)?)
}

fn exactly_one<T>(rows: Vec<T>) -> Result<T, DbError> {
    at_most_one(rows)?.ok_or(DbError::NotFound)
}

fn at_most_one<T>(mut rows: Vec<T>) -> Result<Option<T>, DbError> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        n => Err(DbError::MultipleRows(n)),
    }
}

fn first<T>(rows: Vec<T>) -> Option<T> {
    rows.into_iter().next()
}
