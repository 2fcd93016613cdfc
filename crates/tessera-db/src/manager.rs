//! Transaction-boundary entry point.

use crate::context::TransactionalContext;
use crate::error::DbError;
use crate::isolation::IsolationLevel;
use crate::pool::DbPool;

/// Hands out contexts over one shared pool and is the only way to bind a
/// context to a transaction.
///
/// ```rust,ignore
/// let mut tx = manager.begin_transaction(IsolationLevel::Serializable)?;
/// tx.execute("UPDATE accounts SET balance = balance - @amount WHERE id = @id", &params)?;
/// tx.commit()?;
/// // dropping `tx` returns its connection to the pool
/// ```
#[derive(Clone)]
pub struct ContextManager {
    pool: DbPool,
}

impl ContextManager {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// A free context: each call uses its own pooled connection.
    pub fn context(&self) -> TransactionalContext {
        TransactionalContext::new(self.pool.clone())
    }

    /// A context bound to a new transaction at `isolation`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Pool` if no connection is available or
    /// `DbError::Backend` if the transaction cannot be started.
    pub fn begin_transaction(
        &self,
        isolation: IsolationLevel,
    ) -> Result<TransactionalContext, DbError> {
        let mut context = self.context();
        context.begin_transaction(isolation)?;
        Ok(context)
    }

    pub async fn begin_transaction_async(
        &self,
        isolation: IsolationLevel,
    ) -> Result<TransactionalContext, DbError> {
        let mut context = self.context();
        context.begin_transaction_async(isolation).await?;
        Ok(context)
    }

    /// Binds an existing free context to a new transaction.
    ///
    /// # Errors
    ///
    /// Returns `DbError::IllegalState` if `context` is already bound;
    /// transactions do not nest.
    pub fn enlist(
        &self,
        context: &mut TransactionalContext,
        isolation: IsolationLevel,
    ) -> Result<(), DbError> {
        context.begin_transaction(isolation)
    }

    pub async fn enlist_async(
        &self,
        context: &mut TransactionalContext,
        isolation: IsolationLevel,
    ) -> Result<(), DbError> {
        context.begin_transaction_async(isolation).await
    }
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.pool.state();
        f.debug_struct("ContextManager")
            .field("connections", &state.connections)
            .field("idle_connections", &state.idle_connections)
            .finish()
    }
}
