use futures::future::BoxFuture;
use sqlx::any::{AnyArguments, AnyQueryResult, AnyRow};

use crate::database::{Connection, Drivers, RawQuery};

/// A wrapper around a SQLx transaction.
///
/// Sessions run every statement inside one of these. Dropping it without
/// committing rolls the work back.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) tx: sqlx::Transaction<'static, sqlx::Any>,
    pub(crate) driver: Drivers,
}

impl Connection for Transaction {
    fn driver(&self) -> Drivers {
        self.driver
    }
    fn execute<'a, 'q: 'a>(&'a mut self, sql: &'q str, args: AnyArguments<'q>) -> BoxFuture<'a, Result<AnyQueryResult, sqlx::Error>> {
        Box::pin(async move { sqlx::query_with(sql, args).execute(&mut *self.tx).await })
    }
    fn fetch_all<'a, 'q: 'a>(&'a mut self, sql: &'q str, args: AnyArguments<'q>) -> BoxFuture<'a, Result<Vec<AnyRow>, sqlx::Error>> {
        Box::pin(async move { sqlx::query_with(sql, args).fetch_all(&mut *self.tx).await })
    }
    fn fetch_one<'a, 'q: 'a>(&'a mut self, sql: &'q str, args: AnyArguments<'q>) -> BoxFuture<'a, Result<AnyRow, sqlx::Error>> {
        Box::pin(async move { sqlx::query_with(sql, args).fetch_one(&mut *self.tx).await })
    }
    fn fetch_optional<'a, 'q: 'a>(&'a mut self, sql: &'q str, args: AnyArguments<'q>) -> BoxFuture<'a, Result<Option<AnyRow>, sqlx::Error>> {
        Box::pin(async move { sqlx::query_with(sql, args).fetch_optional(&mut *self.tx).await })
    }
}

/// Lets raw queries borrow a transaction.
impl Connection for &mut Transaction {
    fn driver(&self) -> Drivers {
        (**self).driver
    }
    fn execute<'a, 'q: 'a>(&'a mut self, sql: &'q str, args: AnyArguments<'q>) -> BoxFuture<'a, Result<AnyQueryResult, sqlx::Error>> {
        (**self).execute(sql, args)
    }
    fn fetch_all<'a, 'q: 'a>(&'a mut self, sql: &'q str, args: AnyArguments<'q>) -> BoxFuture<'a, Result<Vec<AnyRow>, sqlx::Error>> {
        (**self).fetch_all(sql, args)
    }
    fn fetch_one<'a, 'q: 'a>(&'a mut self, sql: &'q str, args: AnyArguments<'q>) -> BoxFuture<'a, Result<AnyRow, sqlx::Error>> {
        (**self).fetch_one(sql, args)
    }
    fn fetch_optional<'a, 'q: 'a>(&'a mut self, sql: &'q str, args: AnyArguments<'q>) -> BoxFuture<'a, Result<Option<AnyRow>, sqlx::Error>> {
        (**self).fetch_optional(sql, args)
    }
}

impl Transaction {
    /// Creates a raw SQL query that runs inside this transaction.
    pub fn raw<'a>(&mut self, sql: &'a str) -> RawQuery<'a, &mut Self> {
        RawQuery::new(self, sql)
    }

    /// Commits the transaction.
    ///
    /// Persists all changes made during the transaction to the database.
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    /// Rolls back the transaction.
    ///
    /// Reverts all changes made during the transaction. This happens automatically
    /// if the `Transaction` is dropped without being committed, but this method
    /// allows for explicit rollback.
    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}
