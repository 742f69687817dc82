//! PostgreSQL connection wrapper.
//! Every inbound RPC call owns one `PgConn`. Statements lazily open a
//! transaction and `commit`/`rollback` close it, so a caller can commit
//! mid-call and keep issuing statements on a fresh transaction; the
//! session resolver relies on exactly this to stage its call-number write
//! for the dispatcher's final commit.
//!
//! Statements are built with `sea-query` and bound as real parameters;
//! the locking clauses (`FOR UPDATE`) emitted by the builder are part of
//! the correctness contract, not an optimization.

use sea_query::{Value, Values};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::error;

use crate::error::{HubError, HubResult};

pub struct PgConn {
    client: Client,
    in_txn: bool,
}

impl PgConn {
    /// Open a connection and drive its I/O task in the background.
    pub async fn connect(conninfo: &str) -> HubResult<Self> {
        let (client, connection) = tokio_postgres::connect(conninfo, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {}", e);
            }
        });
        Ok(Self { client, in_txn: false })
    }

    /// True while a transaction is open (statements executed, not committed).
    pub fn in_transaction(&self) -> bool {
        self.in_txn
    }

    async fn ensure_txn(&mut self) -> HubResult<()> {
        if !self.in_txn {
            self.client.batch_execute("BEGIN").await?;
            self.in_txn = true;
        }
        Ok(())
    }

    /// Commit the open transaction, if any. The next statement opens a new one.
    pub async fn commit(&mut self) -> HubResult<()> {
        if self.in_txn {
            self.client.batch_execute("COMMIT").await?;
            self.in_txn = false;
        }
        Ok(())
    }

    /// Discard the open transaction, if any.
    pub async fn rollback(&mut self) -> HubResult<()> {
        if self.in_txn {
            self.client.batch_execute("ROLLBACK").await?;
            self.in_txn = false;
        }
        Ok(())
    }

    pub async fn query(&mut self, stmt: &(String, Values)) -> HubResult<Vec<Row>> {
        self.ensure_txn().await?;
        let params = bind_values(&stmt.1)?;
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_ref()).collect();
        Ok(self.client.query(stmt.0.as_str(), &refs).await?)
    }

    /// At most one row expected.
    pub async fn query_opt(&mut self, stmt: &(String, Values)) -> HubResult<Option<Row>> {
        self.ensure_txn().await?;
        let params = bind_values(&stmt.1)?;
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_ref()).collect();
        Ok(self.client.query_opt(stmt.0.as_str(), &refs).await?)
    }

    pub async fn execute(&mut self, stmt: &(String, Values)) -> HubResult<u64> {
        self.ensure_txn().await?;
        let params = bind_values(&stmt.1)?;
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_ref()).collect();
        Ok(self.client.execute(stmt.0.as_str(), &refs).await?)
    }

    /// Run a statement with no bound parameters (DDL, sequence calls).
    pub async fn batch(&mut self, sql: &str) -> HubResult<()> {
        self.ensure_txn().await?;
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    /// Fetch the next value of a database sequence.
    pub async fn nextval(&mut self, sequence: &str) -> HubResult<i64> {
        self.ensure_txn().await?;
        let sql = format!("SELECT nextval('{}')", sequence);
        let row = self.client.query_one(sql.as_str(), &[]).await?;
        Ok(row.get(0))
    }
}

/// Convert builder values into owned postgres parameters. Only the types the
/// session core actually binds are supported; anything else is a programming
/// error surfaced as a generic fault rather than a panic.
fn bind_values(values: &Values) -> HubResult<Vec<Box<dyn ToSql + Sync>>> {
    values
        .0
        .iter()
        .map(|v| -> HubResult<Box<dyn ToSql + Sync>> {
            match v {
                Value::Bool(b) => Ok(Box::new(*b)),
                Value::Int(i) => Ok(Box::new(*i)),
                Value::BigInt(i) => Ok(Box::new(*i)),
                Value::String(s) => Ok(Box::new(s.as_deref().cloned())),
                other => Err(HubError::generic(format!("unsupported bind parameter: {:?}", other))),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_query::{Expr, PostgresQueryBuilder, Query};

    use crate::auth::tables::Sessions;

    #[test]
    fn bind_values_covers_core_types() {
        let (_, values) = Query::select()
            .column(Sessions::Id)
            .from(Sessions::Table)
            .and_where(Expr::col(Sessions::Id).eq(7))
            .and_where(Expr::col(Sessions::Key).eq("k"))
            .and_where(Expr::col(Sessions::Expired).eq(false))
            .build(PostgresQueryBuilder);
        let bound = bind_values(&values).unwrap();
        assert_eq!(bound.len(), 3);
    }

    #[test]
    fn select_for_update_renders_locking_clause() {
        let (sql, _) = Query::select()
            .column(Sessions::Id)
            .from(Sessions::Table)
            .and_where(Expr::col(Sessions::Id).eq(1))
            .lock(sea_query::LockType::Update)
            .build(PostgresQueryBuilder);
        assert!(sql.ends_with("FOR UPDATE"), "{}", sql);
    }
}
