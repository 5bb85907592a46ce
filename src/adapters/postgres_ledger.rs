//! Postgres implementation of LedgerStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::Path;

use crate::domain::{ChargeMethod, ChargeStatus, Transaction, Transition, User};
use crate::ports::{
    ApplyOutcome, LedgerError, LedgerResult, LedgerStore, Reservation, StatusUpdate,
};

const TRANSACTION_COLUMNS: &str = "id, reference, user_id, amount, currency, method, status, \
     idempotency_key, failure_code, failure_message, last_event_id, created_at, updated_at";

/// Postgres-backed ledger.
///
/// Atomicity comes from single conditional statements (`ON CONFLICT`,
/// `UPDATE ... WHERE status IN (...)`) or a row lock for status transitions.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self, migrations_dir: &Path) -> anyhow::Result<()> {
        let migrator = Migrator::new(migrations_dir).await?;
        migrator.run(&self.pool).await?;
        Ok(())
    }

    async fn ensure_user_exists(&self, user_id: &str) -> LedgerResult<()> {
        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        exists
            .map(|_| ())
            .ok_or_else(|| LedgerError::NotFound(format!("user {}", user_id)))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn get_user(&self, user_id: &str) -> LedgerResult<User> {
        let created_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT created_at FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        let created_at = created_at.ok_or_else(|| LedgerError::NotFound(format!("user {}", user_id)))?;

        let transactions: Vec<String> = sqlx::query_scalar(
            "SELECT transaction_id FROM user_transactions WHERE user_id = $1 ORDER BY position",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(User {
            id: user_id.to_string(),
            transactions,
            created_at,
        })
    }

    async fn update_user(&self, user: User) -> LedgerResult<User> {
        let mut db_tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO users (id, created_at) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
            .bind(&user.id)
            .bind(user.created_at)
            .execute(&mut *db_tx)
            .await?;
        for tx_id in &user.transactions {
            sqlx::query(
                "INSERT INTO user_transactions (user_id, transaction_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(&user.id)
            .bind(tx_id)
            .execute(&mut *db_tx)
            .await?;
        }
        db_tx.commit().await?;
        self.get_user(&user.id).await
    }

    async fn record_transaction(&self, tx: Transaction) -> LedgerResult<Transaction> {
        self.ensure_user_exists(&tx.user_id).await?;
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            INSERT INTO transactions ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                failure_code = EXCLUDED.failure_code,
                failure_message = EXCLUDED.failure_message,
                last_event_id = EXCLUDED.last_event_id,
                updated_at = EXCLUDED.updated_at
            RETURNING {cols}
            "#,
            cols = TRANSACTION_COLUMNS
        ))
        .bind(&tx.id)
        .bind(&tx.reference)
        .bind(&tx.user_id)
        .bind(tx.amount)
        .bind(&tx.currency)
        .bind(tx.method.as_str())
        .bind(tx.status.as_str())
        .bind(&tx.idempotency_key)
        .bind(&tx.failure_code)
        .bind(&tx.failure_message)
        .bind(&tx.last_event_id)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }

    async fn get_transaction(&self, id: &str) -> LedgerResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE id = $1 OR reference = $1 LIMIT 1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| LedgerError::NotFound(format!("transaction {}", id)))?
            .into_domain()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> LedgerResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE idempotency_key = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TransactionRow::into_domain).transpose()
    }

    async fn reserve_transaction(&self, tx: Transaction) -> LedgerResult<Reservation> {
        if let Some(existing) = self.find_by_idempotency_key(&tx.idempotency_key).await? {
            return Ok(Reservation::Existing(existing));
        }
        self.ensure_user_exists(&tx.user_id).await?;

        let inserted = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            INSERT INTO transactions ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {cols}
            "#,
            cols = TRANSACTION_COLUMNS
        ))
        .bind(&tx.id)
        .bind(&tx.reference)
        .bind(&tx.user_id)
        .bind(tx.amount)
        .bind(&tx.currency)
        .bind(tx.method.as_str())
        .bind(tx.status.as_str())
        .bind(&tx.idempotency_key)
        .bind(&tx.failure_code)
        .bind(&tx.failure_message)
        .bind(&tx.last_event_id)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok(Reservation::Created(row.into_domain()?)),
            // Lost the race to a concurrent reservation of the same key.
            None => self
                .find_by_idempotency_key(&tx.idempotency_key)
                .await?
                .map(Reservation::Existing)
                .ok_or_else(|| LedgerError::Conflict(format!("idempotency key {}", tx.idempotency_key))),
        }
    }

    async fn settle_reservation(&self, reference: &str, tx: Transaction) -> LedgerResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            UPDATE transactions
            SET id = $2, status = $3, failure_code = $4, failure_message = $5, updated_at = $6
            WHERE reference = $1 AND status IN ('pending', 'awaiting_authorization')
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(reference)
        .bind(&tx.id)
        .bind(tx.status.as_str())
        .bind(&tx.failure_code)
        .bind(&tx.failure_message)
        .bind(tx.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| {
            LedgerError::Conflict(format!("reservation {} is gone or already settled", reference))
        })?
        .into_domain()
    }

    async fn release_reservation(&self, reference: &str) -> LedgerResult<()> {
        let deleted = sqlx::query(
            "DELETE FROM transactions WHERE reference = $1 AND id = reference AND status = 'pending'",
        )
        .bind(reference)
        .execute(&self.pool)
        .await?;

        if deleted.rows_affected() == 0 {
            let still_there: Option<i32> =
                sqlx::query_scalar("SELECT 1 FROM transactions WHERE reference = $1")
                    .bind(reference)
                    .fetch_optional(&self.pool)
                    .await?;
            if still_there.is_some() {
                return Err(LedgerError::Conflict(format!(
                    "reservation {} already reached the gateway",
                    reference
                )));
            }
        }
        Ok(())
    }

    async fn append_user_transaction(&self, user_id: &str, tx_id: &str) -> LedgerResult<User> {
        self.ensure_user_exists(user_id).await?;
        sqlx::query(
            "INSERT INTO user_transactions (user_id, transaction_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(tx_id)
        .execute(&self.pool)
        .await?;
        self.get_user(user_id).await
    }

    async fn apply_transition(&self, charge_id: &str, update: StatusUpdate) -> LedgerResult<ApplyOutcome> {
        let mut db_tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE id = $1 FOR UPDATE",
            TRANSACTION_COLUMNS
        ))
        .bind(charge_id)
        .fetch_optional(&mut *db_tx)
        .await?;
        let mut tx = row
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", charge_id)))?
            .into_domain()?;

        if tx.status.is_terminal() {
            return Ok(ApplyOutcome::AlreadyTerminal(tx));
        }
        if tx.last_event_id.as_deref() == Some(update.event_id.as_str()) {
            return Ok(ApplyOutcome::DuplicateEvent(tx));
        }

        let outcome = match update.status {
            ChargeStatus::Failed => tx.fail(update.failure),
            status => tx.transition(status),
        };
        if outcome == Transition::Ignored {
            return Ok(ApplyOutcome::AlreadyTerminal(tx));
        }
        tx.last_event_id = Some(update.event_id);

        sqlx::query(
            r#"
            UPDATE transactions
            SET status = $2, failure_code = $3, failure_message = $4, last_event_id = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(&tx.id)
        .bind(tx.status.as_str())
        .bind(&tx.failure_code)
        .bind(&tx.failure_message)
        .bind(&tx.last_event_id)
        .bind(tx.updated_at)
        .execute(&mut *db_tx)
        .await?;
        db_tx.commit().await?;

        Ok(ApplyOutcome::Applied(tx))
    }

    async fn list_transactions(&self) -> LedgerResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions ORDER BY created_at",
            TRANSACTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransactionRow::into_domain).collect()
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: String,
    reference: String,
    user_id: String,
    amount: i64,
    currency: String,
    method: String,
    status: String,
    idempotency_key: String,
    failure_code: Option<String>,
    failure_message: Option<String>,
    last_event_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> LedgerResult<Transaction> {
        let status = ChargeStatus::parse(&self.status).ok_or_else(|| {
            LedgerError::Backend(format!("transaction {} has unknown status {}", self.id, self.status))
        })?;
        let method = ChargeMethod::parse(&self.method).ok_or_else(|| {
            LedgerError::Backend(format!("transaction {} has unknown method {}", self.id, self.method))
        })?;

        Ok(Transaction {
            id: self.id,
            reference: self.reference,
            user_id: self.user_id,
            amount: self.amount,
            currency: self.currency,
            method,
            status,
            idempotency_key: self.idempotency_key,
            failure_code: self.failure_code,
            failure_message: self.failure_message,
            last_event_id: self.last_event_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FailureDetail;

    async fn setup_store() -> PostgresLedgerStore {
        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");
        let store = PostgresLedgerStore::connect(&database_url, 2)
            .await
            .expect("Failed to connect to test DB");
        store
            .migrate(&Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"))
            .await
            .expect("Failed to run migrations on test DB");
        store
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn test_reserve_settle_and_apply() {
        let store = setup_store().await;
        let user_id = format!("pg-user-{}", uuid::Uuid::new_v4());
        store.update_user(User::new(&user_id)).await.unwrap();

        let reserved = Transaction::reserve(&user_id, 5000, "thb", ChargeMethod::Banking, uuid::Uuid::new_v4().to_string());
        let Reservation::Created(reserved) = store.reserve_transaction(reserved).await.unwrap() else {
            panic!("expected a fresh reservation");
        };

        let charge_id = format!("chrg_test_{}", uuid::Uuid::new_v4().simple());
        let mut settled = reserved.clone();
        settled.id = charge_id.clone();
        settled.transition(ChargeStatus::AwaitingAuthorization);
        store.settle_reservation(&reserved.reference, settled).await.unwrap();
        store.append_user_transaction(&user_id, &charge_id).await.unwrap();

        let update = StatusUpdate {
            status: ChargeStatus::Captured,
            failure: FailureDetail::default(),
            event_id: "evnt_pg_1".to_string(),
        };
        let applied = store.apply_transition(&charge_id, update.clone()).await.unwrap();
        assert!(matches!(applied, ApplyOutcome::Applied(_)));

        let replay = store.apply_transition(&charge_id, update).await.unwrap();
        assert!(matches!(replay, ApplyOutcome::AlreadyTerminal(_)));

        let user = store.get_user(&user_id).await.unwrap();
        assert_eq!(user.transactions, vec![charge_id]);
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn test_duplicate_reservation_returns_existing() {
        let store = setup_store().await;
        let user_id = format!("pg-user-{}", uuid::Uuid::new_v4());
        store.update_user(User::new(&user_id)).await.unwrap();

        let key = uuid::Uuid::new_v4().to_string();
        let first = Transaction::reserve(&user_id, 1000, "thb", ChargeMethod::Card, &key);
        let second = Transaction::reserve(&user_id, 1000, "thb", ChargeMethod::Card, &key);

        assert!(matches!(store.reserve_transaction(first).await.unwrap(), Reservation::Created(_)));
        assert!(matches!(store.reserve_transaction(second).await.unwrap(), Reservation::Existing(_)));
    }
}
