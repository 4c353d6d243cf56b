//! PostgreSQL projection store.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::store::{
    unix_now, AddressDetails, BlockBatch, BlockCursor, Store, StoreError, TrackedAddress,
    TxRecord, TxStatus, UtxoRecord, MAX_CONFIRMATIONS,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tracked_addresses (
        id BIGSERIAL PRIMARY KEY,
        address TEXT NOT NULL UNIQUE,
        required_confirmations BIGINT NOT NULL DEFAULT 1,
        balance DOUBLE PRECISION NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transactions (
        id BIGSERIAL PRIMARY KEY,
        address_id BIGINT NOT NULL REFERENCES tracked_addresses(id),
        tx_id TEXT NOT NULL,
        block_hash TEXT,
        block_height BIGINT,
        amount DOUBLE PRECISION NOT NULL,
        fee DOUBLE PRECISION NOT NULL DEFAULT 0,
        timestamp BIGINT NOT NULL DEFAULT 0,
        is_incoming BOOLEAN NOT NULL,
        confirmations BIGINT NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        sender_address TEXT NOT NULL DEFAULT '',
        receiver_address TEXT NOT NULL DEFAULT '',
        created_at BIGINT NOT NULL,
        UNIQUE (address_id, tx_id)
    )",
    "CREATE TABLE IF NOT EXISTS unspent_outputs (
        id BIGSERIAL PRIMARY KEY,
        address_id BIGINT NOT NULL REFERENCES tracked_addresses(id),
        tx_id TEXT NOT NULL,
        vout BIGINT NOT NULL,
        amount DOUBLE PRECISION NOT NULL,
        script TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        UNIQUE (address_id, tx_id, vout)
    )",
    "CREATE TABLE IF NOT EXISTS block_tracker (
        id INTEGER PRIMARY KEY,
        last_block_height BIGINT NOT NULL,
        last_block_hash TEXT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_transactions_address ON transactions(address_id)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_block_hash ON transactions(block_hash)",
    "CREATE INDEX IF NOT EXISTS idx_unspent_outputs_address ON unspent_outputs(address_id)",
];

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and create the schema. Inability to reach the database is
    /// fatal for the process, so errors bubble up to `main`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("database schema ready");
        Ok(())
    }

    fn address_from_row(row: &PgRow) -> TrackedAddress {
        TrackedAddress {
            id: row.get("id"),
            address: row.get("address"),
            required_confirmations: row.get("required_confirmations"),
            balance: row.get("balance"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    fn tx_from_row(row: &PgRow) -> TxRecord {
        let status: String = row.get("status");
        TxRecord {
            address_id: row.get("address_id"),
            tx_id: row.get("tx_id"),
            block_hash: row.get("block_hash"),
            block_height: row.get("block_height"),
            amount: row.get("amount"),
            fee: row.get("fee"),
            timestamp: row.get("timestamp"),
            is_incoming: row.get("is_incoming"),
            confirmations: row.get("confirmations"),
            status: TxStatus::parse(&status),
            sender_address: row.get("sender_address"),
            receiver_address: row.get("receiver_address"),
            created_at: row.get("created_at"),
        }
    }

    fn utxo_from_row(row: &PgRow) -> UtxoRecord {
        UtxoRecord {
            address_id: row.get("address_id"),
            tx_id: row.get("tx_id"),
            vout: row.get("vout"),
            amount: row.get("amount"),
            script: row.get("script"),
            created_at: row.get("created_at"),
        }
    }
}

/// Refresh `confirmations`/`status` of every block-bound row against the
/// given tip height. Runs inside the caller's transaction.
async fn refresh_confirmations(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    tip_height: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE transactions t
        SET confirmations = LEAST($2, GREATEST($1 - t.block_height + 1, 0)),
            status = CASE
                WHEN LEAST($2, GREATEST($1 - t.block_height + 1, 0)) >= a.required_confirmations
                    THEN 'confirmed'
                ELSE 'pending'
            END
        FROM tracked_addresses a
        WHERE t.address_id = a.id AND t.block_height IS NOT NULL
        "#,
    )
    .bind(tip_height)
    .bind(MAX_CONFIRMATIONS)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Rewrite every tracked address balance from its unspent set.
async fn sweep_balances(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE tracked_addresses
        SET balance = COALESCE(
                (SELECT SUM(u.amount) FROM unspent_outputs u
                 WHERE u.address_id = tracked_addresses.id),
                0),
            updated_at = $1
        "#,
    )
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn set_cursor(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    height: i64,
    hash: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO block_tracker (id, last_block_height, last_block_hash, updated_at)
        VALUES (1, $1, $2, $3)
        ON CONFLICT (id) DO UPDATE
        SET last_block_height = $1, last_block_hash = $2, updated_at = $3
        "#,
    )
    .bind(height)
    .bind(hash)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn get_or_create_address(
        &self,
        address: &str,
        required_confirmations: i64,
    ) -> Result<TrackedAddress, StoreError> {
        let now = unix_now();
        let row = sqlx::query(
            r#"
            INSERT INTO tracked_addresses
                (address, required_confirmations, balance, created_at, updated_at)
            VALUES ($1, $2, 0, $3, $3)
            ON CONFLICT (address) DO UPDATE SET address = excluded.address
            RETURNING id, address, required_confirmations, balance, created_at, updated_at
            "#,
        )
        .bind(address)
        .bind(required_confirmations.max(1))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(Self::address_from_row(&row))
    }

    async fn find_address(&self, address: &str) -> Result<Option<TrackedAddress>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, address, required_confirmations, balance, created_at, updated_at
            FROM tracked_addresses WHERE address = $1
            "#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::address_from_row))
    }

    async fn address_details(
        &self,
        address: &str,
    ) -> Result<Option<AddressDetails>, StoreError> {
        let Some(tracked) = self.find_address(address).await? else {
            return Ok(None);
        };

        let tx_rows = sqlx::query(
            r#"
            SELECT address_id, tx_id, block_hash, block_height, amount, fee, timestamp,
                   is_incoming, confirmations, status, sender_address, receiver_address,
                   created_at
            FROM transactions
            WHERE address_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(tracked.id)
        .fetch_all(&self.pool)
        .await?;

        let utxo_rows = sqlx::query(
            r#"
            SELECT address_id, tx_id, vout, amount, script, created_at
            FROM unspent_outputs
            WHERE address_id = $1
            ORDER BY id
            "#,
        )
        .bind(tracked.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(AddressDetails {
            address: tracked,
            transactions: tx_rows.iter().map(Self::tx_from_row).collect(),
            unspent_outputs: utxo_rows.iter().map(Self::utxo_from_row).collect(),
        }))
    }

    async fn list_tracked_addresses(&self) -> Result<Vec<TrackedAddress>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, address, required_confirmations, balance, created_at, updated_at
            FROM tracked_addresses ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::address_from_row).collect())
    }

    async fn cursor(&self) -> Result<Option<BlockCursor>, StoreError> {
        let row = sqlx::query(
            "SELECT last_block_height, last_block_hash FROM block_tracker WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| BlockCursor {
            height: row.get("last_block_height"),
            hash: row.get("last_block_hash"),
        }))
    }

    async fn add_pending_transaction(&self, record: &TxRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transactions
                (address_id, tx_id, block_hash, block_height, amount, fee, timestamp,
                 is_incoming, confirmations, status, sender_address, receiver_address,
                 created_at)
            VALUES ($1, $2, NULL, NULL, $3, $4, $5, $6, 0, 'pending', $7, $8, $9)
            ON CONFLICT (address_id, tx_id) DO NOTHING
            "#,
        )
        .bind(record.address_id)
        .bind(&record.tx_id)
        .bind(record.amount)
        .bind(record.fee)
        .bind(record.timestamp)
        .bind(record.is_incoming)
        .bind(&record.sender_address)
        .bind(&record.receiver_address)
        .bind(unix_now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_block(&self, batch: &BlockBatch) -> Result<(), StoreError> {
        let now = unix_now();
        let mut tx = self.pool.begin().await?;

        refresh_confirmations(&mut tx, batch.block_height).await?;

        for record in &batch.transactions {
            // A conflicting row keeps its amount and direction; block
            // metadata, fee, confirmation state and counterparties refresh.
            sqlx::query(
                r#"
                INSERT INTO transactions
                    (address_id, tx_id, block_hash, block_height, amount, fee, timestamp,
                     is_incoming, confirmations, status, sender_address, receiver_address,
                     created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (address_id, tx_id) DO UPDATE
                SET block_hash = excluded.block_hash,
                    block_height = excluded.block_height,
                    fee = excluded.fee,
                    timestamp = excluded.timestamp,
                    confirmations = excluded.confirmations,
                    status = excluded.status,
                    sender_address = excluded.sender_address,
                    receiver_address = excluded.receiver_address
                "#,
            )
            .bind(record.address_id)
            .bind(&record.tx_id)
            .bind(&record.block_hash)
            .bind(record.block_height)
            .bind(record.amount)
            .bind(record.fee)
            .bind(record.timestamp)
            .bind(record.is_incoming)
            .bind(record.confirmations)
            .bind(record.status.as_str())
            .bind(&record.sender_address)
            .bind(&record.receiver_address)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for utxo in &batch.unspent_outputs {
            sqlx::query(
                r#"
                INSERT INTO unspent_outputs (address_id, tx_id, vout, amount, script, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (address_id, tx_id, vout) DO UPDATE
                SET amount = excluded.amount, script = excluded.script
                "#,
            )
            .bind(utxo.address_id)
            .bind(&utxo.tx_id)
            .bind(utxo.vout)
            .bind(utxo.amount)
            .bind(&utxo.script)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for spent in &batch.spent_outputs {
            sqlx::query(
                "DELETE FROM unspent_outputs WHERE address_id = $1 AND tx_id = $2 AND vout = $3",
            )
            .bind(spent.address_id)
            .bind(&spent.tx_id)
            .bind(spent.vout)
            .execute(&mut *tx)
            .await?;
        }

        sweep_balances(&mut tx, now).await?;
        set_cursor(&mut tx, batch.block_height, &batch.block_hash, now).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn undo_blocks(
        &self,
        block_hashes: &[String],
        resume_height: i64,
        resume_hash: &str,
    ) -> Result<(), StoreError> {
        let now = unix_now();
        let mut tx = self.pool.begin().await?;

        for hash in block_hashes {
            // Unspent outputs created by the dead block's incoming rows.
            sqlx::query(
                r#"
                DELETE FROM unspent_outputs u
                USING transactions t
                WHERE t.block_hash = $1
                  AND t.is_incoming
                  AND u.address_id = t.address_id
                  AND u.tx_id = t.tx_id
                "#,
            )
            .bind(hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM transactions WHERE block_hash = $1")
                .bind(hash)
                .execute(&mut *tx)
                .await?;
        }

        sweep_balances(&mut tx, now).await?;
        set_cursor(&mut tx, resume_height, resume_hash, now).await?;
        // Confirmations are recomputed from the rolled-back height, never
        // from column state mid-statement.
        refresh_confirmations(&mut tx, resume_height).await?;

        tx.commit().await?;
        Ok(())
    }
}
