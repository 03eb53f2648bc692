//! Postgres-backed package store.
//!
//! Each [`UnitOfWork`] wraps one database transaction. Row locks are taken with
//! `SELECT … FOR UPDATE`, so two units of work touching the same content row
//! (or the same package) are serialized by Postgres itself; the loser waits and
//! then sees the winner's committed values.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Backend` |
//! | Column decode failure | N/A | `Decode` |
//! | Anything else | N/A | `Backend` |

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use packledger_core::{CommitmentId, DomainError, PackageId, RecordId, TransferId, UserId};
use packledger_packages::{
    Allocation, Location, OperationKind, OperationRef, Package, PackageCommitment, PackageContent,
    PackageLocationHistory, PackageTransaction,
};
use packledger_picking::{PickListLine, PickListPackage, PickPackageRole, PickSource};
use packledger_transfers::{Transfer, TransferLine, TransferPackage, TransferReason};

use super::{PackageStore, StoreError, StoreResult, UnitOfWork};

/// Schema statements, applied in order by [`PostgresPackageStore::ensure_schema`].
const SCHEMA: &[&str] = &[
    r#"
    CREATE SEQUENCE IF NOT EXISTS package_barcode_seq
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS packages (
        id                UUID PRIMARY KEY,
        barcode           TEXT NOT NULL UNIQUE,
        status            TEXT NOT NULL,
        warehouse         TEXT NOT NULL,
        bin_entry         INTEGER NULL,
        created_by        UUID NOT NULL,
        created_at        TIMESTAMPTZ NOT NULL,
        updated_at        TIMESTAMPTZ NOT NULL,
        closed_at         TIMESTAMPTZ NULL,
        notes             TEXT NULL,
        custom_attributes JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS package_contents (
        package_id         UUID NOT NULL REFERENCES packages (id),
        item_code          TEXT NOT NULL,
        quantity           BIGINT NOT NULL,
        committed_quantity BIGINT NOT NULL,
        warehouse          TEXT NOT NULL,
        bin_entry          INTEGER NULL,
        updated_at         TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (package_id, item_code),
        CONSTRAINT committed_within_quantity
            CHECK (committed_quantity >= 0 AND committed_quantity <= quantity)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS package_commitments (
        id                UUID PRIMARY KEY,
        package_id        UUID NOT NULL REFERENCES packages (id),
        item_code         TEXT NOT NULL,
        operation_kind    TEXT NOT NULL,
        operation_ref     TEXT NOT NULL,
        allocation        TEXT NOT NULL,
        linked_package    UUID NULL,
        linked_commitment UUID NULL,
        quantity          BIGINT NOT NULL CHECK (quantity > 0),
        created_at        TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS package_commitments_operation
        ON package_commitments (operation_kind, operation_ref)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS package_transactions (
        id             UUID PRIMARY KEY,
        package_id     UUID NOT NULL REFERENCES packages (id),
        kind           TEXT NOT NULL,
        item_code      TEXT NOT NULL,
        quantity       BIGINT NOT NULL CHECK (quantity > 0),
        unit           TEXT NOT NULL,
        operation_kind TEXT NOT NULL,
        operation_ref  TEXT NOT NULL,
        actor          UUID NOT NULL,
        occurred_at    TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS package_location_history (
        id             UUID PRIMARY KEY,
        package_id     UUID NOT NULL REFERENCES packages (id),
        from_warehouse TEXT NOT NULL,
        from_bin       INTEGER NULL,
        to_warehouse   TEXT NOT NULL,
        to_bin         INTEGER NULL,
        movement       TEXT NOT NULL,
        operation_kind TEXT NULL,
        operation_ref  TEXT NULL,
        actor          UUID NOT NULL,
        occurred_at    TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pick_list_lines (
        id             UUID PRIMARY KEY,
        abs_entry      INTEGER NOT NULL,
        pick_entry     INTEGER NOT NULL,
        item_code      TEXT NOT NULL,
        quantity       BIGINT NOT NULL CHECK (quantity > 0),
        unit           TEXT NOT NULL,
        bin_entry      INTEGER NULL,
        source_package UUID NULL,
        source_full    BOOLEAN NOT NULL DEFAULT FALSE,
        target_package UUID NULL,
        status         TEXT NOT NULL,
        sync_status    TEXT NOT NULL,
        created_by     UUID NOT NULL,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS pick_list_lines_abs_entry ON pick_list_lines (abs_entry)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pick_list_packages (
        id         UUID PRIMARY KEY,
        abs_entry  INTEGER NOT NULL,
        package_id UUID NOT NULL REFERENCES packages (id),
        role       TEXT NOT NULL,
        pick_entry INTEGER NULL,
        added_by   UUID NOT NULL,
        added_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transfers (
        id               UUID PRIMARY KEY,
        series           INTEGER NULL,
        external_entry   INTEGER NULL,
        external_number  INTEGER NULL,
        source_warehouse TEXT NOT NULL,
        target_warehouse TEXT NULL,
        comments         TEXT NOT NULL,
        reason           JSONB NOT NULL,
        status           TEXT NOT NULL,
        lines            JSONB NOT NULL,
        created_by       UUID NOT NULL,
        created_at       TIMESTAMPTZ NOT NULL,
        updated_at       TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transfer_packages (
        id          UUID PRIMARY KEY,
        transfer_id UUID NOT NULL REFERENCES transfers (id),
        package_id  UUID NOT NULL REFERENCES packages (id),
        role        TEXT NOT NULL,
        added_by    UUID NOT NULL,
        added_at    TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Postgres-backed package store.
#[derive(Debug, Clone)]
pub struct PostgresPackageStore {
    pool: PgPool,
}

impl PostgresPackageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, indexes and the barcode sequence if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        debug!(statements = SCHEMA.len(), "package ledger schema ensured");
        Ok(())
    }
}

#[async_trait]
impl PackageStore for PostgresPackageStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresUnitOfWork { tx }))
    }
}

struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

const PACKAGE_COLUMNS: &str = "id, barcode, status, warehouse, bin_entry, created_by, created_at, \
     updated_at, closed_at, notes, custom_attributes";

const CONTENT_COLUMNS: &str =
    "package_id, item_code, quantity, committed_quantity, warehouse, bin_entry, updated_at";

const COMMITMENT_COLUMNS: &str = "id, package_id, item_code, operation_kind, operation_ref, \
     allocation, linked_package, linked_commitment, quantity, created_at";

const PICK_LINE_COLUMNS: &str = "id, abs_entry, pick_entry, item_code, quantity, unit, bin_entry, \
     source_package, source_full, target_package, status, sync_status, created_by, created_at, \
     updated_at";

const TRANSFER_COLUMNS: &str = "id, series, external_entry, external_number, source_warehouse, \
     target_warehouse, comments, reason, status, lines, created_by, created_at, updated_at";

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    #[instrument(skip(self, package), fields(package_id = %package.id), err)]
    async fn insert_package(&mut self, package: &Package) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO packages (
                id, barcode, status, warehouse, bin_entry, created_by,
                created_at, updated_at, closed_at, notes, custom_attributes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(Uuid::from(package.id))
        .bind(&package.barcode)
        .bind(package.status.as_str())
        .bind(&package.location.warehouse)
        .bind(package.location.bin_entry)
        .bind(Uuid::from(package.created_by))
        .bind(package.created_at)
        .bind(package.updated_at)
        .bind(package.closed_at)
        .bind(&package.notes)
        .bind(Json(&package.custom_attributes))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_package", e))?;
        Ok(())
    }

    #[instrument(skip(self, package), fields(package_id = %package.id), err)]
    async fn update_package(&mut self, package: &Package) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE packages
            SET status = $2, warehouse = $3, bin_entry = $4, updated_at = $5,
                closed_at = $6, notes = $7, custom_attributes = $8
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(package.id))
        .bind(package.status.as_str())
        .bind(&package.location.warehouse)
        .bind(package.location.bin_entry)
        .bind(package.updated_at)
        .bind(package.closed_at)
        .bind(&package.notes)
        .bind(Json(&package.custom_attributes))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_package", e))?;
        expect_one(result.rows_affected(), || format!("package {}", package.id))
    }

    async fn package(&mut self, id: PackageId) -> StoreResult<Option<Package>> {
        let sql = format!("SELECT {PACKAGE_COLUMNS} FROM packages WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_package", e))?;
        row.as_ref().map(package_from_row).transpose()
    }

    async fn package_by_barcode(&mut self, barcode: &str) -> StoreResult<Option<Package>> {
        let sql = format!("SELECT {PACKAGE_COLUMNS} FROM packages WHERE barcode = $1");
        let row = sqlx::query(&sql)
            .bind(barcode)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_package_by_barcode", e))?;
        row.as_ref().map(package_from_row).transpose()
    }

    async fn next_barcode_sequence(&mut self) -> StoreResult<u64> {
        // nextval() is not transactional: a rolled back value is never handed out again.
        let value: i64 = sqlx::query_scalar("SELECT nextval('package_barcode_seq')")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("next_barcode_sequence", e))?;
        u64::try_from(value).map_err(|e| StoreError::Decode(format!("barcode sequence: {e}")))
    }

    async fn lock_content(
        &mut self,
        package_id: PackageId,
        item_code: &str,
    ) -> StoreResult<Option<PackageContent>> {
        let sql = format!(
            "SELECT {CONTENT_COLUMNS} FROM package_contents \
             WHERE package_id = $1 AND item_code = $2 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::from(package_id))
            .bind(item_code)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_content", e))?;
        row.as_ref().map(content_from_row).transpose()
    }

    async fn contents(&mut self, package_id: PackageId) -> StoreResult<Vec<PackageContent>> {
        let sql = format!(
            "SELECT {CONTENT_COLUMNS} FROM package_contents \
             WHERE package_id = $1 ORDER BY item_code FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(Uuid::from(package_id))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_contents", e))?;
        rows.iter().map(content_from_row).collect()
    }

    async fn save_content(&mut self, content: &PackageContent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO package_contents (
                package_id, item_code, quantity, committed_quantity, warehouse, bin_entry, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (package_id, item_code)
            DO UPDATE SET
                quantity = EXCLUDED.quantity,
                committed_quantity = EXCLUDED.committed_quantity,
                warehouse = EXCLUDED.warehouse,
                bin_entry = EXCLUDED.bin_entry,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(Uuid::from(content.package_id))
        .bind(&content.item_code)
        .bind(content.quantity)
        .bind(content.committed_quantity)
        .bind(&content.location.warehouse)
        .bind(content.location.bin_entry)
        .bind(content.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_content", e))?;
        Ok(())
    }

    async fn delete_content(&mut self, package_id: PackageId, item_code: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM package_contents WHERE package_id = $1 AND item_code = $2")
            .bind(Uuid::from(package_id))
            .bind(item_code)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_content", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn lock_bin_stock(&mut self, item_code: &str, bin_entry: i32) -> StoreResult<()> {
        // New loose pick lines are inserted rows, which row locks cannot cover.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), $2)")
            .bind(item_code)
            .bind(bin_entry)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_bin_stock", e))?;
        Ok(())
    }

    async fn packaged_quantity_in_bin(
        &mut self,
        item_code: &str,
        warehouse: &str,
        bin_entry: i32,
    ) -> StoreResult<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(c.quantity)::BIGINT
            FROM package_contents c
            JOIN packages p ON p.id = c.package_id
            WHERE c.item_code = $1 AND c.warehouse = $2 AND c.bin_entry = $3
              AND p.status <> 'closed'
            "#,
        )
        .bind(item_code)
        .bind(warehouse)
        .bind(bin_entry)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("packaged_quantity_in_bin", e))?;
        Ok(total.unwrap_or(0))
    }

    async fn all_contents(&mut self) -> StoreResult<Vec<PackageContent>> {
        let sql = format!(
            "SELECT {CONTENT_COLUMNS} FROM package_contents ORDER BY package_id, item_code"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("all_contents", e))?;
        rows.iter().map(content_from_row).collect()
    }

    async fn insert_commitment(&mut self, commitment: &PackageCommitment) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO package_commitments (
                id, package_id, item_code, operation_kind, operation_ref,
                allocation, linked_package, linked_commitment, quantity, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::from(commitment.id))
        .bind(Uuid::from(commitment.package_id))
        .bind(&commitment.item_code)
        .bind(commitment.operation.kind().as_str())
        .bind(commitment.operation.reference())
        .bind(commitment.allocation.kind_str())
        .bind(commitment.allocation.linked_package().map(Uuid::from))
        .bind(commitment.allocation.linked_commitment().map(Uuid::from))
        .bind(commitment.quantity)
        .bind(commitment.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_commitment", e))?;
        Ok(())
    }

    async fn update_commitment(&mut self, commitment: &PackageCommitment) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE package_commitments
            SET operation_kind = $2, operation_ref = $3, allocation = $4,
                linked_package = $5, linked_commitment = $6, quantity = $7
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(commitment.id))
        .bind(commitment.operation.kind().as_str())
        .bind(commitment.operation.reference())
        .bind(commitment.allocation.kind_str())
        .bind(commitment.allocation.linked_package().map(Uuid::from))
        .bind(commitment.allocation.linked_commitment().map(Uuid::from))
        .bind(commitment.quantity)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_commitment", e))?;
        expect_one(result.rows_affected(), || format!("commitment {}", commitment.id))
    }

    async fn commitment(&mut self, id: CommitmentId) -> StoreResult<Option<PackageCommitment>> {
        let sql =
            format!("SELECT {COMMITMENT_COLUMNS} FROM package_commitments WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_commitment", e))?;
        row.as_ref().map(commitment_from_row).transpose()
    }

    async fn delete_commitment(&mut self, id: CommitmentId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM package_commitments WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_commitment", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn commitments_for_operation(
        &mut self,
        operation: &OperationRef,
    ) -> StoreResult<Vec<PackageCommitment>> {
        let sql = format!(
            "SELECT {COMMITMENT_COLUMNS} FROM package_commitments \
             WHERE operation_kind = $1 AND operation_ref = $2 \
             ORDER BY created_at, id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(operation.kind().as_str())
            .bind(operation.reference())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("commitments_for_operation", e))?;
        rows.iter().map(commitment_from_row).collect()
    }

    async fn commitments_for_package(
        &mut self,
        package_id: PackageId,
    ) -> StoreResult<Vec<PackageCommitment>> {
        let sql = format!(
            "SELECT {COMMITMENT_COLUMNS} FROM package_commitments \
             WHERE package_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(Uuid::from(package_id))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("commitments_for_package", e))?;
        rows.iter().map(commitment_from_row).collect()
    }

    async fn all_commitments(&mut self) -> StoreResult<Vec<PackageCommitment>> {
        let sql =
            format!("SELECT {COMMITMENT_COLUMNS} FROM package_commitments ORDER BY created_at, id");
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("all_commitments", e))?;
        rows.iter().map(commitment_from_row).collect()
    }

    async fn append_transaction(&mut self, transaction: &PackageTransaction) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO package_transactions (
                id, package_id, kind, item_code, quantity, unit,
                operation_kind, operation_ref, actor, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::from(transaction.id))
        .bind(Uuid::from(transaction.package_id))
        .bind(transaction.kind.as_str())
        .bind(&transaction.item_code)
        .bind(transaction.quantity)
        .bind(transaction.unit.as_str())
        .bind(transaction.operation.kind().as_str())
        .bind(transaction.operation.reference())
        .bind(Uuid::from(transaction.actor))
        .bind(transaction.occurred_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_transaction", e))?;
        Ok(())
    }

    async fn transactions(&mut self, package_id: PackageId) -> StoreResult<Vec<PackageTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, package_id, kind, item_code, quantity, unit,
                   operation_kind, operation_ref, actor, occurred_at
            FROM package_transactions
            WHERE package_id = $1
            ORDER BY occurred_at, id
            "#,
        )
        .bind(Uuid::from(package_id))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_transactions", e))?;

        rows.iter()
            .map(|row| -> StoreResult<PackageTransaction> {
                Ok(PackageTransaction {
                    id: RecordId::from_uuid(get(row, "id")?),
                    package_id: PackageId::from_uuid(get(row, "package_id")?),
                    kind: parse(&get::<String>(row, "kind")?)?,
                    item_code: get(row, "item_code")?,
                    quantity: get(row, "quantity")?,
                    unit: parse(&get::<String>(row, "unit")?)?,
                    operation: operation_from_row(row, "operation_kind", "operation_ref")?,
                    actor: UserId::from_uuid(get(row, "actor")?),
                    occurred_at: get(row, "occurred_at")?,
                })
            })
            .collect()
    }

    async fn append_location_history(&mut self, entry: &PackageLocationHistory) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO package_location_history (
                id, package_id, from_warehouse, from_bin, to_warehouse, to_bin,
                movement, operation_kind, operation_ref, actor, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(Uuid::from(entry.id))
        .bind(Uuid::from(entry.package_id))
        .bind(&entry.from.warehouse)
        .bind(entry.from.bin_entry)
        .bind(&entry.to.warehouse)
        .bind(entry.to.bin_entry)
        .bind(entry.movement.as_str())
        .bind(entry.operation.map(|op| op.kind().as_str()))
        .bind(entry.operation.map(|op| op.reference()))
        .bind(Uuid::from(entry.actor))
        .bind(entry.occurred_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_location_history", e))?;
        Ok(())
    }

    async fn location_history(
        &mut self,
        package_id: PackageId,
    ) -> StoreResult<Vec<PackageLocationHistory>> {
        let rows = sqlx::query(
            r#"
            SELECT id, package_id, from_warehouse, from_bin, to_warehouse, to_bin,
                   movement, operation_kind, operation_ref, actor, occurred_at
            FROM package_location_history
            WHERE package_id = $1
            ORDER BY occurred_at, id
            "#,
        )
        .bind(Uuid::from(package_id))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_location_history", e))?;

        rows.iter()
            .map(|row| -> StoreResult<PackageLocationHistory> {
                let kind: Option<String> = get(row, "operation_kind")?;
                let reference: Option<String> = get(row, "operation_ref")?;
                let operation = match (kind, reference) {
                    (Some(kind), Some(reference)) => {
                        Some(OperationRef::from_parts(parse(&kind)?, &reference)?)
                    }
                    _ => None,
                };
                Ok(PackageLocationHistory {
                    id: RecordId::from_uuid(get(row, "id")?),
                    package_id: PackageId::from_uuid(get(row, "package_id")?),
                    from: Location::new(get::<String>(row, "from_warehouse")?, get(row, "from_bin")?),
                    to: Location::new(get::<String>(row, "to_warehouse")?, get(row, "to_bin")?),
                    movement: parse(&get::<String>(row, "movement")?)?,
                    operation,
                    actor: UserId::from_uuid(get(row, "actor")?),
                    occurred_at: get(row, "occurred_at")?,
                })
            })
            .collect()
    }

    async fn insert_pick_line(&mut self, line: &PickListLine) -> StoreResult<()> {
        let (source_package, source_full) = match line.source {
            PickSource::Stock => (None, false),
            PickSource::Package { package_id, full } => (Some(Uuid::from(package_id)), full),
        };
        sqlx::query(
            r#"
            INSERT INTO pick_list_lines (
                id, abs_entry, pick_entry, item_code, quantity, unit, bin_entry,
                source_package, source_full, target_package, status, sync_status,
                created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(Uuid::from(line.id))
        .bind(line.abs_entry)
        .bind(line.pick_entry)
        .bind(&line.item_code)
        .bind(line.quantity)
        .bind(line.unit.as_str())
        .bind(line.bin_entry)
        .bind(source_package)
        .bind(source_full)
        .bind(line.target_package_id.map(Uuid::from))
        .bind(line.status.as_str())
        .bind(line.sync_status.as_str())
        .bind(Uuid::from(line.created_by))
        .bind(line.created_at)
        .bind(line.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_pick_line", e))?;
        Ok(())
    }

    async fn update_pick_line(&mut self, line: &PickListLine) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pick_list_lines
            SET status = $2, sync_status = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(line.id))
        .bind(line.status.as_str())
        .bind(line.sync_status.as_str())
        .bind(line.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_pick_line", e))?;
        expect_one(result.rows_affected(), || format!("pick line {}", line.id))
    }

    async fn pick_lines(&mut self, abs_entry: i32) -> StoreResult<Vec<PickListLine>> {
        let sql = format!(
            "SELECT {PICK_LINE_COLUMNS} FROM pick_list_lines \
             WHERE abs_entry = $1 ORDER BY created_at, id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(abs_entry)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_pick_lines", e))?;
        rows.iter().map(pick_line_from_row).collect()
    }

    async fn open_stock_pick_quantity(&mut self, item_code: &str, bin_entry: i32) -> StoreResult<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(quantity)::BIGINT
            FROM pick_list_lines
            WHERE item_code = $1 AND bin_entry = $2
              AND source_package IS NULL AND status = 'open'
            "#,
        )
        .bind(item_code)
        .bind(bin_entry)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("open_stock_pick_quantity", e))?;
        Ok(total.unwrap_or(0))
    }

    async fn insert_pick_package(&mut self, link: &PickListPackage) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pick_list_packages (id, abs_entry, package_id, role, pick_entry, added_by, added_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::from(link.id))
        .bind(link.abs_entry)
        .bind(Uuid::from(link.package_id))
        .bind(link.role.as_str())
        .bind(link.role.pick_entry())
        .bind(Uuid::from(link.added_by))
        .bind(link.added_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_pick_package", e))?;
        Ok(())
    }

    async fn pick_packages(&mut self, abs_entry: i32) -> StoreResult<Vec<PickListPackage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, abs_entry, package_id, role, pick_entry, added_by, added_at
            FROM pick_list_packages
            WHERE abs_entry = $1
            ORDER BY added_at, id
            "#,
        )
        .bind(abs_entry)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_pick_packages", e))?;

        rows.iter()
            .map(|row| -> StoreResult<PickListPackage> {
                let role: String = get(row, "role")?;
                Ok(PickListPackage {
                    id: RecordId::from_uuid(get(row, "id")?),
                    abs_entry: get(row, "abs_entry")?,
                    package_id: PackageId::from_uuid(get(row, "package_id")?),
                    role: PickPackageRole::from_parts(&role, get(row, "pick_entry")?)?,
                    added_by: UserId::from_uuid(get(row, "added_by")?),
                    added_at: get(row, "added_at")?,
                })
            })
            .collect()
    }

    async fn delete_pick_packages(&mut self, abs_entry: i32) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM pick_list_packages WHERE abs_entry = $1")
            .bind(abs_entry)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_pick_packages", e))?;
        Ok(result.rows_affected())
    }

    async fn insert_transfer(&mut self, transfer: &Transfer) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transfers (
                id, series, external_entry, external_number, source_warehouse, target_warehouse,
                comments, reason, status, lines, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(Uuid::from(transfer.id))
        .bind(transfer.series)
        .bind(transfer.external_entry)
        .bind(transfer.external_number)
        .bind(&transfer.source_warehouse)
        .bind(&transfer.target_warehouse)
        .bind(&transfer.comments)
        .bind(Json(&transfer.reason))
        .bind(transfer.status.as_str())
        .bind(Json(&transfer.lines))
        .bind(Uuid::from(transfer.created_by))
        .bind(transfer.created_at)
        .bind(transfer.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_transfer", e))?;
        Ok(())
    }

    async fn update_transfer(&mut self, transfer: &Transfer) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET external_entry = $2, external_number = $3, status = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(transfer.id))
        .bind(transfer.external_entry)
        .bind(transfer.external_number)
        .bind(transfer.status.as_str())
        .bind(transfer.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_transfer", e))?;
        expect_one(result.rows_affected(), || format!("transfer {}", transfer.id))
    }

    async fn transfer(&mut self, id: TransferId) -> StoreResult<Option<Transfer>> {
        let sql = format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_transfer", e))?;
        row.as_ref().map(transfer_from_row).transpose()
    }

    async fn insert_transfer_package(&mut self, link: &TransferPackage) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transfer_packages (id, transfer_id, package_id, role, added_by, added_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::from(link.id))
        .bind(Uuid::from(link.transfer_id))
        .bind(Uuid::from(link.package_id))
        .bind(link.role.as_str())
        .bind(Uuid::from(link.added_by))
        .bind(link.added_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_transfer_package", e))?;
        Ok(())
    }

    async fn transfer_packages(&mut self, transfer_id: TransferId) -> StoreResult<Vec<TransferPackage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, transfer_id, package_id, role, added_by, added_at
            FROM transfer_packages
            WHERE transfer_id = $1
            ORDER BY added_at, id
            "#,
        )
        .bind(Uuid::from(transfer_id))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_transfer_packages", e))?;

        rows.iter()
            .map(|row| -> StoreResult<TransferPackage> {
                Ok(TransferPackage {
                    id: RecordId::from_uuid(get(row, "id")?),
                    transfer_id: TransferId::from_uuid(get(row, "transfer_id")?),
                    package_id: PackageId::from_uuid(get(row, "package_id")?),
                    role: parse(&get::<String>(row, "role")?)?,
                    added_by: UserId::from_uuid(get(row, "added_by")?),
                    added_at: get(row, "added_at")?,
                })
            })
            .collect()
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Decode(format!("column {column}: {e}")))
}

fn parse<T>(value: &str) -> StoreResult<T>
where
    T: core::str::FromStr<Err = DomainError>,
{
    value.parse().map_err(StoreError::from)
}

fn operation_from_row(row: &PgRow, kind_column: &str, ref_column: &str) -> StoreResult<OperationRef> {
    let kind: OperationKind = parse(&get::<String>(row, kind_column)?)?;
    let reference: String = get(row, ref_column)?;
    Ok(OperationRef::from_parts(kind, &reference)?)
}

fn package_from_row(row: &PgRow) -> StoreResult<Package> {
    let custom_attributes: Json<BTreeMap<String, String>> = get(row, "custom_attributes")?;
    Ok(Package {
        id: PackageId::from_uuid(get(row, "id")?),
        barcode: get(row, "barcode")?,
        status: parse(&get::<String>(row, "status")?)?,
        location: Location::new(get::<String>(row, "warehouse")?, get(row, "bin_entry")?),
        created_by: UserId::from_uuid(get(row, "created_by")?),
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        closed_at: get::<Option<DateTime<Utc>>>(row, "closed_at")?,
        notes: get(row, "notes")?,
        custom_attributes: custom_attributes.0,
    })
}

fn content_from_row(row: &PgRow) -> StoreResult<PackageContent> {
    Ok(PackageContent {
        package_id: PackageId::from_uuid(get(row, "package_id")?),
        item_code: get(row, "item_code")?,
        quantity: get(row, "quantity")?,
        committed_quantity: get(row, "committed_quantity")?,
        location: Location::new(get::<String>(row, "warehouse")?, get(row, "bin_entry")?),
        updated_at: get(row, "updated_at")?,
    })
}

fn commitment_from_row(row: &PgRow) -> StoreResult<PackageCommitment> {
    let allocation: String = get(row, "allocation")?;
    let linked_package: Option<Uuid> = get(row, "linked_package")?;
    let linked_commitment: Option<Uuid> = get(row, "linked_commitment")?;
    Ok(PackageCommitment {
        id: CommitmentId::from_uuid(get(row, "id")?),
        package_id: PackageId::from_uuid(get(row, "package_id")?),
        item_code: get(row, "item_code")?,
        operation: operation_from_row(row, "operation_kind", "operation_ref")?,
        allocation: Allocation::from_parts(
            &allocation,
            linked_package.map(PackageId::from_uuid),
            linked_commitment.map(CommitmentId::from_uuid),
        )?,
        quantity: get(row, "quantity")?,
        created_at: get(row, "created_at")?,
    })
}

fn pick_line_from_row(row: &PgRow) -> StoreResult<PickListLine> {
    let source_package: Option<Uuid> = get(row, "source_package")?;
    let source = match source_package {
        None => PickSource::Stock,
        Some(package_id) => PickSource::Package {
            package_id: PackageId::from_uuid(package_id),
            full: get(row, "source_full")?,
        },
    };
    let target_package: Option<Uuid> = get(row, "target_package")?;
    Ok(PickListLine {
        id: RecordId::from_uuid(get(row, "id")?),
        abs_entry: get(row, "abs_entry")?,
        pick_entry: get(row, "pick_entry")?,
        item_code: get(row, "item_code")?,
        quantity: get(row, "quantity")?,
        unit: parse(&get::<String>(row, "unit")?)?,
        bin_entry: get(row, "bin_entry")?,
        source,
        target_package_id: target_package.map(PackageId::from_uuid),
        status: parse(&get::<String>(row, "status")?)?,
        sync_status: parse(&get::<String>(row, "sync_status")?)?,
        created_by: UserId::from_uuid(get(row, "created_by")?),
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> StoreResult<Transfer> {
    let reason: Json<TransferReason> = get(row, "reason")?;
    let lines: Json<Vec<TransferLine>> = get(row, "lines")?;
    Ok(Transfer {
        id: TransferId::from_uuid(get(row, "id")?),
        series: get(row, "series")?,
        external_entry: get(row, "external_entry")?,
        external_number: get(row, "external_number")?,
        source_warehouse: get(row, "source_warehouse")?,
        target_warehouse: get(row, "target_warehouse")?,
        comments: get(row, "comments")?,
        reason: reason.0,
        status: parse(&get::<String>(row, "status")?)?,
        lines: lines.0,
        created_by: UserId::from_uuid(get(row, "created_by")?),
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn expect_one(rows_affected: u64, what: impl FnOnce() -> String) -> StoreResult<()> {
    if rows_affected == 0 {
        return Err(StoreError::Missing(what()));
    }
    Ok(())
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation, serialization failure, deadlock.
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{}: {}", operation, err))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
