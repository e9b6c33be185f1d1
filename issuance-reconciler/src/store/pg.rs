// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{Int4, Text};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, QueryableByName, SelectableHelper};
use diesel_async::RunQueryDsl;
use issuance_pg_db::{Connection, Db};
use issuance_schema::models::{IssuanceStatus, NewPendingIssuance, PendingIssuance, TemplateKind};
use issuance_schema::schema::tokens;

use super::{
    classify_unmatched_resolve, with_store_timeout, IssuanceStore, NoContractOutcome,
    ResolveOutcome, StatusCounts,
};
use crate::error::{ReconcileError, ReconcileResult};

// Increment and cap in one statement; the right-hand side of SET sees the old row.
const RECORD_NO_CONTRACT_SQL: &str = "
    UPDATE tokens
    SET no_contract_observations = no_contract_observations + 1,
        status = CASE WHEN no_contract_observations + 1 >= $2 THEN 'failed' ELSE status END,
        failure_reason = CASE WHEN no_contract_observations + 1 >= $2 THEN $3 ELSE failure_reason END
    WHERE tx_hash = $1 AND status = 'pending' AND token_address IS NULL
    RETURNING no_contract_observations, status";

#[derive(QueryableByName)]
struct ObservationRow {
    #[diesel(sql_type = Int4)]
    no_contract_observations: i32,
    #[diesel(sql_type = Text)]
    status: String,
}

/// `tokens` table backed store. Every call is bounded by the configured store timeout.
#[derive(Clone)]
pub struct PgIssuanceStore {
    db: Db,
    timeout: Duration,
}

impl PgIssuanceStore {
    pub fn new(db: Db, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    async fn connect(&self) -> ReconcileResult<Connection<'_>> {
        self.db
            .connect()
            .await
            .map_err(|e| ReconcileError::StoreUnavailable(e.to_string()))
    }
}

fn storage_error(e: DieselError) -> ReconcileError {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
            ReconcileError::StoreUnavailable(info.message().to_string())
        }
        DieselError::BrokenTransactionManager => {
            ReconcileError::StoreUnavailable(e.to_string())
        }
        other => ReconcileError::StorageError(other.to_string()),
    }
}

#[async_trait]
impl IssuanceStore for PgIssuanceStore {
    async fn insert_pending(&self, new: NewPendingIssuance) -> ReconcileResult<PendingIssuance> {
        with_store_timeout(self.timeout, async {
            let mut conn = self.connect().await?;
            diesel::insert_into(tokens::table)
                .values(&new)
                .returning(PendingIssuance::as_returning())
                .get_result(&mut conn)
                .await
                .map_err(|e| match e {
                    DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                        ReconcileError::DuplicateTxHash(new.transaction_hash.clone())
                    }
                    other => storage_error(other),
                })
        })
        .await
    }

    async fn select_unresolved(&self) -> ReconcileResult<Vec<PendingIssuance>> {
        with_store_timeout(self.timeout, async {
            let mut conn = self.connect().await?;
            tokens::table
                .filter(tokens::token_address.is_null())
                .filter(tokens::status.eq(IssuanceStatus::Pending.as_ref()))
                .order(tokens::id.asc())
                .select(PendingIssuance::as_select())
                .load(&mut conn)
                .await
                .map_err(storage_error)
        })
        .await
    }

    async fn resolve(
        &self,
        tx_hash: &str,
        deployer: &str,
        contract: &str,
    ) -> ReconcileResult<ResolveOutcome> {
        with_store_timeout(self.timeout, async {
            let mut conn = self.connect().await?;
            // Both address columns and the status flip in one statement, guarded so a
            // resolved or failed row is never rewritten.
            let updated = diesel::update(
                tokens::table
                    .filter(tokens::tx_hash.eq(tx_hash))
                    .filter(tokens::token_address.is_null())
                    .filter(tokens::status.eq(IssuanceStatus::Pending.as_ref())),
            )
            .set((
                tokens::admin_address.eq(deployer),
                tokens::token_address.eq(contract),
                tokens::status.eq(IssuanceStatus::Resolved.as_ref()),
            ))
            .execute(&mut conn)
            .await
            .map_err(storage_error)?;

            if updated > 0 {
                return Ok(ResolveOutcome::Resolved);
            }

            let existing = tokens::table
                .filter(tokens::tx_hash.eq(tx_hash))
                .select(PendingIssuance::as_select())
                .first(&mut conn)
                .await
                .optional()
                .map_err(storage_error)?;
            classify_unmatched_resolve(existing, tx_hash, deployer, contract)
        })
        .await
    }

    async fn record_no_contract(
        &self,
        tx_hash: &str,
        reason: &str,
        max_observations: u32,
    ) -> ReconcileResult<NoContractOutcome> {
        with_store_timeout(self.timeout, async {
            let mut conn = self.connect().await?;
            let row: Option<ObservationRow> = diesel::sql_query(RECORD_NO_CONTRACT_SQL)
                .bind::<Text, _>(tx_hash)
                .bind::<Int4, _>(i32::try_from(max_observations).unwrap_or(i32::MAX))
                .bind::<Text, _>(reason)
                .get_result(&mut conn)
                .await
                .optional()
                .map_err(storage_error)?;

            Ok(match row {
                None => NoContractOutcome::NotFound,
                Some(row) => {
                    let observations = row.no_contract_observations.max(0) as u32;
                    if row.status == IssuanceStatus::Failed.as_ref() {
                        NoContractOutcome::Failed { observations }
                    } else {
                        NoContractOutcome::StillPending { observations }
                    }
                }
            })
        })
        .await
    }

    async fn mark_failed(&self, tx_hash: &str, reason: &str) -> ReconcileResult<bool> {
        with_store_timeout(self.timeout, async {
            let mut conn = self.connect().await?;
            let updated = diesel::update(
                tokens::table
                    .filter(tokens::tx_hash.eq(tx_hash))
                    .filter(tokens::token_address.is_null())
                    .filter(tokens::status.eq(IssuanceStatus::Pending.as_ref())),
            )
            .set((
                tokens::status.eq(IssuanceStatus::Failed.as_ref()),
                tokens::failure_reason.eq(reason),
            ))
            .execute(&mut conn)
            .await
            .map_err(storage_error)?;
            Ok(updated > 0)
        })
        .await
    }

    async fn find_by_tx_hash(&self, tx_hash: &str) -> ReconcileResult<Option<PendingIssuance>> {
        with_store_timeout(self.timeout, async {
            let mut conn = self.connect().await?;
            tokens::table
                .filter(tokens::tx_hash.eq(tx_hash))
                .select(PendingIssuance::as_select())
                .first(&mut conn)
                .await
                .optional()
                .map_err(storage_error)
        })
        .await
    }

    async fn list_issued(
        &self,
        template: Option<TemplateKind>,
    ) -> ReconcileResult<Vec<PendingIssuance>> {
        with_store_timeout(self.timeout, async {
            let mut conn = self.connect().await?;
            let mut query = tokens::table
                .filter(tokens::token_address.is_not_null())
                .order(tokens::id.asc())
                .select(PendingIssuance::as_select())
                .into_boxed();
            if let Some(template) = template {
                query = query.filter(tokens::template_id.eq(template.template_id()));
            }
            query.load(&mut conn).await.map_err(storage_error)
        })
        .await
    }

    async fn count_by_status(&self) -> ReconcileResult<StatusCounts> {
        with_store_timeout(self.timeout, async {
            let mut conn = self.connect().await?;
            let rows: Vec<(String, i64)> = tokens::table
                .group_by(tokens::status)
                .select((tokens::status, diesel::dsl::count_star()))
                .load(&mut conn)
                .await
                .map_err(storage_error)?;

            let mut counts = StatusCounts::default();
            for (status, count) in rows {
                let count = count.max(0) as u64;
                match status.parse::<IssuanceStatus>() {
                    Ok(IssuanceStatus::Pending) => counts.pending += count,
                    Ok(IssuanceStatus::Resolved) => counts.resolved += count,
                    Ok(IssuanceStatus::Failed) => counts.failed += count,
                    Err(_) => tracing::warn!("[IssuanceStore] Unknown status value: {}", status),
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn purge(&self) -> ReconcileResult<()> {
        with_store_timeout(self.timeout, async {
            let mut conn = self.connect().await?;
            diesel::sql_query("TRUNCATE TABLE tokens RESTART IDENTITY")
                .execute(&mut conn)
                .await
                .map_err(storage_error)?;
            Ok(())
        })
        .await
    }
}

#[cfg(all(test, feature = "db-tests"))]
mod tests {
    use super::*;
    use issuance_pg_db::{reset_database, DbArgs};
    use issuance_schema::MIGRATIONS;

    fn hash(byte: u8) -> String {
        format!("0x{}", format!("{:02x}", byte).repeat(32))
    }

    async fn setup() -> PgIssuanceStore {
        let url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL environment variable must be set")
            .parse()
            .expect("Invalid database URL format");
        let db = reset_database(url, DbArgs::default(), Some(&MIGRATIONS))
            .await
            .expect("Failed to reset database");
        PgIssuanceStore::new(db, Duration::from_secs(10))
    }

    // Single scenario because every test would reset the same database.
    #[tokio::test]
    async fn test_pg_store_lifecycle() {
        let store = setup().await;

        let a = store
            .insert_pending(NewPendingIssuance::new(TemplateKind::Bond, hash(1), "[]", "0x60"))
            .await
            .unwrap();
        store
            .insert_pending(NewPendingIssuance::new(TemplateKind::Share, hash(2), "[]", "0x60"))
            .await
            .unwrap();
        store
            .insert_pending(NewPendingIssuance::new(TemplateKind::Bond, hash(3), "[]", "0x60"))
            .await
            .unwrap();
        assert_eq!(a.status(), IssuanceStatus::Pending);
        assert!(a.deployer_address.is_none() && a.contract_address.is_none());

        let dup = store
            .insert_pending(NewPendingIssuance::new(TemplateKind::Bond, hash(1), "[]", "0x60"))
            .await
            .unwrap_err();
        assert_eq!(dup, ReconcileError::DuplicateTxHash(hash(1)));

        assert_eq!(store.select_unresolved().await.unwrap().len(), 3);

        // resolve, then replay
        assert_eq!(
            store.resolve(&hash(1), "0xdef", "0x123").await.unwrap(),
            ResolveOutcome::Resolved
        );
        assert_eq!(
            store.resolve(&hash(1), "0xdef", "0x123").await.unwrap(),
            ResolveOutcome::AlreadyResolved
        );
        let conflict = store.resolve(&hash(1), "0xdef", "0x456").await.unwrap_err();
        assert_eq!(conflict.error_type(), "resolution_conflict");
        assert_eq!(
            store.resolve(&hash(9), "0xdef", "0x123").await.unwrap(),
            ResolveOutcome::NotFound
        );

        // no-contract cap
        assert_eq!(
            store.record_no_contract(&hash(2), "reverted", 2).await.unwrap(),
            NoContractOutcome::StillPending { observations: 1 }
        );
        assert_eq!(
            store.record_no_contract(&hash(2), "reverted", 2).await.unwrap(),
            NoContractOutcome::Failed { observations: 2 }
        );
        let failed = store.find_by_tx_hash(&hash(2)).await.unwrap().unwrap();
        assert_eq!(failed.failure_reason.as_deref(), Some("reverted"));

        let unresolved = store.select_unresolved().await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].transaction_hash, hash(3));

        assert!(store.mark_failed(&hash(3), "invalid_tx_hash").await.unwrap());
        assert!(!store.mark_failed(&hash(3), "invalid_tx_hash").await.unwrap());

        let bonds = store.list_issued(Some(TemplateKind::Bond)).await.unwrap();
        assert_eq!(bonds.len(), 1);
        assert!(store
            .list_issued(Some(TemplateKind::Share))
            .await
            .unwrap()
            .is_empty());

        assert_eq!(
            store.count_by_status().await.unwrap(),
            StatusCounts {
                pending: 0,
                resolved: 1,
                failed: 2
            }
        );

        store.purge().await.unwrap();
        let row = store
            .insert_pending(NewPendingIssuance::new(TemplateKind::Coupon, hash(4), "[]", "0x60"))
            .await
            .unwrap();
        assert_eq!(row.id, 1);
    }
}
