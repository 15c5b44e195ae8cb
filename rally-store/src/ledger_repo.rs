use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use rally_core::repository::{
    BookingRefundReservation, PackageRefundReservation, PaymentConfirmation, TransferReceipt,
};
use rally_core::{
    Booking, Installment, LedgerError, LedgerResult, Package, PaymentTarget, SettlementLedger,
    SettlementTarget, UNCONFIGURED_PAYOUT_DESTINATION,
};

/// Postgres-backed settlement ledger. Status transitions are single
/// conditional statements (or a short transaction holding the package row
/// lock), so concurrent processes race on the database, never in memory.
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(err.to_string())
}

fn corrupt(err: rally_core::CoreError) -> LedgerError {
    LedgerError::Corrupt(err.to_string())
}

const BOOKING_COLUMNS: &str = "id, buyer_id, provider_id, gross_minor, commission_minor, provider_net_minor, \
     payment_status, transfer_status, refund_status, service_start, service_end, checkout_reference, \
     payment_reference, transfer_reference, transferred_minor, refund_references, refunded_minor, \
     refund_reserved_minor, payout_destination, paid_at, transferred_at, created_at, updated_at, transfer_retry_at";

const PACKAGE_COLUMNS: &str = "id, buyer_id, provider_id, gross_minor, commission_minor, provider_net_minor, \
     total_sessions, sessions_completed, remaining_hours, status, payment_status, refund_status, \
     refunded_minor, refund_reserved_minor, checkout_reference, payment_reference, refund_references, \
     payout_destination, paid_at, created_at, updated_at";

const INSTALLMENT_COLUMNS: &str = "id, package_id, sequence, payout_minor, hours, service_start, service_end, \
     transfer_status, transfer_reference, transferred_at, transfer_retry_at";

// Mirrors rally_core::configured_destination.
const DESTINATION_CONFIGURED: &str = "payout_destination IS NOT NULL \
     AND btrim(payout_destination) <> '' \
     AND lower(btrim(payout_destination)) <> $3";

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    buyer_id: Uuid,
    provider_id: Uuid,
    gross_minor: i64,
    commission_minor: i64,
    provider_net_minor: i64,
    payment_status: String,
    transfer_status: String,
    refund_status: String,
    service_start: DateTime<Utc>,
    service_end: DateTime<Utc>,
    checkout_reference: Option<String>,
    payment_reference: Option<String>,
    transfer_reference: Option<String>,
    transferred_minor: Option<i64>,
    refund_references: Vec<String>,
    refunded_minor: i64,
    refund_reserved_minor: i64,
    payout_destination: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    transferred_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    transfer_retry_at: Option<DateTime<Utc>>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = LedgerError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            buyer_id: row.buyer_id,
            provider_id: row.provider_id,
            gross_minor: row.gross_minor,
            commission_minor: row.commission_minor,
            provider_net_minor: row.provider_net_minor,
            payment_status: row.payment_status.parse().map_err(corrupt)?,
            transfer_status: row.transfer_status.parse().map_err(corrupt)?,
            refund_status: row.refund_status.parse().map_err(corrupt)?,
            service_start: row.service_start,
            service_end: row.service_end,
            checkout_reference: row.checkout_reference,
            payment_reference: row.payment_reference,
            transfer_reference: row.transfer_reference,
            transferred_minor: row.transferred_minor,
            refund_references: row.refund_references,
            refunded_minor: row.refunded_minor,
            refund_reserved_minor: row.refund_reserved_minor,
            payout_destination: row.payout_destination,
            paid_at: row.paid_at,
            transferred_at: row.transferred_at,
            transfer_retry_at: row.transfer_retry_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PackageRow {
    id: Uuid,
    buyer_id: Uuid,
    provider_id: Uuid,
    gross_minor: i64,
    commission_minor: i64,
    provider_net_minor: i64,
    total_sessions: i32,
    sessions_completed: i32,
    remaining_hours: i32,
    status: String,
    payment_status: String,
    refund_status: String,
    refunded_minor: i64,
    refund_reserved_minor: i64,
    checkout_reference: Option<String>,
    payment_reference: Option<String>,
    refund_references: Vec<String>,
    payout_destination: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct InstallmentRow {
    id: Uuid,
    package_id: Uuid,
    sequence: i32,
    payout_minor: i64,
    hours: i32,
    service_start: DateTime<Utc>,
    service_end: DateTime<Utc>,
    transfer_status: String,
    transfer_reference: Option<String>,
    transferred_at: Option<DateTime<Utc>>,
    transfer_retry_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstallmentRow> for Installment {
    type Error = LedgerError;

    fn try_from(row: InstallmentRow) -> Result<Self, Self::Error> {
        Ok(Installment {
            id: row.id,
            package_id: row.package_id,
            sequence: row.sequence,
            payout_minor: row.payout_minor,
            hours: row.hours,
            service_start: row.service_start,
            service_end: row.service_end,
            transfer_status: row.transfer_status.parse().map_err(corrupt)?,
            transfer_reference: row.transfer_reference,
            transferred_at: row.transferred_at,
            transfer_retry_at: row.transfer_retry_at,
        })
    }
}

fn assemble_package(row: PackageRow, installments: Vec<InstallmentRow>) -> LedgerResult<Package> {
    Ok(Package {
        id: row.id,
        buyer_id: row.buyer_id,
        provider_id: row.provider_id,
        gross_minor: row.gross_minor,
        commission_minor: row.commission_minor,
        provider_net_minor: row.provider_net_minor,
        total_sessions: row.total_sessions,
        sessions_completed: row.sessions_completed,
        remaining_hours: row.remaining_hours,
        status: row.status.parse().map_err(corrupt)?,
        payment_status: row.payment_status.parse().map_err(corrupt)?,
        refund_status: row.refund_status.parse().map_err(corrupt)?,
        refunded_minor: row.refunded_minor,
        refund_reserved_minor: row.refund_reserved_minor,
        checkout_reference: row.checkout_reference,
        payment_reference: row.payment_reference,
        refund_references: row.refund_references,
        payout_destination: row.payout_destination,
        paid_at: row.paid_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
        installments: installments
            .into_iter()
            .map(Installment::try_from)
            .collect::<LedgerResult<Vec<_>>>()?,
    })
}

impl PgLedger {
    async fn load_package<'e, E>(executor: E, id: Uuid) -> LedgerResult<Option<PackageRow>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query_as::<_, PackageRow>(&format!("SELECT {} FROM packages WHERE id = $1", PACKAGE_COLUMNS))
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(storage)
    }

    async fn load_installments(tx: &mut Transaction<'_, Postgres>, package_id: Uuid) -> LedgerResult<Vec<InstallmentRow>> {
        sqlx::query_as::<_, InstallmentRow>(&format!(
            "SELECT {} FROM package_installments WHERE package_id = $1 ORDER BY sequence",
            INSTALLMENT_COLUMNS
        ))
        .bind(package_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(storage)
    }

    async fn package_in_tx(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> LedgerResult<Package> {
        let row = Self::load_package(&mut **tx, id)
            .await?
            .ok_or(LedgerError::NotFound { kind: "package", id })?;
        let installments = Self::load_installments(tx, id).await?;
        assemble_package(row, installments)
    }

    /// Locks the package row for the rest of the transaction.
    async fn lock_package(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> LedgerResult<Option<PackageRow>> {
        sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {} FROM packages WHERE id = $1 FOR UPDATE",
            PACKAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage)
    }

    async fn claim_installment(&self, installment_id: Uuid, now: DateTime<Utc>) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Package row lock serializes installment claims against pro-rata refunds.
        let package_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT p.id FROM packages p
            JOIN package_installments i ON i.package_id = p.id
            WHERE i.id = $1
            FOR UPDATE OF p
            "#,
        )
        .bind(installment_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        if package_id.is_none() {
            return Ok(false);
        }

        let claimed = sqlx::query(
            r#"
            UPDATE package_installments i
            SET transfer_status = 'IN_PROGRESS'
            FROM packages p
            WHERE i.id = $1
              AND p.id = i.package_id
              AND i.transfer_status = 'PENDING'
              AND i.service_end <= $2
              AND p.payment_status = 'PAID'
              AND p.status = 'ACTIVE'
              AND p.refund_status <> 'FULL'
              AND p.refund_reserved_minor = 0
            "#,
        )
        .bind(installment_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage)?
        .rows_affected()
            == 1;

        tx.commit().await.map_err(storage)?;
        Ok(claimed)
    }

    async fn complete_installment(&self, installment_id: Uuid, receipt: &TransferReceipt) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let updated: Option<(Uuid, i32)> = sqlx::query_as(
            r#"
            UPDATE package_installments
            SET transfer_status = 'TRANSFERRED',
                transfer_reference = $2,
                payout_minor = $3,
                transferred_at = $4,
                transfer_retry_at = NULL
            WHERE id = $1 AND transfer_status = 'IN_PROGRESS'
            RETURNING package_id, hours
            "#,
        )
        .bind(installment_id)
        .bind(&receipt.transfer_reference)
        .bind(receipt.amount_minor)
        .bind(receipt.transferred_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        let (package_id, hours) = updated.ok_or_else(|| LedgerError::GuardViolated {
            id: installment_id,
            detail: "installment transfer is not IN_PROGRESS".to_string(),
        })?;

        sqlx::query(
            r#"
            UPDATE packages
            SET sessions_completed = sessions_completed + 1,
                remaining_hours = GREATEST(remaining_hours - $2, 0),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(package_id)
        .bind(hours)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)
    }
}

#[async_trait]
impl SettlementLedger for PgLedger {
    async fn insert_booking(&self, booking: &Booking) -> LedgerResult<()> {
        sqlx::query(&format!(
            "INSERT INTO bookings ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)",
            BOOKING_COLUMNS
        ))
        .bind(booking.id)
        .bind(booking.buyer_id)
        .bind(booking.provider_id)
        .bind(booking.gross_minor)
        .bind(booking.commission_minor)
        .bind(booking.provider_net_minor)
        .bind(booking.payment_status.as_str())
        .bind(booking.transfer_status.as_str())
        .bind(booking.refund_status.as_str())
        .bind(booking.service_start)
        .bind(booking.service_end)
        .bind(&booking.checkout_reference)
        .bind(&booking.payment_reference)
        .bind(&booking.transfer_reference)
        .bind(booking.transferred_minor)
        .bind(&booking.refund_references)
        .bind(booking.refunded_minor)
        .bind(booking.refund_reserved_minor)
        .bind(&booking.payout_destination)
        .bind(booking.paid_at)
        .bind(booking.transferred_at)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .bind(booking.transfer_retry_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn insert_package(&self, package: &Package) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query(&format!(
            "INSERT INTO packages ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)",
            PACKAGE_COLUMNS
        ))
        .bind(package.id)
        .bind(package.buyer_id)
        .bind(package.provider_id)
        .bind(package.gross_minor)
        .bind(package.commission_minor)
        .bind(package.provider_net_minor)
        .bind(package.total_sessions)
        .bind(package.sessions_completed)
        .bind(package.remaining_hours)
        .bind(package.status.as_str())
        .bind(package.payment_status.as_str())
        .bind(package.refund_status.as_str())
        .bind(package.refunded_minor)
        .bind(package.refund_reserved_minor)
        .bind(&package.checkout_reference)
        .bind(&package.payment_reference)
        .bind(&package.refund_references)
        .bind(&package.payout_destination)
        .bind(package.paid_at)
        .bind(package.created_at)
        .bind(package.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        for installment in &package.installments {
            sqlx::query(&format!(
                "INSERT INTO package_installments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                INSTALLMENT_COLUMNS
            ))
            .bind(installment.id)
            .bind(installment.package_id)
            .bind(installment.sequence)
            .bind(installment.payout_minor)
            .bind(installment.hours)
            .bind(installment.service_start)
            .bind(installment.service_end)
            .bind(installment.transfer_status.as_str())
            .bind(&installment.transfer_reference)
            .bind(installment.transferred_at)
            .bind(installment.transfer_retry_at)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)
    }

    async fn get_booking(&self, id: Uuid) -> LedgerResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!("SELECT {} FROM bookings WHERE id = $1", BOOKING_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        row.map(Booking::try_from).transpose()
    }

    async fn get_package(&self, id: Uuid) -> LedgerResult<Option<Package>> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let Some(row) = Self::load_package(&mut *tx, id).await? else {
            return Ok(None);
        };
        let installments = Self::load_installments(&mut tx, id).await?;
        tx.commit().await.map_err(storage)?;

        assemble_package(row, installments).map(Some)
    }

    async fn find_package_by_installment(&self, installment_id: Uuid) -> LedgerResult<Option<Package>> {
        let package_id: Option<Uuid> = sqlx::query_scalar("SELECT package_id FROM package_installments WHERE id = $1")
            .bind(installment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        match package_id {
            Some(id) => self.get_package(id).await,
            None => Ok(None),
        }
    }

    async fn find_by_payment_reference(&self, reference: &str) -> LedgerResult<Option<PaymentTarget>> {
        let booking: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM bookings WHERE checkout_reference = $1 OR payment_reference = $1 LIMIT 1",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        if let Some(id) = booking {
            return Ok(Some(PaymentTarget::Booking(id)));
        }

        let package: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM packages WHERE checkout_reference = $1 OR payment_reference = $1 LIMIT 1",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        Ok(package.map(PaymentTarget::Package))
    }

    async fn confirm_booking_payment(&self, id: Uuid, confirmation: &PaymentConfirmation) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET payment_status = 'PAID',
                payment_reference = $2,
                commission_minor = $3,
                provider_net_minor = $4,
                paid_at = $5,
                updated_at = NOW()
            WHERE id = $1 AND payment_status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(&confirmation.payment_reference)
        .bind(confirmation.split.commission_minor)
        .bind(confirmation.split.provider_net_minor)
        .bind(confirmation.paid_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_booking_payment(&self, id: Uuid) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE bookings SET payment_status = 'FAILED', updated_at = NOW() WHERE id = $1 AND payment_status = 'PENDING'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn confirm_package_payment(&self, id: Uuid, confirmation: &PaymentConfirmation) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let total_sessions: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE packages
            SET payment_status = 'PAID',
                payment_reference = $2,
                commission_minor = $3,
                provider_net_minor = $4,
                paid_at = $5,
                updated_at = NOW()
            WHERE id = $1 AND payment_status = 'PENDING'
            RETURNING total_sessions
            "#,
        )
        .bind(id)
        .bind(&confirmation.payment_reference)
        .bind(confirmation.split.commission_minor)
        .bind(confirmation.split.provider_net_minor)
        .bind(confirmation.paid_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        let Some(total_sessions) = total_sessions else {
            return Ok(false);
        };

        let payouts = rally_core::commission::split_evenly(
            confirmation.split.provider_net_minor,
            total_sessions.max(0) as usize,
        );
        for (i, payout) in payouts.into_iter().enumerate() {
            sqlx::query("UPDATE package_installments SET payout_minor = $3 WHERE package_id = $1 AND sequence = $2")
                .bind(id)
                .bind(i as i32 + 1)
                .bind(payout)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(true)
    }

    async fn fail_package_payment(&self, id: Uuid) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE packages SET payment_status = 'FAILED', updated_at = NOW() WHERE id = $1 AND payment_status = 'PENDING'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_settlement_candidates(&self, now: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<SettlementTarget>> {
        let rows: Vec<(String, Uuid)> = sqlx::query_as(&format!(
            r#"
            SELECT kind, id FROM (
                SELECT 'booking'::text AS kind, id, service_end FROM bookings
                WHERE payment_status = 'PAID'
                  AND transfer_status = 'PENDING'
                  AND refund_status <> 'FULL'
                  AND refund_reserved_minor = 0
                  AND service_end <= $1
                  AND (transfer_retry_at IS NULL OR transfer_retry_at <= $1)
                  AND {}
                UNION ALL
                SELECT 'installment'::text AS kind, i.id, i.service_end FROM package_installments i
                JOIN packages p ON p.id = i.package_id
                WHERE i.transfer_status = 'PENDING'
                  AND i.service_end <= $1
                  AND (i.transfer_retry_at IS NULL OR i.transfer_retry_at <= $1)
                  AND p.payment_status = 'PAID'
                  AND p.status = 'ACTIVE'
                  AND p.refund_status <> 'FULL'
                  AND p.refund_reserved_minor = 0
                  AND p.{}
            ) candidates
            ORDER BY service_end, id
            LIMIT $2
            "#,
            DESTINATION_CONFIGURED, DESTINATION_CONFIGURED
        ))
        .bind(now)
        .bind(limit)
        .bind(UNCONFIGURED_PAYOUT_DESTINATION)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(rows
            .into_iter()
            .map(|(kind, id)| match kind.as_str() {
                "installment" => SettlementTarget::Installment(id),
                _ => SettlementTarget::Booking(id),
            })
            .collect())
    }

    async fn claim_transfer(&self, target: SettlementTarget, now: DateTime<Utc>) -> LedgerResult<bool> {
        match target {
            SettlementTarget::Booking(id) => {
                let result = sqlx::query(
                    r#"
                    UPDATE bookings
                    SET transfer_status = 'IN_PROGRESS', updated_at = NOW()
                    WHERE id = $1
                      AND transfer_status = 'PENDING'
                      AND payment_status = 'PAID'
                      AND refund_status <> 'FULL'
                      AND refund_reserved_minor = 0
                      AND service_end <= $2
                    "#,
                )
                .bind(id)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(storage)?;

                Ok(result.rows_affected() == 1)
            }
            SettlementTarget::Installment(id) => self.claim_installment(id, now).await,
        }
    }

    async fn complete_transfer(&self, target: SettlementTarget, receipt: &TransferReceipt) -> LedgerResult<()> {
        match target {
            SettlementTarget::Booking(id) => {
                let result = sqlx::query(
                    r#"
                    UPDATE bookings
                    SET transfer_status = 'TRANSFERRED',
                        transfer_reference = $2,
                        transferred_minor = $3,
                        transferred_at = $4,
                        transfer_retry_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1 AND transfer_status = 'IN_PROGRESS'
                    "#,
                )
                .bind(id)
                .bind(&receipt.transfer_reference)
                .bind(receipt.amount_minor)
                .bind(receipt.transferred_at)
                .execute(&self.pool)
                .await
                .map_err(storage)?;

                if result.rows_affected() != 1 {
                    return Err(LedgerError::GuardViolated {
                        id,
                        detail: "booking transfer is not IN_PROGRESS".to_string(),
                    });
                }
                Ok(())
            }
            SettlementTarget::Installment(id) => self.complete_installment(id, receipt).await,
        }
    }

    async fn release_transfer(&self, target: SettlementTarget) -> LedgerResult<()> {
        let query = match target {
            SettlementTarget::Booking(_) => {
                "UPDATE bookings SET transfer_status = 'PENDING', updated_at = NOW() WHERE id = $1 AND transfer_status = 'IN_PROGRESS'"
            }
            SettlementTarget::Installment(_) => {
                "UPDATE package_installments SET transfer_status = 'PENDING' WHERE id = $1 AND transfer_status = 'IN_PROGRESS'"
            }
        };

        let result = sqlx::query(query)
            .bind(target.id())
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::GuardViolated {
                id: target.id(),
                detail: "transfer is not IN_PROGRESS".to_string(),
            });
        }
        Ok(())
    }

    async fn defer_transfer(&self, target: SettlementTarget, until: DateTime<Utc>) -> LedgerResult<()> {
        let query = match target {
            SettlementTarget::Booking(_) => {
                "UPDATE bookings SET transfer_retry_at = $2, updated_at = NOW() WHERE id = $1 AND transfer_status = 'PENDING'"
            }
            SettlementTarget::Installment(_) => {
                "UPDATE package_installments SET transfer_retry_at = $2 WHERE id = $1 AND transfer_status = 'PENDING'"
            }
        };

        sqlx::query(query)
            .bind(target.id())
            .bind(until)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn reserve_booking_refund(
        &self,
        id: Uuid,
        amount_minor: i64,
        cancel_pending_transfer: bool,
    ) -> LedgerResult<Option<BookingRefundReservation>> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let previous: Option<String> = sqlx::query_scalar("SELECT transfer_status FROM bookings WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;

        let Some(previous) = previous else {
            return Err(LedgerError::NotFound { kind: "booking", id });
        };

        let row = sqlx::query_as::<_, BookingRow>(&format!(
            r#"
            UPDATE bookings
            SET refund_reserved_minor = refund_reserved_minor + $2,
                transfer_status = CASE WHEN $3 AND transfer_status = 'PENDING' THEN 'CANCELLED' ELSE transfer_status END,
                updated_at = NOW()
            WHERE id = $1
              AND payment_status = 'PAID'
              AND payment_reference IS NOT NULL
              AND transfer_status <> 'IN_PROGRESS'
              AND $2 > 0
              AND refunded_minor + refund_reserved_minor + $2 <= gross_minor
            RETURNING {}
            "#,
            BOOKING_COLUMNS
        ))
        .bind(id)
        .bind(amount_minor)
        .bind(cancel_pending_transfer)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        row.map(|row| {
            let booking = Booking::try_from(row)?;
            let cancelled_transfer = previous == "PENDING"
                && booking.transfer_status == rally_core::TransferStatus::Cancelled;
            Ok(BookingRefundReservation { booking, cancelled_transfer })
        })
        .transpose()
    }

    async fn commit_booking_refund(&self, id: Uuid, amount_minor: i64, refund_reference: &str) -> LedgerResult<Booking> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            r#"
            UPDATE bookings
            SET refunded_minor = refunded_minor + $2,
                refund_reserved_minor = refund_reserved_minor - $2,
                refund_references = array_append(refund_references, $3),
                refund_status = CASE
                    WHEN refunded_minor + $2 >= gross_minor THEN 'FULL'
                    WHEN refunded_minor + $2 > 0 THEN 'PARTIAL'
                    ELSE 'NONE'
                END,
                updated_at = NOW()
            WHERE id = $1 AND refund_reserved_minor >= $2
            RETURNING {}
            "#,
            BOOKING_COLUMNS
        ))
        .bind(id)
        .bind(amount_minor)
        .bind(refund_reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let row = row.ok_or_else(|| LedgerError::GuardViolated {
            id,
            detail: format!("no refund reservation of {} to commit", amount_minor),
        })?;
        Booking::try_from(row)
    }

    async fn release_booking_refund(&self, id: Uuid, amount_minor: i64, restore_transfer: bool) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET refund_reserved_minor = refund_reserved_minor - $2,
                transfer_status = CASE WHEN $3 AND transfer_status = 'CANCELLED' THEN 'PENDING' ELSE transfer_status END,
                updated_at = NOW()
            WHERE id = $1 AND refund_reserved_minor >= $2
            "#,
        )
        .bind(id)
        .bind(amount_minor)
        .bind(restore_transfer)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::GuardViolated {
                id,
                detail: format!("no refund reservation of {} to release", amount_minor),
            });
        }
        Ok(())
    }

    async fn reserve_package_refund(
        &self,
        id: Uuid,
        amount_minor: i64,
        expected_sessions_completed: i32,
    ) -> LedgerResult<Option<PackageRefundReservation>> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let Some(row) = Self::lock_package(&mut tx, id).await? else {
            return Err(LedgerError::NotFound { kind: "package", id });
        };

        let in_flight: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM package_installments WHERE package_id = $1 AND transfer_status = 'IN_PROGRESS'",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        let reservable = row.payment_status == "PAID"
            && row.status == "ACTIVE"
            && row.payment_reference.is_some()
            && row.sessions_completed == expected_sessions_completed
            && in_flight == 0
            && amount_minor > 0
            && row.refunded_minor + row.refund_reserved_minor + amount_minor <= row.gross_minor;

        if !reservable {
            tx.rollback().await.map_err(storage)?;
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE packages
            SET refund_reserved_minor = refund_reserved_minor + $2,
                status = 'CANCELLED',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(amount_minor)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        let cancelled_installments: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE package_installments
            SET transfer_status = 'CANCELLED'
            WHERE package_id = $1 AND transfer_status = 'PENDING'
            RETURNING id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        let package = Self::package_in_tx(&mut tx, id).await?;
        tx.commit().await.map_err(storage)?;

        Ok(Some(PackageRefundReservation { package, cancelled_installments }))
    }

    async fn commit_package_refund(&self, id: Uuid, amount_minor: i64, refund_reference: &str) -> LedgerResult<Package> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let result = sqlx::query(
            r#"
            UPDATE packages
            SET refunded_minor = refunded_minor + $2,
                refund_reserved_minor = refund_reserved_minor - $2,
                refund_references = array_append(refund_references, $3),
                refund_status = CASE
                    WHEN refunded_minor + $2 >= gross_minor THEN 'FULL'
                    WHEN refunded_minor + $2 > 0 THEN 'PARTIAL'
                    ELSE 'NONE'
                END,
                updated_at = NOW()
            WHERE id = $1 AND refund_reserved_minor >= $2
            "#,
        )
        .bind(id)
        .bind(amount_minor)
        .bind(refund_reference)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::GuardViolated {
                id,
                detail: format!("no package refund reservation of {} to commit", amount_minor),
            });
        }

        let package = Self::package_in_tx(&mut tx, id).await?;
        tx.commit().await.map_err(storage)?;
        Ok(package)
    }

    async fn release_package_refund(&self, id: Uuid, amount_minor: i64, restore_installments: &[Uuid]) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let result = sqlx::query(
            r#"
            UPDATE packages
            SET refund_reserved_minor = refund_reserved_minor - $2,
                status = 'ACTIVE',
                updated_at = NOW()
            WHERE id = $1 AND refund_reserved_minor >= $2
            "#,
        )
        .bind(id)
        .bind(amount_minor)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::GuardViolated {
                id,
                detail: format!("no package refund reservation of {} to release", amount_minor),
            });
        }

        sqlx::query(
            r#"
            UPDATE package_installments
            SET transfer_status = 'PENDING'
            WHERE package_id = $1 AND id = ANY($2) AND transfer_status = 'CANCELLED'
            "#,
        )
        .bind(id)
        .bind(restore_installments)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)
    }

    async fn webhook_event_seen(&self, event_id: &str) -> LedgerResult<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM webhook_events WHERE event_id = $1)")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)
    }

    async fn record_webhook_event(&self, event_id: &str, event_type: &str, received_at: DateTime<Utc>) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO webhook_events (event_id, event_type, received_at) VALUES ($1, $2, $3) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(event_type)
        .bind(received_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }
}
