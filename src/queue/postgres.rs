//! PostgreSQL implementation of the queue repositories.

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{Capability, ServicePoint, Ticket, TicketStatus, TicketType};
use crate::queue::repository::{
    NewTicket, ServicePointPatch, ServicePointRepository, SettingsRepository, TicketFilter,
    TicketRepository,
};

const TICKET_COLUMNS: &str = r#"
    ticket_id,
    number,
    ticket_type,
    status,
    queue_date,
    service_point_id,
    patient_name,
    phone_number,
    line_user_id,
    notes,
    transferred_from,
    created_at,
    called_at,
    completed_at,
    skipped_at,
    cancelled_at,
    paused_at,
    transferred_at,
    updated_at
"#;

#[derive(Clone)]
pub struct PgQueueRepository {
    pool: PgPool,
}

impl PgQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_codes(expected: &[TicketStatus]) -> Vec<i16> {
    expected.iter().map(|s| *s as i16).collect()
}

async fn insert_ticket_on(
    conn: &mut PgConnection,
    new: &NewTicket,
    start_number: i32,
) -> Result<Ticket, QueueError> {
    let number = match new.number {
        Some(n) => n,
        None => {
            // Serialize numbering per (type, day); released at commit.
            let lock_key = format!("queue_ticket:{}:{}", new.ticket_type as i16, new.queue_date);
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(&lock_key)
                .execute(&mut *conn)
                .await?;

            sqlx::query_scalar::<_, i32>(
                r#"
                SELECT COALESCE(MAX(number) + 1, $3)
                FROM queue_ticket
                WHERE ticket_type = $1
                  AND queue_date = $2
                  AND transferred_from IS NULL
                "#,
            )
            .bind(new.ticket_type)
            .bind(new.queue_date)
            .bind(start_number)
            .fetch_one(&mut *conn)
            .await?
        }
    };

    let sql = format!(
        r#"
        INSERT INTO queue_ticket (
          number,
          ticket_type,
          status,
          queue_date,
          service_point_id,
          patient_name,
          phone_number,
          line_user_id,
          notes,
          transferred_from
        )
        VALUES ($1,$2,0,$3,$4,$5,$6,$7,$8,$9)
        RETURNING {TICKET_COLUMNS}
        "#
    );

    let ticket = sqlx::query_as::<_, Ticket>(&sql)
        .bind(number)
        .bind(new.ticket_type)
        .bind(new.queue_date)
        .bind(new.service_point_id)
        .bind(new.patient_name.as_deref())
        .bind(new.phone_number.as_deref())
        .bind(new.line_user_id.as_deref())
        .bind(new.notes.as_deref())
        .bind(new.transferred_from)
        .fetch_one(&mut *conn)
        .await?;

    Ok(ticket)
}

async fn update_ticket_on(
    conn: &mut PgConnection,
    ticket: &Ticket,
    expected: &[TicketStatus],
) -> Result<Option<Ticket>, QueueError> {
    let sql = format!(
        r#"
        UPDATE queue_ticket
        SET
          status           = $2,
          ticket_type      = $3,
          service_point_id = $4,
          notes            = $5,
          called_at        = $6,
          completed_at     = $7,
          skipped_at       = $8,
          cancelled_at     = $9,
          paused_at        = $10,
          transferred_at   = $11,
          updated_at       = now()
        WHERE ticket_id = $1
          AND status = ANY($12)
        RETURNING {TICKET_COLUMNS}
        "#
    );

    let row = sqlx::query_as::<_, Ticket>(&sql)
        .bind(ticket.ticket_id)
        .bind(ticket.status)
        .bind(ticket.ticket_type)
        .bind(ticket.service_point_id)
        .bind(ticket.notes.as_deref())
        .bind(ticket.called_at)
        .bind(ticket.completed_at)
        .bind(ticket.skipped_at)
        .bind(ticket.cancelled_at)
        .bind(ticket.paused_at)
        .bind(ticket.transferred_at)
        .bind(status_codes(expected))
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row)
}

#[async_trait]
impl TicketRepository for PgQueueRepository {
    async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, QueueError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {TICKET_COLUMNS} FROM queue_ticket WHERE TRUE"));

        if let Some(d) = filter.queue_date {
            qb.push(" AND queue_date = ").push_bind(d);
        }
        if let Some(st) = filter.status {
            qb.push(" AND status = ").push_bind(st);
        }
        if let Some(sp) = filter.service_point_id {
            qb.push(" AND service_point_id = ").push_bind(sp);
        }
        qb.push(" ORDER BY created_at ASC, number ASC");

        let rows = qb.build_query_as::<Ticket>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn get_ticket(&self, ticket_id: Uuid) -> Result<Option<Ticket>, QueueError> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM queue_ticket WHERE ticket_id = $1");
        let row = sqlx::query_as::<_, Ticket>(&sql)
            .bind(ticket_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn insert_ticket(
        &self,
        new: NewTicket,
        start_number: i32,
    ) -> Result<Ticket, QueueError> {
        let mut tx = self.pool.begin().await?;
        let ticket = insert_ticket_on(&mut *tx, &new, start_number).await?;
        tx.commit().await?;
        Ok(ticket)
    }

    async fn update_ticket_if(
        &self,
        ticket: &Ticket,
        expected: &[TicketStatus],
    ) -> Result<Option<Ticket>, QueueError> {
        let mut conn = self.pool.acquire().await?;
        update_ticket_on(&mut *conn, ticket, expected).await
    }

    async fn transfer_ticket(
        &self,
        closed: &Ticket,
        expected: &[TicketStatus],
        continuation: NewTicket,
    ) -> Result<Option<(Ticket, Ticket)>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let Some(source) = update_ticket_on(&mut *tx, closed, expected).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let target = insert_ticket_on(&mut *tx, &continuation, 1).await?;

        tx.commit().await?;
        Ok(Some((source, target)))
    }
}

#[async_trait]
impl ServicePointRepository for PgQueueRepository {
    async fn list_service_points(&self) -> Result<Vec<ServicePoint>, QueueError> {
        let rows = sqlx::query_as::<_, ServicePoint>(
            r#"
            SELECT
              service_point_id,
              code,
              name,
              enabled,
              created_at,
              updated_at
            FROM service_point
            ORDER BY code ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_capabilities(&self) -> Result<Vec<Capability>, QueueError> {
        let rows = sqlx::query_as::<_, Capability>(
            r#"
            SELECT service_point_id, ticket_type
            FROM service_point_ticket_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn create_service_point(
        &self,
        code: &str,
        name: &str,
        enabled: bool,
    ) -> Result<ServicePoint, QueueError> {
        let row = sqlx::query_as::<_, ServicePoint>(
            r#"
            INSERT INTO service_point (code, name, enabled)
            VALUES ($1, $2, $3)
            RETURNING service_point_id, code, name, enabled, created_at, updated_at
            "#,
        )
        .bind(code)
        .bind(name)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return QueueError::Validation(format!(
                        "service point code '{code}' already exists"
                    ));
                }
            }
            QueueError::from(e)
        })?;
        Ok(row)
    }

    async fn update_service_point(
        &self,
        service_point_id: Uuid,
        patch: ServicePointPatch,
    ) -> Result<Option<ServicePoint>, QueueError> {
        let row = sqlx::query_as::<_, ServicePoint>(
            r#"
            UPDATE service_point
            SET
              code       = COALESCE($2, code),
              name       = COALESCE($3, name),
              enabled    = COALESCE($4, enabled),
              updated_at = now()
            WHERE service_point_id = $1
            RETURNING service_point_id, code, name, enabled, created_at, updated_at
            "#,
        )
        .bind(service_point_id)
        .bind(patch.code.as_deref())
        .bind(patch.name.as_deref())
        .bind(patch.enabled)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_capabilities(
        &self,
        service_point_id: Uuid,
        types: &[TicketType],
    ) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM service_point_ticket_type WHERE service_point_id = $1")
            .bind(service_point_id)
            .execute(&mut *tx)
            .await?;

        if !types.is_empty() {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO service_point_ticket_type (service_point_id, ticket_type) ",
            );
            qb.push_values(types, |mut b, ty| {
                b.push_bind(service_point_id).push_bind(*ty);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsRepository for PgQueueRepository {
    async fn get_setting(
        &self,
        category: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, QueueError> {
        let value: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT value
            FROM app_setting
            WHERE category = $1 AND key = $2
            "#,
        )
        .bind(category)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn put_setting(
        &self,
        category: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO app_setting (category, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (category, key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(category)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
