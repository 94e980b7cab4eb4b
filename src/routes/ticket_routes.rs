// src/routes/ticket_routes.rs

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{ApiOk, AppState, TicketDto, TicketStatus},
    queue::coordinator::{IssueTicket, TransferRequest},
    queue::repository::TicketFilter,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tickets", post(issue_ticket).get(list_tickets))
        .route("/tickets/{ticket_id}", get(get_ticket))
        .route("/tickets/{ticket_id}/call", post(call_ticket))
        .route("/tickets/{ticket_id}/complete", post(complete_ticket))
        .route("/tickets/{ticket_id}/skip", post(skip_ticket))
        .route("/tickets/{ticket_id}/hold", post(hold_ticket))
        .route("/tickets/{ticket_id}/return", post(return_ticket))
        .route("/tickets/{ticket_id}/cancel", post(cancel_ticket))
        .route("/tickets/{ticket_id}/transfer", post(transfer_ticket))
}

/* ============================================================
   DTOs
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct ListTicketsQuery {
    pub status: Option<String>,
    pub service_point_id: Option<Uuid>,
    /// Defaults to today's queue.
    pub queue_date: Option<chrono::NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallTicketReq {
    pub service_point_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct HoldTicketReq {
    pub service_point_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelTicketReq {
    pub reason: Option<String>,
}

type TicketResult = Result<Json<ApiOk<TicketDto>>, ApiError>;

fn ok(ticket: crate::models::Ticket) -> TicketResult {
    Ok(Json(ApiOk {
        data: TicketDto::from(ticket),
    }))
}

/* ============================================================
   handlers
   ============================================================ */

pub async fn issue_ticket(
    State(state): State<AppState>,
    Json(req): Json<IssueTicket>,
) -> TicketResult {
    ok(state.queue.issue_ticket(req).await?)
}

pub async fn list_tickets(
    State(state): State<AppState>,
    Query(q): Query<ListTicketsQuery>,
) -> Result<Json<ApiOk<Vec<TicketDto>>>, ApiError> {
    let status = match q.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Some(
            s.parse::<TicketStatus>()
                .map_err(|e| ApiError::BadRequest("VALIDATION_ERROR", e))?,
        ),
        None => None,
    };

    let filter = TicketFilter {
        queue_date: Some(q.queue_date.unwrap_or_else(|| state.queue.today())),
        status,
        service_point_id: q.service_point_id,
    };
    let tickets = state.queue.list_tickets(filter).await?;

    Ok(Json(ApiOk {
        data: tickets.into_iter().map(TicketDto::from).collect(),
    }))
}

pub async fn get_ticket(State(state): State<AppState>, Path(ticket_id): Path<Uuid>) -> TicketResult {
    ok(state.queue.get_ticket(ticket_id).await?)
}

pub async fn call_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    body: Option<Json<CallTicketReq>>,
) -> TicketResult {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    ok(state.queue.call_ticket(ticket_id, req.service_point_id).await?)
}

pub async fn complete_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
) -> TicketResult {
    ok(state.queue.complete_ticket(ticket_id).await?)
}

pub async fn skip_ticket(State(state): State<AppState>, Path(ticket_id): Path<Uuid>) -> TicketResult {
    ok(state.queue.skip_ticket(ticket_id).await?)
}

pub async fn hold_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<HoldTicketReq>,
) -> TicketResult {
    ok(state
        .queue
        .hold_ticket(ticket_id, req.service_point_id, req.reason)
        .await?)
}

pub async fn return_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
) -> TicketResult {
    ok(state.queue.return_skipped_to_waiting(ticket_id).await?)
}

pub async fn cancel_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    body: Option<Json<CancelTicketReq>>,
) -> TicketResult {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    ok(state.queue.cancel_ticket(ticket_id, req.reason).await?)
}

/// Returns the WAITING continuation at the target service point.
pub async fn transfer_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<TransferRequest>,
) -> TicketResult {
    ok(state.queue.transfer_ticket(ticket_id, req).await?)
}
