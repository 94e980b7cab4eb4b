// src/routes/service_point_routes.rs

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, patch, post, put},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, QueueError},
    models::{ApiOk, AppState, ServicePoint, TicketDto, TicketType},
    queue::repository::ServicePointPatch,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/service_points", get(list_service_points).post(create_service_point))
        .route("/service_points/{service_point_id}", patch(patch_service_point))
        .route(
            "/service_points/{service_point_id}/capabilities",
            put(put_capabilities),
        )
        .route("/service_points/{service_point_id}/call_next", post(call_next))
}

/* ============================================================
   DTOs
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct ServicePointDto {
    #[serde(flatten)]
    pub service_point: ServicePoint,
    pub ticket_types: Vec<TicketType>,
}

#[derive(Debug, Deserialize)]
pub struct CreateServicePointReq {
    pub code: String,
    pub name: String,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CapabilitiesReq {
    pub ticket_types: Vec<TicketType>,
}

#[derive(Debug, Serialize)]
pub struct CallNextData {
    /// `null` when nothing is waiting for this point.
    pub ticket: Option<TicketDto>,
}

fn required(field: &str, value: &str) -> Result<String, ApiError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            format!("{field} is required"),
        ));
    }
    Ok(v.to_string())
}

/* ============================================================
   handlers
   ============================================================ */

pub async fn list_service_points(
    State(state): State<AppState>,
) -> Result<Json<ApiOk<Vec<ServicePointDto>>>, ApiError> {
    // Straight from the repository: this is the admin view, not the cached one.
    let points = state.service_points.list_service_points().await?;
    let caps = state.service_points.list_capabilities().await?;

    let mut data: Vec<ServicePointDto> = points
        .into_iter()
        .map(|sp| {
            let mut ticket_types: Vec<TicketType> = caps
                .iter()
                .filter(|c| c.service_point_id == sp.service_point_id)
                .map(|c| c.ticket_type)
                .collect();
            ticket_types.sort();
            ServicePointDto {
                service_point: sp,
                ticket_types,
            }
        })
        .collect();
    data.sort_by(|a, b| a.service_point.code.cmp(&b.service_point.code));

    Ok(Json(ApiOk { data }))
}

pub async fn create_service_point(
    State(state): State<AppState>,
    Json(req): Json<CreateServicePointReq>,
) -> Result<Json<ApiOk<ServicePoint>>, ApiError> {
    let code = required("code", &req.code)?;
    let name = required("name", &req.name)?;

    let sp = state
        .service_points
        .create_service_point(&code, &name, req.enabled.unwrap_or(true))
        .await?;
    state.queue.registry().invalidate().await;

    tracing::info!(service_point_id = %sp.service_point_id, code = %sp.code, "service point created");
    Ok(Json(ApiOk { data: sp }))
}

pub async fn patch_service_point(
    State(state): State<AppState>,
    Path(service_point_id): Path<Uuid>,
    Json(mut req): Json<ServicePointPatch>,
) -> Result<Json<ApiOk<ServicePoint>>, ApiError> {
    if let Some(code) = req.code.as_deref() {
        req.code = Some(required("code", code)?);
    }
    if let Some(name) = req.name.as_deref() {
        req.name = Some(required("name", name)?);
    }

    let sp = state
        .service_points
        .update_service_point(service_point_id, req)
        .await?
        .ok_or_else(|| QueueError::service_point_not_found(service_point_id))?;
    state.queue.registry().invalidate().await;

    tracing::info!(%service_point_id, enabled = sp.enabled, "service point updated");
    Ok(Json(ApiOk { data: sp }))
}

pub async fn put_capabilities(
    State(state): State<AppState>,
    Path(service_point_id): Path<Uuid>,
    Json(req): Json<CapabilitiesReq>,
) -> Result<Json<ApiOk<Vec<TicketType>>>, ApiError> {
    let snapshot = state.queue.registry().refresh().await?;
    if snapshot.get(service_point_id).is_none() {
        return Err(QueueError::service_point_not_found(service_point_id).into());
    }

    let mut types = req.ticket_types;
    types.sort();
    types.dedup();

    state
        .service_points
        .set_capabilities(service_point_id, &types)
        .await?;
    state.queue.registry().invalidate().await;

    Ok(Json(ApiOk { data: types }))
}

pub async fn call_next(
    State(state): State<AppState>,
    Path(service_point_id): Path<Uuid>,
) -> Result<Json<ApiOk<CallNextData>>, ApiError> {
    let ticket = state.queue.call_next(service_point_id).await?;
    Ok(Json(ApiOk {
        data: CallNextData {
            ticket: ticket.map(TicketDto::from),
        },
    }))
}
