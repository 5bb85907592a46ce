use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::domain::Transaction;
use crate::error::AppError;
use crate::gateway::models::{
    Charge, CreateTokenRequest, Customer, GatewayTransaction, ListPage, Pagination, Token,
};
use crate::AppState;

const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl PageParams {
    fn pagination(&self) -> Pagination {
        let defaults = Pagination::default();
        Pagination {
            limit: self.limit.unwrap_or(defaults.limit).clamp(1, MAX_PAGE_LIMIT),
            offset: self.offset.unwrap_or(defaults.offset),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AttachCardBody {
    pub customer_id: String,
    pub token: String,
}

pub async fn create_token(
    State(state): State<AppState>,
    Json(request): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<Token>), AppError> {
    let token = state.query.create_token(&request).await?;
    Ok((StatusCode::CREATED, Json(token)))
}

pub async fn list_customers(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<ListPage<Customer>>, AppError> {
    Ok(Json(state.query.list_customers(params.pagination()).await?))
}

pub async fn get_customer(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
) -> Result<Json<Customer>, AppError> {
    Ok(Json(state.query.get_customer(&customer_id).await?))
}

pub async fn attach_card(
    State(state): State<AppState>,
    Json(body): Json<AttachCardBody>,
) -> Result<Json<Customer>, AppError> {
    Ok(Json(state.query.attach_card(&body.customer_id, &body.token).await?))
}

pub async fn list_charges(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<ListPage<Charge>>, AppError> {
    Ok(Json(state.query.list_charges(params.pagination()).await?))
}

pub async fn get_charge(
    State(state): State<AppState>,
    Path(charge_id): Path<String>,
) -> Result<Json<Charge>, AppError> {
    Ok(Json(state.query.retrieve_charge(&charge_id).await?))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<GatewayTransaction>, AppError> {
    Ok(Json(state.query.retrieve_transaction(&transaction_id).await?))
}

pub async fn get_ledger_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Transaction>, AppError> {
    Ok(Json(state.query.ledger_transaction(&id).await?))
}
