//! HTTP surface of [`ExplorerApi`].
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use super::{
    ApiError, BlockParams, ErrorBody, ExplorerApi, PageParams, SearchParams, SearchResult,
    TransactionParams,
};
use crate::types::{Block, Channel, Transaction};

type ApiState = State<Arc<ExplorerApi>>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody::from(&self))).into_response()
    }
}

async fn channels(State(api): ApiState) -> Result<Json<Vec<Channel>>, ApiError> {
    api.get_channels().await.map(Json)
}

async fn blocks(
    State(api): ApiState,
    Query(params): Query<BlockParams>,
) -> Result<Json<Vec<Block>>, ApiError> {
    api.get_blocks(&params).await.map(Json)
}

async fn block(State(api): ApiState, Path(id): Path<String>) -> Result<Json<Block>, ApiError> {
    api.get_block_by_id(&id).await.map(Json)
}

async fn block_transactions(
    State(api): ApiState,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    api.get_block_transactions(&id, &params).await.map(Json)
}

async fn transactions(
    State(api): ApiState,
    Query(params): Query<TransactionParams>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    api.get_transactions(&params).await.map(Json)
}

async fn transaction(
    State(api): ApiState,
    Path(id): Path<String>,
) -> Result<Json<Transaction>, ApiError> {
    api.get_transaction_by_id(&id).await.map(Json)
}

async fn search(
    State(api): ApiState,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResult>, ApiError> {
    api.search(params.q.as_deref()).await.map(Json)
}

/// Routes of the query surface.
pub fn router(api: Arc<ExplorerApi>) -> Router {
    Router::new()
        .route("/channels", get(channels))
        .route("/blocks", get(blocks))
        .route("/blocks/recent", get(blocks))
        .route("/blocks/{id}", get(block))
        .route("/blocks/{id}/transactions", get(block_transactions))
        .route("/transactions", get(transactions))
        .route("/transactions/recent", get(transactions))
        .route("/transactions/{id}", get(transaction))
        .route("/search", get(search))
        .with_state(api)
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_listener<F>(
    listener: TcpListener,
    api: Arc<ExplorerApi>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "running explorer api");
    axum::serve(listener, router(api))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Bind `bind_address` and serve until `shutdown` resolves.
pub async fn serve<F>(bind_address: &str, api: Arc<ExplorerApi>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = bind_address.parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, api, shutdown).await
}
