//! HTTP RPC adapter.
//!
//! Thin axum layer over the node façade. Verification failures map to
//! 422, malformed input to 400, unknown entities to 404, store faults
//! to 500.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::chain::Vote;
use crate::types::{Block, BlockHash, Transaction};
use crate::ChainError;

use super::{Node, NodeError, Stats};

/// Start serving until the shutdown signal flips.
pub async fn serve(
    node: Arc<Node>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), NodeError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| NodeError::Io(format!("bind {addr}: {e}")))?;
    info!("RPC listening on {addr}");

    axum::serve(listener, router(node))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| NodeError::Io(e.to_string()))
}

/// The RPC route table.
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/transaction", post(submit_transaction))
        .route("/transactions", post(submit_transaction_batch))
        .route("/block/latest", get(get_last_block))
        .route("/block/{id}", get(get_block))
        .route("/transaction/{id}", get(get_transaction))
        .route("/balance/{address}", get(get_balance))
        .route("/stats", get(get_stats))
        .route("/pending", get(get_pending))
        .route("/peers", get(get_peers))
        .route("/vote", post(submit_vote))
        .with_state(node)
}

/// A failed RPC call: status code plus a short reason string.
pub struct RpcError {
    status: StatusCode,
    message: String,
}

impl RpcError {
    fn not_found(what: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: what.into(),
        }
    }

    fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: reason.into(),
        }
    }
}

impl From<ChainError> for RpcError {
    fn from(err: ChainError) -> Self {
        let status = match &err {
            ChainError::Address(_) => StatusCode::BAD_REQUEST,
            ChainError::Transaction(_)
            | ChainError::Block(_)
            | ChainError::Pool(_)
            | ChainError::Staking(_)
            | ChainError::Consensus(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ChainError::Storage(_) | ChainError::Crypto(_) | ChainError::Node(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

// --- response DTOs ---

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchStatusResponse {
    pub status: String,
    pub results: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutputResponse {
    pub index: u32,
    pub owner: String,
    pub amount: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub id: String,
    pub sender: String,
    pub timestamp: i64,
    pub inputs: Vec<String>,
    pub outputs: Vec<OutputResponse>,
    pub signature: String,
    pub previous_tx_ids: Vec<String>,
}

impl From<&Transaction> for TransactionResponse {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id.clone(),
            sender: tx.sender.to_string(),
            timestamp: tx.timestamp,
            inputs: tx.inputs.iter().map(|i| i.to_string()).collect(),
            outputs: tx
                .outputs
                .iter()
                .map(|o| OutputResponse {
                    index: o.index,
                    owner: o.owner.to_string(),
                    amount: o.amount,
                })
                .collect(),
            signature: hex::encode(&tx.signature),
            previous_tx_ids: tx.previous_tx_ids.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockResponse {
    pub index: u64,
    pub timestamp: i64,
    pub hash: String,
    pub prev_hash: String,
    pub validator: String,
    pub transaction_count: usize,
    pub transactions: Vec<TransactionResponse>,
}

impl From<&Block> for BlockResponse {
    fn from(block: &Block) -> Self {
        Self {
            index: block.index,
            timestamp: block.timestamp,
            hash: block.hash.to_hex(),
            prev_hash: block.prev_hash.to_hex(),
            validator: block.validator.to_string(),
            transaction_count: block.transactions.len(),
            transactions: block.transactions.iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub address: String,
    pub balance: i64,
}

// --- handlers ---

async fn submit_transaction(
    State(node): State<Arc<Node>>,
    Json(tx): Json<Transaction>,
) -> Result<Json<StatusResponse>, RpcError> {
    node.submit_transaction(tx)?;
    Ok(Json(StatusResponse {
        status: "Transaction submitted successfully".into(),
    }))
}

async fn submit_transaction_batch(
    State(node): State<Arc<Node>>,
    Json(txs): Json<Vec<Transaction>>,
) -> Result<Json<BatchStatusResponse>, RpcError> {
    if txs.is_empty() {
        return Err(RpcError::bad_request("empty batch"));
    }
    let results = node.submit_transaction_batch(txs);
    let accepted = results.values().filter(|v| *v == "accepted").count();
    Ok(Json(BatchStatusResponse {
        status: format!("{accepted}/{} transactions accepted", results.len()),
        results,
    }))
}

async fn get_block(
    State(node): State<Arc<Node>>,
    Path(id): Path<String>,
) -> Result<Json<BlockResponse>, RpcError> {
    let block = if let Ok(index) = id.parse::<u64>() {
        node.block_by_index(index)
    } else {
        let hash = BlockHash::from_hex(&id)
            .map_err(|_| RpcError::bad_request(format!("not a block index or hash: {id}")))?;
        node.block_by_hash(&hash)
    };
    block
        .map(|b| Json(BlockResponse::from(&b)))
        .ok_or_else(|| RpcError::not_found(format!("block {id}")))
}

async fn get_last_block(State(node): State<Arc<Node>>) -> Json<BlockResponse> {
    Json(BlockResponse::from(&node.last_block()))
}

async fn get_transaction(
    State(node): State<Arc<Node>>,
    Path(id): Path<String>,
) -> Result<Json<TransactionResponse>, RpcError> {
    node.transaction(&id)?
        .map(|tx| Json(TransactionResponse::from(&tx)))
        .ok_or_else(|| RpcError::not_found(format!("transaction {id}")))
}

async fn get_balance(
    State(node): State<Arc<Node>>,
    Path(address): Path<String>,
) -> Result<Json<BalanceResponse>, RpcError> {
    let address = crate::types::Address::parse(&address)
        .map_err(|e| RpcError::bad_request(e.to_string()))?;
    let balance = node.balance(&address)?;
    Ok(Json(BalanceResponse {
        address: address.to_string(),
        balance,
    }))
}

async fn get_stats(State(node): State<Arc<Node>>) -> Json<Stats> {
    Json(node.stats())
}

async fn get_pending(State(node): State<Arc<Node>>) -> Json<Vec<TransactionResponse>> {
    Json(node.pending().iter().map(Into::into).collect())
}

async fn get_peers(State(node): State<Arc<Node>>) -> Json<Vec<String>> {
    Json(node.peers().to_vec())
}

async fn submit_vote(
    State(node): State<Arc<Node>>,
    Json(vote): Json<Vote>,
) -> Result<Json<StatusResponse>, RpcError> {
    node.submit_vote(vote);
    Ok(Json(StatusResponse {
        status: "Vote recorded".into(),
    }))
}
