// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! HTTP surface for the ledger engine.
//!
//! ## Endpoints
//!
//! - `POST /transactions` - Process a money-movement operation
//! - `GET  /transactions/{id}` - Read back a transaction projection
//! - `POST /accounts` - Provision an account
//! - `GET  /accounts/{id}` - Get an account by id or external identity
//!
//! A newly created transaction answers 201; an idempotent replay of an
//! existing reference answers 200 with the same `transaction_id`.
//! Insufficient funds is not a 4xx: the transaction is persisted as
//! Failed and returned with `status="failed"`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use ledger_engine::{
    AccountResponse, Amount, CancelToken, Engine, EventBus, EventWorker, LedgerError, MemoryStore,
    OpenAccountRequest, TransactionId, TransactionRequest, TransactionResponse,
};
use serde::Serialize;
use std::process;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Ledger engine HTTP server.
#[derive(Parser, Debug)]
#[command(name = "ledger-engine")]
#[command(about = "A concurrent financial ledger service", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: String,

    /// Capacity of the outbound event queue
    #[arg(long, default_value_t = 1024)]
    event_capacity: usize,
}

// === Application State ===

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

// === Error Handling ===

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

/// Wrapper converting `LedgerError` into HTTP responses.
struct AppError(LedgerError);

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = if self.0.is_validation() {
            (StatusCode::BAD_REQUEST, "VALIDATION")
        } else if self.0.is_not_found() {
            (StatusCode::NOT_FOUND, "NOT_FOUND")
        } else {
            match self.0 {
                LedgerError::ConcurrencyConflict | LedgerError::DuplicateReference(_) => {
                    (StatusCode::CONFLICT, "CONFLICT")
                }
                LedgerError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

fn not_found(what: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("{what} not found"),
            code: "NOT_FOUND".to_string(),
        }),
    )
}

// === Handlers ===

/// POST /transactions - Process a money-movement operation.
async fn create_transaction(
    State(state): State<AppState>,
    Json(request): Json<TransactionRequest>,
) -> Result<(StatusCode, Json<TransactionResponse>), AppError> {
    let cancel = CancelToken::new();
    let outcome = state.engine.process(&request, &cancel)?;
    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome.response)))
}

/// GET /transactions/{id} - Read back a transaction projection.
async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TransactionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let id = TransactionId::parse(&id).map_err(|_| not_found("transaction"))?;
    state
        .engine
        .transaction_response(&id)
        .map(Json)
        .ok_or_else(|| not_found("transaction"))
}

/// POST /accounts - Provision an account.
async fn open_account(
    State(state): State<AppState>,
    Json(request): Json<OpenAccountRequest>,
) -> (StatusCode, Json<AccountResponse>) {
    let account = state.engine.open_account(
        request.external_id,
        Amount::from_minor(request.credit_limit),
    );
    (StatusCode::CREATED, Json(AccountResponse::from(&account)))
}

/// GET /accounts/{id} - Get an account by id or external identity.
async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AccountResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .engine
        .find_account(&id)
        .map(|account| Json(AccountResponse::from(&account)))
        .ok_or_else(|| not_found("account"))
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/transactions", post(create_transaction))
        .route("/transactions/{id}", get(get_transaction))
        .route("/accounts", post(open_account))
        .route("/accounts/{id}", get(get_account))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let store = Arc::new(MemoryStore::new());
    let (bus, receiver) = EventBus::bounded(args.event_capacity);
    let engine = Arc::new(Engine::new(store, bus));

    let worker = EventWorker::spawn(receiver, |event| {
        info!(
            event_id = %event.event_id,
            transaction_id = %event.transaction_id,
            reference_id = %event.reference_id,
            operation = ?event.operation,
            status = ?event.status,
            "transaction event"
        );
        Ok(())
    });

    let app = create_router(AppState {
        engine: engine.clone(),
    });

    let listener = match TcpListener::bind(&args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Error binding to {}: {}", args.listen, e);
            process::exit(1);
        }
    };
    info!(listen = %args.listen, "ledger engine listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    });
    if let Err(e) = serve.await {
        eprintln!("Server error: {}", e);
        process::exit(1);
    }

    let processed = worker.shutdown();
    info!(processed, dropped = engine.dropped_events(), "shutdown complete");
}
