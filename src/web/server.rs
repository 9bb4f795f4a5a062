//! Axum HTTP server for the billing gateway.
//!
//! Handlers are thin: they parse the request, call into `crate::billing`, and
//! map `BillingError` onto a status code.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    middleware,
    routing::{get, post},
};
use tokio::sync::oneshot;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::billing::invoice::{self, InvoiceDetail, InvoicePreview};
use crate::config::BillingConfig;
use crate::db::{AgreementRecord, Database, InvoiceRecord, TimeEntryRecord};
use crate::error::{BillingError, ChannelError};
use crate::web::auth::{AuthState, auth_middleware};
use crate::web::types::*;

/// Shared state for all gateway handlers.
pub struct GatewayState {
    pub store: Arc<dyn Database>,
    pub billing: BillingConfig,
    /// Shutdown signal sender.
    pub shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
    /// Server startup time for uptime calculation.
    pub startup_time: std::time::Instant,
}

impl GatewayState {
    pub fn new(store: Arc<dyn Database>, billing: BillingConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            billing,
            shutdown_tx: tokio::sync::RwLock::new(None),
            startup_time: std::time::Instant::now(),
        })
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn billing_error(err: BillingError) -> (StatusCode, String) {
    let status = match &err {
        BillingError::Validation(_) => StatusCode::BAD_REQUEST,
        BillingError::NotFound(_) => StatusCode::NOT_FOUND,
        BillingError::Conflict(_) => StatusCode::CONFLICT,
        BillingError::Persistence(_) => {
            tracing::error!("Billing request failed: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal storage error".to_string(),
            );
        }
    };
    (status, err.to_string())
}

/// Build the API router. Everything except `/api/health` requires the bearer
/// token.
pub fn router(state: Arc<GatewayState>, auth_token: String) -> Router {
    let public = Router::new().route("/api/health", get(health_handler));

    let auth_state = AuthState { token: auth_token };
    let protected = Router::new()
        // Balances and invoices per client
        .route(
            "/api/clients/{client_id}/balances",
            get(balances_handler),
        )
        .route(
            "/api/clients/{client_id}/invoices/preview",
            get(invoice_preview_handler),
        )
        .route(
            "/api/clients/{client_id}/invoices",
            get(invoices_list_handler).post(invoice_generate_handler),
        )
        // Invoice lifecycle
        .route("/api/invoices/{invoice_id}", get(invoice_detail_handler))
        .route("/api/invoices/{invoice_id}/paid", post(invoice_paid_handler))
        .route("/api/invoices/{invoice_id}/void", post(invoice_void_handler))
        .route(
            "/api/invoices/{invoice_id}/recompute",
            post(invoice_recompute_handler),
        )
        // Agreements
        .route(
            "/api/clients/{client_id}/agreements",
            get(agreements_list_handler).post(agreements_create_handler),
        )
        .route(
            "/api/agreements/{agreement_id}/terminate",
            post(agreement_terminate_handler),
        )
        // Time entries
        .route(
            "/api/clients/{client_id}/time-entries",
            get(time_entries_list_handler).post(time_entries_create_handler),
        )
        .route(
            "/api/time-entries/{entry_id}",
            axum::routing::delete(time_entry_remove_handler),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, auth_middleware));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

/// Start the gateway HTTP server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
    auth_token: String,
) -> Result<SocketAddr, ChannelError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ChannelError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to bind to {}: {}", addr, e),
        })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ChannelError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to get local addr: {}", e),
        })?;

    // Same-origin only: the gateway is a local-first service.
    let origins: Vec<HeaderValue> = [
        format!("http://{}:{}", bound_addr.ip(), bound_addr.port()),
        format!("http://localhost:{}", bound_addr.port()),
    ]
    .iter()
    .filter_map(|origin| origin.parse().ok())
    .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ]));

    let app = router(Arc::clone(&state), auth_token).layer(cors);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Billing gateway shutting down");
            })
            .await
        {
            tracing::error!("Billing gateway server error: {}", e);
        }
    });

    tracing::info!("Billing gateway listening on http://{}", bound_addr);
    Ok(bound_addr)
}

// --- Health ---

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "retainer-ledger",
        uptime_secs: state.startup_time.elapsed().as_secs(),
    })
}

// --- Balances and invoices ---

async fn balances_handler(
    State(state): State<Arc<GatewayState>>,
    Path(client_id): Path<Uuid>,
    Query(query): Query<BalancesQuery>,
) -> ApiResult<BalancesResponse> {
    let months =
        invoice::get_monthly_balances(state.store.as_ref(), client_id, query.through, &state.billing)
            .await
            .map_err(billing_error)?;
    Ok(Json(BalancesResponse { client_id, months }))
}

async fn invoice_preview_handler(
    State(state): State<Arc<GatewayState>>,
    Path(client_id): Path<Uuid>,
    Query(query): Query<PeriodQuery>,
) -> ApiResult<InvoicePreview> {
    invoice::preview_invoice(
        state.store.as_ref(),
        client_id,
        query.period_start,
        query.period_end,
        &state.billing,
    )
    .await
    .map(Json)
    .map_err(billing_error)
}

async fn invoice_generate_handler(
    State(state): State<Arc<GatewayState>>,
    Path(client_id): Path<Uuid>,
    Json(req): Json<GenerateInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceDetail>), (StatusCode, String)> {
    let detail = invoice::generate_invoice(
        state.store.as_ref(),
        client_id,
        req.period_start,
        req.period_end,
        &state.billing,
    )
    .await
    .map_err(billing_error)?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn invoices_list_handler(
    State(state): State<Arc<GatewayState>>,
    Path(client_id): Path<Uuid>,
) -> ApiResult<InvoiceListResponse> {
    let invoices = state
        .store
        .list_invoices(client_id)
        .await
        .map_err(|e| billing_error(e.into()))?;
    Ok(Json(InvoiceListResponse { invoices }))
}

async fn invoice_detail_handler(
    State(state): State<Arc<GatewayState>>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<InvoiceDetail> {
    invoice::get_invoice_detail(state.store.as_ref(), invoice_id)
        .await
        .map(Json)
        .map_err(billing_error)
}

async fn invoice_paid_handler(
    State(state): State<Arc<GatewayState>>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<InvoiceRecord> {
    invoice::mark_paid(state.store.as_ref(), invoice_id)
        .await
        .map(Json)
        .map_err(billing_error)
}

async fn invoice_void_handler(
    State(state): State<Arc<GatewayState>>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<InvoiceRecord> {
    invoice::void_invoice(state.store.as_ref(), invoice_id)
        .await
        .map(Json)
        .map_err(billing_error)
}

async fn invoice_recompute_handler(
    State(state): State<Arc<GatewayState>>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<InvoiceRecord> {
    invoice::recompute_invoice_total(state.store.as_ref(), invoice_id)
        .await
        .map(Json)
        .map_err(billing_error)
}

// --- Agreements ---

async fn agreements_list_handler(
    State(state): State<Arc<GatewayState>>,
    Path(client_id): Path<Uuid>,
) -> ApiResult<AgreementListResponse> {
    let agreements = state
        .store
        .list_agreements(client_id)
        .await
        .map_err(|e| billing_error(e.into()))?;
    Ok(Json(AgreementListResponse { agreements }))
}

async fn agreements_create_handler(
    State(state): State<Arc<GatewayState>>,
    Path(client_id): Path<Uuid>,
    Json(req): Json<CreateAgreementRequest>,
) -> Result<(StatusCode, Json<AgreementRecord>), (StatusCode, String)> {
    let created = invoice::add_agreement(state.store.as_ref(), client_id, &req.into())
        .await
        .map_err(billing_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn agreement_terminate_handler(
    State(state): State<Arc<GatewayState>>,
    Path(agreement_id): Path<Uuid>,
    Json(req): Json<TerminateAgreementRequest>,
) -> ApiResult<AgreementRecord> {
    invoice::terminate_agreement(state.store.as_ref(), agreement_id, req.terminated_at)
        .await
        .map(Json)
        .map_err(billing_error)
}

// --- Time entries ---

async fn time_entries_list_handler(
    State(state): State<Arc<GatewayState>>,
    Path(client_id): Path<Uuid>,
) -> ApiResult<TimeEntryListResponse> {
    let entries = state
        .store
        .list_time_entries(client_id)
        .await
        .map_err(|e| billing_error(e.into()))?;
    Ok(Json(TimeEntryListResponse { entries }))
}

async fn time_entries_create_handler(
    State(state): State<Arc<GatewayState>>,
    Path(client_id): Path<Uuid>,
    Json(req): Json<CreateTimeEntryRequest>,
) -> Result<(StatusCode, Json<TimeEntryRecord>), (StatusCode, String)> {
    let created = invoice::log_time_entry(state.store.as_ref(), client_id, &req.into())
        .await
        .map_err(billing_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn time_entry_remove_handler(
    State(state): State<Arc<GatewayState>>,
    Path(entry_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    invoice::remove_time_entry(state.store.as_ref(), entry_id)
        .await
        .map_err(billing_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::extract::{Path, Query, State};
    use axum::http::{Request, StatusCode, header};
    use axum::Json;
    use http_body_util::BodyExt;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::config::BillingConfig;
    use crate::error::{BillingError, DatabaseError};
    use crate::testing::date;
    #[cfg(feature = "libsql")]
    use crate::testing::test_db;

    const TOKEN: &str = "test-token";

    fn agreement_request() -> CreateAgreementRequest {
        CreateAgreementRequest {
            active_from: date(2026, 1, 1),
            terminated_at: None,
            monthly_retainer_hours: dec!(10),
            rollover_months: 1,
            hourly_rate: dec!(150),
            monthly_fee: dec!(1200),
        }
    }

    fn entry_request(date_worked: chrono::NaiveDate, minutes_worked: i64) -> CreateTimeEntryRequest {
        CreateTimeEntryRequest {
            user_id: "avery".to_string(),
            description: "Advisory call".to_string(),
            minutes_worked,
            date_worked,
            billable: true,
        }
    }

    #[test]
    fn billing_errors_map_to_status_codes() {
        let cases = [
            (BillingError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (BillingError::NotFound("gone".into()), StatusCode::NOT_FOUND),
            (BillingError::Conflict("taken".into()), StatusCode::CONFLICT),
            (
                BillingError::Persistence(DatabaseError::Query("disk".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(billing_error(err).0, expected);
        }
    }

    #[test]
    fn persistence_errors_do_not_leak_details() {
        let (status, body) = billing_error(BillingError::Persistence(DatabaseError::Query(
            "relation client_invoices does not exist".into(),
        )));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.contains("client_invoices"));
    }

    #[cfg(feature = "libsql")]
    #[tokio::test]
    async fn generate_then_regenerate_conflicts() {
        let (db, _dir) = test_db().await;
        let state = GatewayState::new(db, BillingConfig::default());
        let client = Uuid::new_v4();

        agreements_create_handler(State(Arc::clone(&state)), Path(client), Json(agreement_request()))
            .await
            .expect("agreement");
        time_entries_create_handler(
            State(Arc::clone(&state)),
            Path(client),
            Json(entry_request(date(2026, 1, 12), 90)),
        )
        .await
        .expect("entry");

        let preview = invoice_preview_handler(
            State(Arc::clone(&state)),
            Path(client),
            Query(PeriodQuery {
                period_start: date(2026, 1, 1),
                period_end: date(2026, 1, 31),
            }),
        )
        .await
        .expect("preview");
        assert_eq!(preview.0.totals.invoice_total, dec!(1200));

        let (status, Json(detail)) = invoice_generate_handler(
            State(Arc::clone(&state)),
            Path(client),
            Json(GenerateInvoiceRequest {
                period_start: date(2026, 1, 1),
                period_end: date(2026, 1, 31),
            }),
        )
        .await
        .expect("generate");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(detail.invoice.invoice_total, preview.0.totals.invoice_total);

        let err = invoice_generate_handler(
            State(Arc::clone(&state)),
            Path(client),
            Json(GenerateInvoiceRequest {
                period_start: date(2026, 1, 15),
                period_end: date(2026, 2, 15),
            }),
        )
        .await
        .expect_err("overlapping period");
        assert_eq!(err.0, StatusCode::CONFLICT);
    }

    #[cfg(feature = "libsql")]
    #[tokio::test]
    async fn unknown_invoice_is_not_found() {
        let (db, _dir) = test_db().await;
        let state = GatewayState::new(db, BillingConfig::default());
        let err = invoice_paid_handler(State(state), Path(Uuid::new_v4()))
            .await
            .expect_err("missing invoice");
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[cfg(feature = "libsql")]
    #[tokio::test]
    async fn rejects_non_positive_minutes() {
        let (db, _dir) = test_db().await;
        let state = GatewayState::new(db, BillingConfig::default());
        let err = time_entries_create_handler(
            State(state),
            Path(Uuid::new_v4()),
            Json(entry_request(date(2026, 1, 5), 0)),
        )
        .await
        .expect_err("zero minutes");
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[cfg(feature = "libsql")]
    #[tokio::test]
    async fn health_is_public_and_api_requires_token() {
        let (db, _dir) = test_db().await;
        let app = router(GatewayState::new(db, BillingConfig::default()), TOKEN.to_string());
        let client = Uuid::new_v4();

        let health = app
            .clone()
            .oneshot(Request::get("/api/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(
            health.headers().get(header::X_CONTENT_TYPE_OPTIONS).map(|v| v.as_bytes()),
            Some(b"nosniff".as_slice())
        );

        let uri = format!("/api/clients/{client}/agreements");
        let anonymous = app
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .clone()
            .oneshot(
                Request::get(uri.as_str())
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let authed = app
            .oneshot(
                Request::get(uri.as_str())
                    .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(authed.status(), StatusCode::OK);
        let body = authed.into_body().collect().await.expect("body").to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["agreements"], serde_json::json!([]));
    }

    #[cfg(feature = "libsql")]
    #[tokio::test]
    async fn balances_serialize_decimals_as_strings() {
        let (db, _dir) = test_db().await;
        let state = GatewayState::new(db, BillingConfig::default());
        let client = Uuid::new_v4();
        agreements_create_handler(State(Arc::clone(&state)), Path(client), Json(agreement_request()))
            .await
            .expect("agreement");
        time_entries_create_handler(
            State(Arc::clone(&state)),
            Path(client),
            Json(entry_request(date(2026, 1, 12), 120)),
        )
        .await
        .expect("entry");

        let Json(balances) = balances_handler(
            State(state),
            Path(client),
            Query(BalancesQuery::default()),
        )
        .await
        .expect("balances");
        let json = serde_json::to_value(&balances).expect("json");
        assert_eq!(json["months"][0]["year_month"], "2026-01");
        assert!(json["months"][0]["hours_worked"].is_string());
        assert_eq!(balances.months[0].hours_worked, dec!(2));
    }
}
