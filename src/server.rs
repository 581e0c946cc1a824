//! Deposit request server.
//!
//! One public endpoint: `GET /<route>?client_id=..&uia_name=..` hands out a
//! deposit address (and, on memo-based networks, the required memo) and
//! arms an issue matcher for it. Every answer is HTTP 200; failures are
//! encoded in the body's `response` field. Health and prometheus routes
//! ride along for operators.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use eyre::{Result, WrapErr};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

use crate::context::GatewayContext;
use crate::db;
use crate::listener::{spawn_listener, ListenerParams};
use crate::memo::{encode_memo, random_seed};
use crate::metrics;
use crate::types::{AuditEvent, AuditHeader, DepositRecord, IssuerAction, Network};

/// Ceiling while waiting for the issue matcher to signal armed.
const ARM_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct DepositParams {
    client_id: Option<String>,
    uia_name: Option<String>,
}

pub async fn serve(ctx: Arc<GatewayContext>) -> Result<()> {
    let route = format!("/{}", ctx.config.server.route);
    let app = Router::new()
        .route(&route, get(deposit_handler))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .with_state(ctx.clone());

    let addr: SocketAddr = format!("{}:{}", ctx.config.server.bind, ctx.config.server.port)
        .parse()
        .wrap_err("Invalid deposit server bind address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, route, "deposit server started");
    metrics::UP.set(1.0);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn deposit_handler(
    State(ctx): State<Arc<GatewayContext>>,
    Query(params): Query<DepositParams>,
) -> Json<Value> {
    let event_id = ctx.next_deposit_id();
    let nonce = GatewayContext::nonce();
    let req_params = format!(
        "client_id={} uia_name={}",
        params.client_id.as_deref().unwrap_or(""),
        params.uia_name.as_deref().unwrap_or(""),
    );
    tracing::info!(%event_id, req = %req_params, "deposit request received");

    let (Some(client_id), Some(uia)) = (params.client_id, params.uia_name) else {
        let mut header = networkless_header(&ctx, nonce);
        header.event_id = Some(event_id);
        let event = AuditEvent::Deposits {
            header,
            record: DepositRecord {
                req_params: Some(req_params),
                ..Default::default()
            },
        };
        chronicle_or_log(&ctx, &event, "invalid request").await;
        metrics::DEPOSIT_REQUESTS
            .with_label_values(&["invalid"])
            .inc();
        return Json(error_body(
            nonce,
            "invalid request, client_id and uia_name are required".to_string(),
            &ctx.config.contact,
        ));
    };

    let Some(network) = ctx.config.network_for_uia(&uia) else {
        let msg = format!("{} not listed in offerings.", uia.to_uppercase());
        let mut header = networkless_header(&ctx, nonce);
        header.event_id = Some(event_id.clone());
        let event = AuditEvent::Deposits {
            header,
            record: DepositRecord {
                req_params: Some(req_params),
                uia: Some(uia.clone()),
                client_id: Some(client_id),
                ..Default::default()
            },
        };
        chronicle_or_log(&ctx, &event, &format!("{event_id} {msg}")).await;
        metrics::DEPOSIT_REQUESTS
            .with_label_values(&["unknown_uia"])
            .inc();
        return Json(error_body(
            nonce,
            format!(
                "{msg} oops! {} gateway is currently down for maintainance, \
                 please try again later",
                uia.to_uppercase()
            ),
            &ctx.config.contact,
        ));
    };

    let net_cfg = ctx.config.network(network);

    // claim an address; memo-based networks always answer from index 0 and
    // tell deposits apart by memo instead
    let account_idx = if network.memo_based() {
        0
    } else {
        match ctx.allocator.lock(network).await {
            Ok(Some(idx)) => idx,
            Ok(None) => {
                let msg = format!("{} gateway overloaded.", uia.to_uppercase());
                let mut header = ctx.header(network);
                header.event_id = Some(event_id.clone());
                header.nonce = Some(nonce);
                let event = AuditEvent::Deposits {
                    header,
                    record: DepositRecord {
                        req_params: Some(req_params),
                        uia: Some(uia.clone()),
                        client_id: Some(client_id),
                        ..Default::default()
                    },
                };
                chronicle_or_log(&ctx, &event, &format!("{event_id} {msg}")).await;
                metrics::DEPOSIT_REQUESTS
                    .with_label_values(&["overloaded"])
                    .inc();
                return Json(error_body(
                    nonce,
                    format!(
                        "{msg} oops! all {} gateway addresses are in use, \
                         please try again later",
                        uia.to_uppercase()
                    ),
                    &ctx.config.contact,
                ));
            }
            Err(err) => {
                tracing::error!(%network, error = %err, "allocator failure");
                metrics::DEPOSIT_REQUESTS
                    .with_label_values(&["error"])
                    .inc();
                return Json(error_body(
                    nonce,
                    "gateway is temporarily unavailable, please try again later".to_string(),
                    &ctx.config.contact,
                ));
            }
        }
    };
    let deposit_address = net_cfg.accounts[account_idx].public.clone();

    // a unique memo for this event; regenerate on the rare collision with
    // another outstanding deposit on the same address
    let memo = loop {
        let candidate = encode_memo(network, random_seed());
        if !network.memo_based() {
            break candidate;
        }
        if ctx.memos.try_register(network, &deposit_address, &candidate) {
            break candidate;
        }
    };

    let mut header = ctx.header(network);
    header.event_id = Some(event_id.clone());
    header.nonce = Some(nonce);
    let event = AuditEvent::Deposits {
        header,
        record: DepositRecord {
            req_params: Some(req_params),
            uia: Some(uia.clone()),
            client_id: Some(client_id.clone()),
            account_idx: Some(account_idx as i64),
            required_memo: Some(memo.clone()),
            deposit_address: Some(deposit_address.clone()),
            ..Default::default()
        },
    };

    let (armed_tx, armed_rx) = oneshot::channel();
    spawn_listener(
        ctx.clone(),
        ListenerParams {
            network,
            action: IssuerAction::Issue,
            listening_to: deposit_address.clone(),
            required_memo: network.memo_based().then(|| memo.clone()),
            expected_amount: None,
            client_id: Some(client_id.clone()),
            account_idx,
            event: event.clone(),
        },
        Some(armed_tx),
    );
    chronicle_or_log(&ctx, &event, "listener process started").await;
    tracing::info!(%network, %event_id, client = %client_id, address = %deposit_address, "issue listener armed for deposit");

    // offer the address only once the matcher is watching
    if timeout(ARM_DEADLINE, armed_rx).await.is_err() {
        tracing::warn!(%network, %event_id, "issue matcher did not signal armed before deadline");
    }
    metrics::DEPOSIT_REQUESTS
        .with_label_values(&["success"])
        .inc();
    Json(success_body(
        network,
        nonce,
        &uia,
        &client_id,
        &deposit_address,
        &memo,
        net_cfg.timing.estimate_secs,
        &ctx.config.contact,
    ))
}

fn networkless_header(ctx: &GatewayContext, nonce: i64) -> AuditHeader {
    let mut header = AuditHeader::networkless(ctx.session_unix, ctx.session_date.clone());
    header.nonce = Some(nonce);
    header
}

async fn chronicle_or_log(ctx: &GatewayContext, event: &AuditEvent, msg: &str) {
    if let Err(err) = ctx.chronicle.record(event, msg).await {
        tracing::error!(error = %err, msg, "failed to chronicle deposit event");
    }
}

/// Success body offered to the depositor. Memo-based networks additionally
/// carry the required memo.
#[allow(clippy::too_many_arguments)]
fn success_body(
    network: Network,
    nonce: i64,
    uia: &str,
    client_id: &str,
    deposit_address: &str,
    memo: &str,
    estimate_secs: u64,
    contact: &str,
) -> Value {
    let estimate = estimate_secs / 60;
    let mut msg = format!(
        "Welcome {client_id}, please transfer your foreign blockchain {} asset, \
         to the {} gateway 'deposit_address' in this response.  \
         Make ONE transfer to this address, within the 'gateway_timeout' \
         specified. Transactions on this network take about {estimate} minutes \
         to confirm. ",
        network.ticker(),
        uia.to_uppercase(),
    );
    let mut body = json!({
        "response": "success",
        "server_time": nonce,
        "deposit_address": deposit_address,
        "gateway_timeout": "30 MINUTES",
        "contact": contact,
    });
    if network.memo_based() {
        msg.push_str(&format!(
            "\n\n*ALERT*: {} deposits must include the *MEMO* provided in this \
             response!!!",
            network.ticker(),
        ));
        body["memo"] = json!(memo);
    }
    body["msg"] = json!(msg);
    body
}

fn error_body(nonce: i64, msg: String, contact: &str) -> Value {
    json!({
        "response": "error",
        "server_time": nonce,
        "msg": msg,
        "contact": contact,
    })
}

async fn health(State(ctx): State<Arc<GatewayContext>>) -> Json<Value> {
    let deposits = db::count_rows(&ctx.pool, "deposits").await.unwrap_or(0);
    let withdrawals = db::count_rows(&ctx.pool, "withdrawals").await.unwrap_or(0);
    let ingots = db::count_rows(&ctx.pool, "ingots").await.unwrap_or(0);
    Json(json!({
        "status": "ok",
        "session_unix": ctx.session_unix,
        "offerings": ctx.config.offerings,
        "audit_rows": {
            "deposits": deposits,
            "withdrawals": withdrawals,
            "ingots": ingots,
        },
    }))
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }
    ([(axum::http::header::CONTENT_TYPE, encoder.format_type())], buffer).into_response()
}
