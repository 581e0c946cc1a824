//! Event chronicle.
//!
//! Every noteworthy moment of an event's life is appended to that network's
//! monthly archive file; deposit, withdrawal, and ingot events additionally
//! land as typed rows in the relational audit store.

use chrono::{Datelike, Local, Utc};
use eyre::Result;
use sqlx::SqlitePool;

use crate::db::{self, NewDeposit, NewIngot, NewWithdrawal};
use crate::ipc::JsonIpc;
use crate::types::AuditEvent;

#[derive(Clone)]
pub struct Chronicle {
    ipc: JsonIpc,
    pool: SqlitePool,
}

/// Wall-clock stamps shared by the archive line and the relational row.
struct Stamps {
    unix: i64,
    date: String,
    year: i64,
    month: i64,
}

impl Stamps {
    fn now() -> Self {
        let local = Local::now();
        Stamps {
            unix: Utc::now().timestamp(),
            date: local.format("%a %b %e %H:%M:%S %Y").to_string(),
            year: i64::from(local.year()),
            month: i64::from(local.month()),
        }
    }
}

impl Chronicle {
    pub fn new(ipc: JsonIpc, pool: SqlitePool) -> Self {
        Chronicle { ipc, pool }
    }

    /// Append this event to the monthly archive and, for relational event
    /// kinds, insert the audit row.
    pub async fn record(&self, event: &AuditEvent, msg: &str) -> Result<()> {
        let stamps = Stamps::now();
        let header = event.header();
        let doc = format!(
            "{}_{}_archive",
            header.ticker(),
            Local::now().format("%Y_%m"),
        );

        let mut line = serde_json::to_value(event)?;
        if let Some(map) = line.as_object_mut() {
            map.insert("msg".into(), msg.into());
            map.insert("unix".into(), stamps.unix.into());
            map.insert("event_unix".into(), stamps.unix.into());
            map.insert("date".into(), stamps.date.clone().into());
            map.insert("year".into(), stamps.year.into());
            map.insert("month".into(), stamps.month.into());
            map.insert("network".into(), header.ticker().into());
        }
        self.ipc.append(&doc, &line).await?;

        match event {
            AuditEvent::Deposits { header, record } => {
                let row = NewDeposit {
                    msg: Some(msg.to_string()),
                    unix: Some(stamps.unix),
                    event_unix: Some(stamps.unix),
                    date: Some(stamps.date),
                    year: Some(stamps.year),
                    month: Some(stamps.month),
                    network: Some(header.ticker().to_string()),
                    session_unix: Some(header.session_unix),
                    session_date: Some(header.session_date.clone()),
                    req_params: record.req_params.clone(),
                    nonce: header.nonce,
                    event_id: header.event_id.as_ref().map(|id| id.to_string()),
                    uia: record.uia.clone(),
                    client_id: record.client_id.clone(),
                    amount: record.amount,
                    account_idx: record.account_idx,
                    required_memo: record.required_memo.clone(),
                    deposit_address: record.deposit_address.clone(),
                };
                db::insert_deposit(&self.pool, &row).await?;
            }
            AuditEvent::Withdrawals { header, record } => {
                let row = NewWithdrawal {
                    msg: Some(msg.to_string()),
                    unix: Some(stamps.unix),
                    event_unix: Some(stamps.unix),
                    date: Some(stamps.date),
                    year: Some(stamps.year),
                    month: Some(stamps.month),
                    network: Some(header.ticker().to_string()),
                    session_unix: Some(header.session_unix),
                    session_date: Some(header.session_date.clone()),
                    op: record.op.clone(),
                    nonce: header.nonce,
                    uia_id: record.uia_id.clone(),
                    event_id: header.event_id.as_ref().map(|id| id.to_string()),
                    withdrawal_amount: record.withdrawal_amount,
                    gateway_address: record.gateway_address.clone(),
                    client_address: record.client_address.clone(),
                    client_id: record.client_id.clone(),
                    account_idx: record.account_idx,
                    tx_id: record.tx_id.clone(),
                    order_public: record.order_public.clone(),
                    order_to: record.order_to.clone(),
                    order_quantity: record.order_quantity,
                    memo: record.memo.clone(),
                };
                db::insert_withdrawal(&self.pool, &row).await?;
            }
            AuditEvent::Ingots { header, record } => {
                let row = NewIngot {
                    msg: Some(msg.to_string()),
                    unix: Some(stamps.unix),
                    event_unix: Some(stamps.unix),
                    date: Some(stamps.date),
                    year: Some(stamps.year),
                    month: Some(stamps.month),
                    network: Some(header.ticker().to_string()),
                    tx_id: record.tx_id.clone(),
                    order_public: record.order_public.clone(),
                    order_to: record.order_to.clone(),
                    order_quantity: record.order_quantity,
                };
                db::insert_ingot(&self.pool, &row).await?;
            }
            AuditEvent::System { .. } => {}
        }

        Ok(())
    }
}
