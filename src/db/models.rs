//! Audit row shapes. One struct per table, fields in column order. Every
//! column not filled by the event stays NULL.

#[derive(Debug, Clone, Default)]
pub struct NewDeposit {
    pub msg: Option<String>,
    pub unix: Option<i64>,
    pub event_unix: Option<i64>,
    pub date: Option<String>,
    pub year: Option<i64>,
    pub month: Option<i64>,
    pub network: Option<String>,
    pub session_unix: Option<i64>,
    pub session_date: Option<String>,
    pub req_params: Option<String>,
    pub nonce: Option<i64>,
    pub event_id: Option<String>,
    pub uia: Option<String>,
    pub client_id: Option<String>,
    pub amount: Option<f64>,
    pub account_idx: Option<i64>,
    pub required_memo: Option<String>,
    pub deposit_address: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewWithdrawal {
    pub msg: Option<String>,
    pub unix: Option<i64>,
    pub event_unix: Option<i64>,
    pub date: Option<String>,
    pub year: Option<i64>,
    pub month: Option<i64>,
    pub network: Option<String>,
    pub session_unix: Option<i64>,
    pub session_date: Option<String>,
    pub op: Option<String>,
    pub nonce: Option<i64>,
    pub uia_id: Option<String>,
    pub event_id: Option<String>,
    pub withdrawal_amount: Option<f64>,
    pub gateway_address: Option<String>,
    pub client_address: Option<String>,
    pub client_id: Option<String>,
    pub account_idx: Option<i64>,
    pub tx_id: Option<String>,
    pub order_public: Option<String>,
    pub order_to: Option<String>,
    pub order_quantity: Option<f64>,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewIngot {
    pub msg: Option<String>,
    pub unix: Option<i64>,
    pub event_unix: Option<i64>,
    pub date: Option<String>,
    pub year: Option<i64>,
    pub month: Option<i64>,
    pub network: Option<String>,
    pub tx_id: Option<String>,
    pub order_public: Option<String>,
    pub order_to: Option<String>,
    pub order_quantity: Option<f64>,
}
