//! Prometheus metrics, exposed through the deposit server's /metrics route.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    // Parachain metrics
    pub static ref PARACHAIN_HEAD: GaugeVec = register_gauge_vec!(
        "gateway_parachain_head_block",
        "Newest block number held in each parachain cache",
        &["network"]
    ).unwrap();

    pub static ref PARACHAIN_TICKS: CounterVec = register_counter_vec!(
        "gateway_parachain_ticks_total",
        "Parachain update iterations",
        &["network"]
    ).unwrap();

    // Matcher metrics
    pub static ref LISTENERS_ACTIVE: GaugeVec = register_gauge_vec!(
        "gateway_listeners_active",
        "Matchers currently armed",
        &["network", "action"]
    ).unwrap();

    pub static ref ISSUES: CounterVec = register_counter_vec!(
        "gateway_issues_total",
        "UIA issue actions taken",
        &["network"]
    ).unwrap();

    pub static ref RESERVES: CounterVec = register_counter_vec!(
        "gateway_reserves_total",
        "UIA reserve actions taken",
        &["network"]
    ).unwrap();

    pub static ref LISTENER_TIMEOUTS: CounterVec = register_counter_vec!(
        "gateway_listener_timeouts_total",
        "Matchers that expired without a matching transfer",
        &["network"]
    ).unwrap();

    // Host-ledger ingestor metrics
    pub static ref HOST_IRREVERSIBLE_BLOCK: Gauge = register_gauge!(
        "gateway_host_irreversible_block",
        "Consensus irreversible block number of the host ledger"
    ).unwrap();

    pub static ref CONSENSUS_SKIPS: CounterVec = register_counter_vec!(
        "gateway_consensus_skips_total",
        "Ingest ticks skipped for lack of a consensus mode",
        &["reason"]
    ).unwrap();

    pub static ref WITHDRAWALS_DETECTED: CounterVec = register_counter_vec!(
        "gateway_withdrawals_detected_total",
        "UIA transfers to the issuer recognized as withdrawal intents",
        &["network"]
    ).unwrap();

    // Deposit surface metrics
    pub static ref DEPOSIT_REQUESTS: CounterVec = register_counter_vec!(
        "gateway_deposit_requests_total",
        "Deposit address requests",
        &["outcome"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "gateway_errors_total",
        "Errors by worker and kind",
        &["worker", "kind"]
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "gateway_up",
        "Whether the gateway is up and running"
    ).unwrap();
}
