use lazy_static::lazy_static;
use log::error;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use warp::{Rejection, Reply};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    pub static ref NUM_CONNECTED_CLIENTS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("num_connected_clients", "Connected Clients"),
        &["hashed_ip"]
    )
    .expect("metric can be created");
    pub static ref NUM_ONGOING_SESSIONS: IntGauge =
        IntGauge::new("num_ongoing_sessions", "Ongoing Sessions").expect("metric can be created");
    pub static ref SESSION_DURATION_SEC: Histogram = Histogram::with_opts(
        HistogramOpts::new("session_duration_sec", "Session Duration Seconds").buckets(vec![
            60.0, 300.0, 600.0, 900.0, 1800.0, 2700.0, 3600.0, 5400.0, 7200.0, 9000.0, 10800.0,
            14400.0, 21600.0, 28800.0, 43200.0, 86400.0,
        ])
    )
    .expect("metric can be created");
    pub static ref COMMANDS_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("commands_sent", "Playback Commands Sent"),
        &["kind"]
    )
    .expect("metric can be created");
    pub static ref COMMANDS_DROPPED: IntCounter =
        IntCounter::new("commands_dropped", "Playback Commands Dropped")
            .expect("metric can be created");
    pub static ref DRIFT_CORRECTIONS: IntCounter =
        IntCounter::new("drift_corrections", "Drift Corrections Issued")
            .expect("metric can be created");
}

pub(crate) fn register() {
    REGISTRY
        .register(Box::new(NUM_CONNECTED_CLIENTS.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(NUM_ONGOING_SESSIONS.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(SESSION_DURATION_SEC.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(COMMANDS_SENT.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(COMMANDS_DROPPED.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(DRIFT_CORRECTIONS.clone()))
        .expect("collector can be registered");
}

pub(crate) async fn metrics_handler() -> Result<impl Reply, Rejection> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
    };
    let mut res = String::from_utf8(buffer).unwrap_or_else(|e| {
        error!("custom metrics could not be from_utf8'd: {}", e);
        String::default()
    });

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!("could not encode prometheus metrics: {}", e);
    };
    let res_process = String::from_utf8(buffer).unwrap_or_else(|e| {
        error!("prometheus metrics could not be from_utf8'd: {}", e);
        String::default()
    });

    res.push_str(&res_process);
    Ok(res)
}

/// Pseudonymous label for a client address.
pub fn hash_ip(ip: std::net::IpAddr, salt: &str) -> Result<String, argon2::password_hash::Error> {
    use argon2::{
        password_hash::{PasswordHasher, SaltString},
        Argon2,
    };
    Argon2::default()
        .hash_password(ip.to_string().as_bytes(), &SaltString::from_b64(salt)?)?
        .hash
        .map(|hash| hash.to_string())
        .ok_or(argon2::password_hash::Error::Password)
}
