use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounterVec> = OnceLock::new();
static REJECTED: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCK_SUBMIT_ATTEMPTS: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCK_SUBMIT_REJECTED: OnceLock<IntCounterVec> = OnceLock::new();
static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounterVec> = OnceLock::new();

static DAEMON_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static DAEMON_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();
static BANS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGaugeVec> = OnceLock::new();

fn accepted() -> &'static IntCounterVec {
    ACCEPTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_accepted_total", "Total accepted shares"),
            &["pool"],
        )
        .expect("valid metric")
    })
}

fn rejected() -> &'static IntCounterVec {
    REJECTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_rejected_total", "Total rejected shares by reason code"),
            &["pool", "code"],
        )
        .expect("valid metric")
    })
}

fn blocks_found() -> &'static IntCounterVec {
    BLOCKS_FOUND.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("blocks_found_total", "Blocks accepted by the daemon"),
            &["pool"],
        )
        .expect("valid metric")
    })
}

fn block_submit_attempts() -> &'static IntCounterVec {
    BLOCK_SUBMIT_ATTEMPTS.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("block_submit_attempts_total", "Block candidates submitted to the daemon"),
            &["pool"],
        )
        .expect("valid metric")
    })
}

fn block_submit_rejected() -> &'static IntCounterVec {
    BLOCK_SUBMIT_REJECTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("block_submit_rejected_total", "Block candidates rejected by the daemon"),
            &["pool"],
        )
        .expect("valid metric")
    })
}

fn vardiff_retargets() -> &'static IntCounter {
    VARDIFF_RETARGETS.get_or_init(|| {
        IntCounter::new("vardiff_retargets_total", "Total VarDiff retarget events").expect("valid metric")
    })
}

fn job_broadcasts() -> &'static IntCounterVec {
    JOB_BROADCASTS.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("job_broadcasts_total", "Total mining.notify broadcasts"),
            &["pool"],
        )
        .expect("valid metric")
    })
}

fn daemon_requests() -> &'static IntCounter {
    DAEMON_REQUESTS.get_or_init(|| {
        IntCounter::new("daemon_requests_total", "Total JSON-RPC requests to daemons").expect("valid metric")
    })
}

fn daemon_errors() -> &'static IntCounter {
    DAEMON_ERRORS.get_or_init(|| {
        IntCounter::new("daemon_errors_total", "Total failed daemon requests").expect("valid metric")
    })
}

fn template_fetch_errors() -> &'static IntCounterVec {
    TEMPLATE_FETCH_ERRORS.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("block_template_fetch_errors_total", "Total template fetch errors"),
            &["pool"],
        )
        .expect("valid metric")
    })
}

fn bans() -> &'static IntCounter {
    BANS.get_or_init(|| IntCounter::new("bans_total", "Total bans issued").expect("valid metric"))
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| {
        IntGauge::new("stratum_active_connections", "Active Stratum connections").expect("valid metric")
    })
}

fn template_height() -> &'static IntGaugeVec {
    TEMPLATE_HEIGHT.get_or_init(|| {
        IntGaugeVec::new(
            Opts::new("block_template_height", "Height of the current job"),
            &["pool"],
        )
        .expect("valid metric")
    })
}

pub fn inc_accepted(pool: &str) {
    accepted().with_label_values(&[pool]).inc();
}

pub fn inc_rejected(pool: &str, code: i32) {
    rejected().with_label_values(&[pool, &code.to_string()]).inc();
}

pub fn inc_blocks_found(pool: &str) {
    blocks_found().with_label_values(&[pool]).inc();
}

pub fn inc_block_submit_attempts(pool: &str) {
    block_submit_attempts().with_label_values(&[pool]).inc();
}

pub fn inc_block_submit_rejected(pool: &str) {
    block_submit_rejected().with_label_values(&[pool]).inc();
}

pub fn inc_vardiff_retarget() {
    vardiff_retargets().inc();
}

pub fn inc_job_broadcasts(pool: &str) {
    job_broadcasts().with_label_values(&[pool]).inc();
}

pub fn inc_daemon_requests() {
    daemon_requests().inc();
}

pub fn inc_daemon_errors() {
    daemon_errors().inc();
}

pub fn inc_template_fetch_errors(pool: &str) {
    template_fetch_errors().with_label_values(&[pool]).inc();
}

pub fn inc_bans() {
    bans().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn set_template_height(pool: &str, height: u64) {
    template_height().with_label_values(&[pool]).set(height as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(blocks_found().collect());
    mfs.extend(block_submit_attempts().collect());
    mfs.extend(block_submit_rejected().collect());
    mfs.extend(vardiff_retargets().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(daemon_requests().collect());
    mfs.extend(daemon_errors().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(bans().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(template_height().collect());

    // Families without samples (label sets never touched) fail encoding,
    // so encode one at a time and skip those.
    let mut buf = Vec::new();
    for mf in mfs {
        let _ = enc.encode(std::slice::from_ref(&mf), &mut buf);
    }
    String::from_utf8_lossy(&buf).to_string()
}
