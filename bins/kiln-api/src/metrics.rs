// Prometheus counters for the HTTP surface.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("kiln_submissions_total", "Jobs accepted, by language"),
        &["language"]
    )
    .expect("metric can be created");
    pub static ref REJECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("kiln_rejected_submissions_total", "Submissions refused, by reason"),
        &["reason"]
    )
    .expect("metric can be created");
    pub static ref STATUS_READS_TOTAL: IntCounter =
        IntCounter::new("kiln_status_reads_total", "Job status reads served").expect("metric can be created");
}

/// Register all collectors. Call once at startup.
pub fn register() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(SUBMISSIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REJECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATUS_READS_TOTAL.clone()))?;
    Ok(())
}

pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
