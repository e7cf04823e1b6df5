//! Prometheus metrics for transfers.
//!
//! Every finished [`TransferResult`] is recorded in a private registry.
//! With a Pushgateway configured the registry is pushed after each transfer;
//! a failed push is logged and never fails the transfer.

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{TransferOutcome, TransferResult};

/// Where transfer metrics are pushed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Pushgateway base URL; metrics are only kept in-process without it
    #[serde(default)]
    pub pushgateway_url: Option<String>,

    #[serde(default = "default_job")]
    pub job: String,

    #[serde(default = "default_instance")]
    pub instance: String,
}

fn default_job() -> String {
    "beamflow_transfer".to_string()
}
fn default_instance() -> String {
    "data_transfer".to_string()
}

/// Transfer counters, sizes and timings
pub struct TransferMetrics {
    registry: Registry,
    transfers: IntCounterVec,
    bytes: IntCounterVec,
    duration: HistogramVec,
    speed: GaugeVec,
    push: Option<(reqwest::Client, String)>,
}

impl TransferMetrics {
    pub fn new(config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        let transfers = IntCounterVec::new(
            Opts::new("beamflow_transfers_total", "Finished transfers by outcome"),
            &["outcome"],
        )?;
        let bytes = IntCounterVec::new(
            Opts::new("beamflow_transfer_bytes_total", "Bytes moved by destination endpoint"),
            &["destination"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("beamflow_transfer_duration_seconds", "Wall time of one transfer")
                .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
            &["outcome"],
        )?;
        let speed = GaugeVec::new(
            Opts::new(
                "beamflow_transfer_speed_bytes_per_second",
                "Throughput of the latest successful transfer",
            ),
            &["destination"],
        )?;

        let registry = Registry::new();
        registry.register(Box::new(transfers.clone()))?;
        registry.register(Box::new(bytes.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(speed.clone()))?;

        let push = config.pushgateway_url.as_ref().map(|url| {
            let target = format!(
                "{}/metrics/job/{}/instance/{}",
                url.trim_end_matches('/'),
                config.job,
                config.instance
            );
            (reqwest::Client::new(), target)
        });

        Ok(Self {
            registry,
            transfers,
            bytes,
            duration,
            speed,
            push,
        })
    }

    pub fn record(&self, result: &TransferResult) {
        let outcome = outcome_label(result.outcome);
        self.transfers.with_label_values(&[outcome]).inc();
        self.duration
            .with_label_values(&[outcome])
            .observe(result.duration_ms as f64 / 1000.0);

        if result.is_success() {
            self.bytes
                .with_label_values(&[result.destination.as_str()])
                .inc_by(result.bytes_moved);
            if let Some(mb_s) = result.throughput_mb_s() {
                self.speed
                    .with_label_values(&[result.destination.as_str()])
                    .set(mb_s * 1_000_000.0);
            }
        }
    }

    /// Text exposition of everything recorded so far
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn push_target(&self) -> Option<&str> {
        self.push.as_ref().map(|(_, target)| target.as_str())
    }

    /// Replace this instance's group on the Pushgateway
    pub async fn push(&self) {
        let Some((ref client, ref target)) = self.push else {
            return;
        };

        let sent = client
            .put(target)
            .header(reqwest::header::CONTENT_TYPE, TextEncoder::new().format_type())
            .body(self.encode())
            .send()
            .await
            .and_then(|response| response.error_for_status());
        match sent {
            Ok(_) => debug!(gateway = %target, "Pushed transfer metrics"),
            Err(e) => warn!(gateway = %target, error = %e, "Failed to push transfer metrics"),
        }
    }
}

fn outcome_label(outcome: TransferOutcome) -> &'static str {
    match outcome {
        TransferOutcome::Succeeded => "succeeded",
        TransferOutcome::Failed => "failed",
        TransferOutcome::TimedOut => "timed_out",
    }
}
