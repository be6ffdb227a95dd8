//! Prometheus exposition for `--metrics`

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use pipeline::metrics::{TASK_DURATION_BUCKETS, TASK_DURATION_METRIC};

fn builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(TASK_DURATION_METRIC.to_string()),
            TASK_DURATION_BUCKETS,
        )
        .context("failed to set histogram buckets")
}

/// Install the global recorder; `render()` on the handle yields the text format.
pub fn install_recorder() -> Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}
