use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    backend_errors_total: IntCounterVec,
    rate_limited_total: IntCounter,
}

pub struct InflightGuard<'a> {
    metrics: &'a AppMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!(
                "gateway_http_requests_total",
                "Total HTTP requests processed by gateway"
            ),
            &["path", "method", "status", "stream"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["path", "method", "stream"],
        )
        .expect("valid request_duration_seconds metric");

        let inflight_requests = IntGauge::new(
            "gateway_inflight_requests",
            "Current in-flight chat requests at gateway",
        )
        .expect("valid inflight_requests metric");

        let backend_errors_total = IntCounterVec::new(
            opts!(
                "gateway_backend_errors_total",
                "Total backend errors by backend and stage"
            ),
            &["backend", "stage"],
        )
        .expect("valid backend_errors_total metric");

        let rate_limited_total = IntCounter::new(
            "gateway_rate_limited_total",
            "Requests rejected by the rate limiter",
        )
        .expect("valid rate_limited_total metric");

        registry
            .register(Box::new(request_total.clone()))
            .expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(backend_errors_total.clone()))
            .expect("register backend_errors_total");
        registry
            .register(Box::new(rate_limited_total.clone()))
            .expect("register rate_limited_total");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            inflight_requests,
            backend_errors_total,
            rate_limited_total,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight_requests.inc();
        InflightGuard { metrics: self }
    }

    pub fn observe_request(
        &self,
        path: &str,
        method: &str,
        stream: bool,
        status: u16,
        duration: Duration,
    ) {
        let stream_label = if stream { "true" } else { "false" };
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label, stream_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path, method, stream_label])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_backend_error(&self, backend: &str, stage: &str) {
        self.backend_errors_total
            .with_label_values(&[backend, stage])
            .inc();
    }

    pub fn observe_rate_limited(&self) {
        self.rate_limited_total.inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_labelled_counters() {
        let metrics = AppMetrics::new();
        metrics.observe_request("/v1/chat/completions", "POST", true, 200, Duration::from_millis(5));
        metrics.observe_backend_error("opencode", "stream");
        metrics.observe_rate_limited();
        {
            let _guard = metrics.inflight_guard();
        }

        let body = metrics.render().expect("render");
        assert!(body.contains("gateway_backend_errors_total{backend=\"opencode\",stage=\"stream\"} 1"));
        assert!(body.contains("gateway_rate_limited_total 1"));
        assert!(body.contains("gateway_inflight_requests 0"));
    }
}
