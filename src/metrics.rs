use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::engine::PatchCounts;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub operation: String,
    pub resource: String,
    pub version: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub allowed: &'static str,
    pub mutated: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ScopeLabels {
    pub scope: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub webhook: &'static str,
}

pub struct HardenerMetrics {
    pub admission_requests_total: Family<RequestLabels, Counter>,
    pub admission_responses_total: Family<ResponseLabels, Counter>,
    pub patch_operations_total: Family<ScopeLabels, Counter>,
    pub admission_request_duration_seconds: Family<WebhookLabels, Histogram>,
}

const DURATION_BUCKETS: [f64; 12] = [
    0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0,
];

fn new_duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.iter().copied())
}

fn bool_label(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

impl HardenerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let admission_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "hardener_admission_requests",
            "Total number of admission requests received",
            admission_requests_total.clone(),
        );

        let admission_responses_total = Family::<ResponseLabels, Counter>::default();
        registry.register(
            "hardener_admission_responses",
            "Total number of admission responses sent",
            admission_responses_total.clone(),
        );

        let patch_operations_total = Family::<ScopeLabels, Counter>::default();
        registry.register(
            "hardener_patch_operations",
            "Total number of securityContext patch operations emitted",
            patch_operations_total.clone(),
        );

        let admission_request_duration_seconds =
            Family::<WebhookLabels, Histogram>::new_with_constructor(new_duration_histogram);
        registry.register(
            "hardener_admission_request_duration_seconds",
            "Duration of admission request processing in seconds",
            admission_request_duration_seconds.clone(),
        );

        Self {
            admission_requests_total,
            admission_responses_total,
            patch_operations_total,
            admission_request_duration_seconds,
        }
    }

    pub fn record_response(&self, allowed: bool, counts: PatchCounts) {
        self.admission_responses_total
            .get_or_create(&ResponseLabels {
                allowed: bool_label(allowed),
                mutated: bool_label(counts.total() > 0),
            })
            .inc();

        for (scope, count) in [("pod", counts.pod), ("container", counts.container)] {
            if count > 0 {
                self.patch_operations_total
                    .get_or_create(&ScopeLabels { scope })
                    .inc_by(count as u64);
            }
        }
    }
}
