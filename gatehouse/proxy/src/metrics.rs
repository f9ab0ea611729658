use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    admissions: Family<OutcomeLabels, Counter>,
    upstream_errors: Counter,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Forwarded,
    BadRequest,
    NotFound,
    Unauthenticated,
    Denied,
    Unavailable,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: Outcome,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let admissions = Family::default();
        reg.register(
            "admissions",
            "Total number of requests admitted or rejected, by outcome",
            admissions.clone(),
        );

        let upstream_errors = Counter::default();
        reg.register(
            "upstream_errors",
            "Total number of admitted requests that could not be forwarded",
            upstream_errors.clone(),
        );

        Self {
            admissions,
            upstream_errors,
        }
    }

    pub(crate) fn record(&self, outcome: Outcome) {
        self.admissions
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }

    pub(crate) fn upstream_error(&self) {
        self.upstream_errors.inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, outcome: Outcome) -> u64 {
        self.admissions
            .get_or_create(&OutcomeLabels { outcome })
            .get()
    }
}
