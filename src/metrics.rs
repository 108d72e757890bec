use tracing::trace;

// Lightweight metrics helpers that stay safe when no exporter is mounted.
// The Prometheus recorder picks these up via the tracing bridge in demo
// builds; in production the same names come from the /metrics endpoint.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "listforge.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn phase_elapsed(phase: &'static str, elapsed_ms: u128) {
    trace!(
        target = "listforge.metrics",
        phase = phase,
        elapsed_ms = elapsed_ms as u64,
        "phase_elapsed"
    );
}

pub fn job_finished(kind: &'static str, outcome: &'static str) {
    trace!(
        target = "listforge.metrics",
        kind = kind,
        outcome = outcome,
        "jobs_finished_inc"
    );
}
