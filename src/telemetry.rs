//! Telemetry and structured logging for conversions.

use crate::governor::GovernorReport;
use crate::job::{ConversionJob, JobStatus};
use crate::recovery::ErrorRecord;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{error, info, warn};

const TRACER_NAME: &str = "imgconv-engine";

/// Jobs slower than this are logged as a warning.
const SLOW_JOB_MS: u64 = 5000;

/// Records telemetry for a finished job.
///
/// Emits a structured log line and an OpenTelemetry span with the job id,
/// route, status, attempt and, when available, the governor measurements.
pub fn record_job_telemetry(job: &ConversionJob, report: Option<&GovernorReport>) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("conversion_job");

    let route = job
        .route
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(">");

    span.set_attribute(KeyValue::new("job_id", job.job_id.clone()));
    span.set_attribute(KeyValue::new("route", route.clone()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("attempt", i64::from(job.attempt)));
    if let Some(parent) = &job.parent_job_id {
        span.set_attribute(KeyValue::new("parent_job_id", parent.clone()));
    }

    if let Some(report) = report {
        span.set_attribute(KeyValue::new("duration_ms", report.duration_ms as i64));
        span.set_attribute(KeyValue::new("memory_delta_bytes", report.memory_delta_bytes));
        span.set_attribute(KeyValue::new("cleanup_passes", i64::from(report.cleanup_passes)));

        info!(
            job_id = %job.job_id,
            route = %route,
            status = %job.status,
            duration_ms = report.duration_ms,
            memory_delta_bytes = report.memory_delta_bytes,
            "Conversion job finished"
        );

        if report.duration_ms > SLOW_JOB_MS {
            warn!(
                job_id = %job.job_id,
                duration_ms = report.duration_ms,
                "Conversion exceeded performance threshold (5000ms)"
            );
        }
    }

    if job.status == JobStatus::Failed {
        if let Some(ref error) = job.error {
            span.set_attribute(KeyValue::new("error", error.clone()));
            warn!(
                job_id = %job.job_id,
                error = %error,
                attempt = job.attempt,
                "Conversion job failed"
            );
        }
    }

    span.end();
}

/// Records a classified error. Unrecovered records log at `error`.
pub fn record_error(record: &ErrorRecord) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("conversion_error");

    span.set_attribute(KeyValue::new("error_id", record.id.clone()));
    span.set_attribute(KeyValue::new("kind", record.kind.as_str()));
    span.set_attribute(KeyValue::new("category", record.category.to_string()));
    span.set_attribute(KeyValue::new("recovery_attempted", record.recovery_attempted));
    span.set_attribute(KeyValue::new("recovered", record.recovered));
    span.end();

    if record.recovered {
        info!(
            error_id = %record.id,
            kind = %record.kind,
            "Conversion error recovered"
        );
    } else {
        error!(
            error_id = %record.id,
            kind = %record.kind,
            category = %record.category,
            recovery_attempted = record.recovery_attempted,
            message = %record.message,
            "Conversion failed"
        );
    }
}

/// Installs the global OTLP trace pipeline.
///
/// The `imgconv` binary only calls this when `IMGCONV_OTEL=1`; until then
/// spans go to the no-op global provider. Reads:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: imgconv)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "imgconv".to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ConvertError;
    use crate::format::Format;
    use crate::recovery::{ErrorContext, RecoveryEngine};
    use crate::request::{ConversionOptions, ConversionRequest};
    use std::sync::{Arc, Mutex};

    fn job() -> ConversionJob {
        let request = ConversionRequest::new(
            vec![0u8; 4],
            Format::Svg,
            Format::Png,
            ConversionOptions::default(),
        );
        ConversionJob::new(&request)
    }

    #[test]
    fn test_record_completed_job() {
        let mut job = job();
        job.start_processing(&[Format::Svg, Format::Png]).unwrap();
        job.mark_completed().unwrap();

        let report = GovernorReport {
            duration_ms: 6000,
            ..GovernorReport::default()
        };
        // Should not panic with the no-op global provider
        record_job_telemetry(&job, Some(&report));
    }

    #[test]
    fn test_record_failed_job() {
        let mut job = job();
        job.mark_failed("Test error".to_string()).unwrap();
        record_job_telemetry(&job, None);
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn captured(f: impl FnOnce()) -> String {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = capture.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_unrecovered_error_logs_at_error_level() {
        let mut engine = RecoveryEngine::new(&EngineConfig::default());
        let record = engine.record(
            &ConvertError::Processing("out of memory".into()),
            ErrorContext::new("test"),
        );

        let output = captured(|| record_error(&record));
        assert!(output.contains(" ERROR "), "{}", output);
        assert!(output.contains("MEMORY_ERROR"), "{}", output);
    }

    #[test]
    fn test_recovered_error_logs_at_info_level() {
        let mut engine = RecoveryEngine::new(&EngineConfig::default());
        let mut record = engine.record(
            &ConvertError::Processing("out of memory".into()),
            ErrorContext::new("test"),
        );
        record.recovered = true;

        let output = captured(|| record_error(&record));
        assert!(output.contains(" INFO "), "{}", output);
        assert!(!output.contains(" ERROR "), "{}", output);
    }
}
