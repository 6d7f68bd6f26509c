//! Conversion orchestration.
//!
//! [`ConversionEngine`] ties the pieces together for one request: validate,
//! resolve a route, run every hop under the governor, and hand failures to
//! the recovery engine, which may retry the same route once with adjusted
//! options. Retries always run as a fresh job after scratch memory has been
//! released.

use crate::codec::Codec;
use crate::config::EngineConfig;
use crate::error::{CodecError, ConvertError};
use crate::format::Format;
use crate::governor::{GovernorReport, MemorySampler, PerformanceGovernor, ProcessMemorySampler};
use crate::job::ConversionJob;
use crate::pipeline::{ChunkedPipeline, ProgressFn, TilingPolicy};
use crate::recovery::{ErrorContext, ErrorRecord, ErrorStats, Recovery, RecoveryEngine};
use crate::request::ConversionRequest;
use crate::router::{ConversionRoute, FormatGraph};
use crate::telemetry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub format: Format,
    pub size_bytes: usize,
    pub width: u32,
    pub height: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub duration_ms: u64,
    pub memory_delta_bytes: i64,
}

impl From<&GovernorReport> for PerformanceMetrics {
    fn from(report: &GovernorReport) -> Self {
        Self {
            duration_ms: report.duration_ms,
            memory_delta_bytes: report.memory_delta_bytes,
        }
    }
}

/// Successful conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    #[serde(skip)]
    pub encoded_bytes: Vec<u8>,
    pub route: Vec<Format>,
    pub metadata: ResultMetadata,
    pub performance: PerformanceMetrics,
    pub job_id: String,
    /// True when this result came from a retry after a failure.
    pub recovered: bool,
}

pub struct ConversionEngine {
    config: EngineConfig,
    graph: FormatGraph,
    pipeline: ChunkedPipeline,
    governor: PerformanceGovernor,
    recovery: RecoveryEngine,
}

impl ConversionEngine {
    /// Builds an engine with the default format graph and a process memory
    /// sampler.
    pub fn new(codec: Arc<dyn Codec>, config: EngineConfig) -> Result<Self, ConvertError> {
        config.validate()?;
        let pipeline = ChunkedPipeline::new(codec, TilingPolicy::from_config(&config));
        let governor =
            PerformanceGovernor::new(Arc::new(ProcessMemorySampler::new()), config.soft_memory_ratio);
        let recovery = RecoveryEngine::new(&config);
        Ok(Self::from_parts(config, FormatGraph::default(), pipeline, governor, recovery))
    }

    /// Assembles an engine from explicitly constructed collaborators.
    pub fn from_parts(
        config: EngineConfig,
        graph: FormatGraph,
        pipeline: ChunkedPipeline,
        governor: PerformanceGovernor,
        recovery: RecoveryEngine,
    ) -> Self {
        Self {
            config,
            graph,
            pipeline,
            governor,
            recovery,
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.governor = PerformanceGovernor::new(sampler, self.config.soft_memory_ratio);
        self
    }

    pub fn with_graph(mut self, graph: FormatGraph) -> Self {
        self.graph = graph;
        self
    }

    pub fn set_progress(&mut self, on_progress: Option<ProgressFn>) {
        self.pipeline.set_progress(on_progress);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn route(&self, from: Format, to: Format) -> Result<ConversionRoute, ConvertError> {
        self.graph.route(from, to)
    }

    pub fn stats(&self) -> &ErrorStats {
        self.recovery.stats()
    }

    pub fn recent_errors(&self, n: usize) -> Vec<&ErrorRecord> {
        self.recovery.recent(n)
    }

    pub fn clear_history(&mut self) {
        self.recovery.clear_history();
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub async fn convert(
        &mut self,
        request: ConversionRequest,
    ) -> Result<ConversionResult, ErrorRecord> {
        self.convert_with_token(request, &CancellationToken::new())
            .await
    }

    /// Converts `request`; cancelling `token` aborts at the next suspension
    /// point.
    pub async fn convert_with_token(
        &mut self,
        request: ConversionRequest,
        token: &CancellationToken,
    ) -> Result<ConversionResult, ErrorRecord> {
        let mut context = ErrorContext {
            from: Some(request.from_format),
            to: Some(request.to_format),
            options: Some(request.options.clone()),
            ..ErrorContext::new("convert")
        };

        let route = match self.prepare(&request) {
            Ok(route) => route,
            Err(error) => return Err(self.reject(&request, &error, context)),
        };
        context.route = route.formats().to_vec();

        let mut job = ConversionJob::new(&request);
        context.job_id = Some(job.job_id.clone());
        info!(job_id = %job.job_id, route = %route, "Starting conversion");

        let Self {
            config,
            pipeline,
            governor,
            recovery,
            ..
        } = self;

        let error = match execute(pipeline, governor, config, &route, &request, &mut job, token).await
        {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        context.output_size = pipeline.last_output_size();
        context.chunk = error.chunk();
        let failed_job = &job;
        let outcome = recovery
            .handle(&error, context, |plan| async move {
                pipeline.release();
                let mut retry_job = failed_job
                    .spawn_retry(plan.options.clone())
                    .map_err(|e| ConvertError::Processing(e.to_string()))?;
                let retry_request = request.with_options(plan.options);
                execute(
                    pipeline,
                    governor,
                    config,
                    &route,
                    &retry_request,
                    &mut retry_job,
                    token,
                )
                .await
            })
            .await;

        telemetry::record_error(outcome.record());
        match outcome {
            Recovery::Recovered { mut value, .. } => {
                value.recovered = true;
                Ok(value)
            }
            Recovery::Unrecovered(record) => Err(record),
        }
    }

    /// Retries a failed conversion by hand. Shares the record's attempt
    /// budget with automatic recovery; once spent, the record comes back
    /// unchanged.
    pub async fn retry(
        &mut self,
        record: &ErrorRecord,
        request: ConversionRequest,
    ) -> Result<ConversionResult, ErrorRecord> {
        if !self.recovery.begin_manual_attempt(&record.id) {
            debug!(error_id = %record.id, "Manual retry refused");
            return Err(self.current_record(record));
        }

        let context = ErrorContext {
            from: Some(request.from_format),
            to: Some(request.to_format),
            options: Some(request.options.clone()),
            ..ErrorContext::new("retry")
        };
        let route = match self.prepare(&request) {
            Ok(route) => route,
            Err(error) => return Err(self.reject(&request, &error, context)),
        };

        self.pipeline.release();
        let mut job = ConversionJob::new(&request);
        job.parent_job_id = record.context.job_id.clone();
        job.attempt = u8::try_from(self.recovery.attempts(&record.id) + 1).unwrap_or(u8::MAX);

        let token = CancellationToken::new();
        let result = execute(
            &mut self.pipeline,
            &self.governor,
            &self.config,
            &route,
            &request,
            &mut job,
            &token,
        )
        .await;

        match result {
            Ok(mut value) => {
                value.recovered = true;
                if let Some(updated) = self.recovery.mark_recovered(&record.id) {
                    telemetry::record_error(&updated);
                }
                Ok(value)
            }
            Err(error) => {
                debug!(error_id = %record.id, error = %error, "Manual retry failed");
                Err(self.current_record(record))
            }
        }
    }

    /// Fail-fast checks run before any buffer is allocated.
    fn prepare(&self, request: &ConversionRequest) -> Result<ConversionRoute, ConvertError> {
        request.validate()?;
        let route = self.graph.route(request.from_format, request.to_format)?;
        let codec = self.pipeline.codec();
        if let Some(&format) = route.formats().iter().find(|&&f| !codec.supports(f)) {
            return Err(CodecError::Unavailable(format).into());
        }
        Ok(route)
    }

    fn reject(
        &mut self,
        request: &ConversionRequest,
        error: &ConvertError,
        context: ErrorContext,
    ) -> ErrorRecord {
        let mut job = ConversionJob::new(request);
        if job.mark_failed(error.to_string()).is_ok() {
            telemetry::record_job_telemetry(&job, None);
        }
        let record = self.recovery.record(error, context);
        telemetry::record_error(&record);
        record
    }

    fn current_record(&self, record: &ErrorRecord) -> ErrorRecord {
        self.recovery
            .find(&record.id)
            .cloned()
            .unwrap_or_else(|| record.clone())
    }
}

/// Runs one job over the whole route inside a governed scope.
async fn execute(
    pipeline: &mut ChunkedPipeline,
    governor: &PerformanceGovernor,
    config: &EngineConfig,
    route: &ConversionRoute,
    request: &ConversionRequest,
    job: &mut ConversionJob,
    token: &CancellationToken,
) -> Result<ConversionResult, ConvertError> {
    let job_error = |e: crate::job::JobError| ConvertError::Processing(e.to_string());
    job.start_processing(route.formats()).map_err(job_error)?;

    let stage_pipeline = &mut *pipeline;
    let governed = governor
        .run_with_governance(token, config.timeout(), config.memory_cap_bytes, |scope| {
            async move { stage_pipeline.run_route(route, request, &scope).await }
        })
        .await;
    let report = governed.report;

    match governed.result {
        Ok(stage) => {
            job.mark_completed().map_err(job_error)?;
            telemetry::record_job_telemetry(job, Some(&report));
            Ok(ConversionResult {
                route: route.formats().to_vec(),
                metadata: ResultMetadata {
                    format: stage.format,
                    size_bytes: stage.bytes.len(),
                    width: stage.width,
                    height: stage.height,
                    timestamp: Utc::now(),
                },
                performance: PerformanceMetrics::from(&report),
                job_id: job.job_id.clone(),
                recovered: false,
                encoded_bytes: stage.bytes,
            })
        }
        Err(error) => {
            pipeline.release();
            job.mark_failed(error.to_string()).map_err(job_error)?;
            telemetry::record_job_telemetry(job, Some(&report));
            Err(error)
        }
    }
}
