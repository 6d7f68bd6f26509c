//! Error classification and bounded recovery.
//!
//! Failures are classified against a fixed, ordered rule table where the
//! first matching rule wins. A classified failure may earn one automatic
//! retry with adjusted options; every record has a hard cap on total
//! attempts, manual retries included. Records land in a bounded FIFO
//! history and feed running statistics.

use crate::chunk::Chunk;
use crate::config::EngineConfig;
use crate::error::{ConvertError, ErrorKind};
use crate::format::Format;
use crate::request::{ConversionOptions, MIN_QUALITY};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    File,
    Conversion,
    System,
    /// The host environment, e.g. a missing codec capability.
    Browser,
    Unknown,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::File => "file",
            Category::Conversion => "conversion",
            Category::System => "system",
            Category::Browser => "browser",
            Category::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// What a classification rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    /// Case-insensitive substring of the error message.
    Message(&'static str),
    /// The error's own taxonomy kind.
    Kind(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationRule {
    pub matcher: Matcher,
    pub kind: ErrorKind,
    pub category: Category,
    pub severity: Severity,
    pub user_facing: bool,
}

const fn rule(
    matcher: Matcher,
    kind: ErrorKind,
    category: Category,
    severity: Severity,
    user_facing: bool,
) -> ClassificationRule {
    ClassificationRule {
        matcher,
        kind,
        category,
        severity,
        user_facing,
    }
}

use Category as C;
use ErrorKind as K;
use Matcher::{Kind, Message};
use Severity::{Error as E, Warning as W};

/// Ordered classification table. Message rules come first so a foreign
/// failure text (a codec reporting "out of memory", say) beats the kind of
/// the wrapper it arrived in.
pub const CLASSIFICATION_TABLE: &[ClassificationRule] = &[
    rule(Message("out of memory"), K::MemoryError, C::System, E, true),
    rule(Message("allocation failed"), K::MemoryError, C::System, E, true),
    rule(Message("memory budget exceeded"), K::MemoryError, C::System, E, true),
    rule(Message("timed out"), K::TimeoutError, C::System, W, true),
    rule(Message("timeout"), K::TimeoutError, C::System, W, true),
    rule(Message("exceeds maximum dimension"), K::SizeError, C::File, W, true),
    rule(Message("too large"), K::SizeError, C::File, W, true),
    rule(Message("codec unavailable"), K::ProcessingError, C::Browser, E, true),
    rule(Message("not supported"), K::UnsupportedFormat, C::File, E, true),
    rule(Message("failed to decode"), K::ConversionFailed, C::File, E, true),
    rule(Kind(K::UnsupportedFormat), K::UnsupportedFormat, C::File, E, true),
    rule(Kind(K::UnsupportedRoute), K::UnsupportedRoute, C::Conversion, E, true),
    rule(Kind(K::InvalidOptions), K::InvalidOptions, C::Conversion, W, true),
    rule(Kind(K::SizeError), K::SizeError, C::File, W, true),
    rule(Kind(K::MemoryError), K::MemoryError, C::System, E, true),
    rule(Kind(K::TimeoutError), K::TimeoutError, C::System, W, true),
    rule(Kind(K::ConversionFailed), K::ConversionFailed, C::Conversion, E, true),
    rule(Kind(K::ProcessingError), K::ProcessingError, C::System, E, false),
];

const FALLBACK: ClassificationRule =
    rule(Kind(K::ProcessingError), K::ProcessingError, C::Unknown, E, false);

/// Remediation text per kind.
const SOLUTIONS: &[(ErrorKind, &str)] = &[
    (K::UnsupportedFormat, "Use one of the supported formats: SVG, PNG, JPG, WEBP or GIF."),
    (K::UnsupportedRoute, "Convert to PNG first, then convert the PNG to the format you need."),
    (K::InvalidOptions, "Check the quality (10-100), dimensions and background colour settings."),
    (K::SizeError, "Choose smaller output dimensions or a smaller source image."),
    (K::MemoryError, "Close other applications or convert at a smaller size."),
    (K::TimeoutError, "Try a smaller output size or lower quality."),
    (K::ConversionFailed, "The image may be corrupted. Re-export it and try again."),
    (K::ProcessingError, "An unexpected problem occurred. Try again or use a different image."),
];

/// Result of running an error through the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub category: Category,
    pub severity: Severity,
    pub user_facing: bool,
}

/// Classifies `error`: first matching rule of [`CLASSIFICATION_TABLE`] wins.
pub fn classify(error: &ConvertError) -> Classification {
    classify_parts(&error.to_string(), Some(error.kind()))
}

/// Classifies a bare message, e.g. from a host error with no kind.
pub fn classify_message(message: &str) -> Classification {
    classify_parts(message, None)
}

fn classify_parts(message: &str, kind: Option<ErrorKind>) -> Classification {
    let lowered = message.to_lowercase();
    let rule = CLASSIFICATION_TABLE
        .iter()
        .find(|rule| match rule.matcher {
            Matcher::Message(pattern) => lowered.contains(pattern),
            Matcher::Kind(k) => kind == Some(k),
        })
        .unwrap_or(&FALLBACK);
    Classification {
        kind: rule.kind,
        category: rule.category,
        severity: rule.severity,
        user_facing: rule.user_facing,
    }
}

pub fn suggestion_for(kind: ErrorKind) -> &'static str {
    SOLUTIONS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, text)| *text)
        .unwrap_or("Try again.")
}

/// Where an error happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: String,
    pub job_id: Option<String>,
    pub from: Option<Format>,
    pub to: Option<Format>,
    pub route: Vec<Format>,
    pub options: Option<ConversionOptions>,
    /// Output size the failed stage had resolved, when known.
    pub output_size: Option<(u32, u32)>,
    pub chunk: Option<Chunk>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub category: Category,
    pub user_facing: bool,
    pub suggestion: String,
    pub context: ErrorContext,
    /// False for fatal and validation failures.
    pub retryable: bool,
    pub recovery_attempted: bool,
    pub recovered: bool,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.kind, self.message, self.suggestion)
    }
}

impl std::error::Error for ErrorRecord {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Release scratch and caches, retry unchanged.
    ReleaseAndRetry,
    /// Shrink output and lower quality.
    ReduceWorkload,
    /// Rescale output to the largest allowed size.
    ClampToMaximum,
}

/// Adjusted options for a single automatic retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPlan {
    pub strategy: RecoveryStrategy,
    pub options: ConversionOptions,
}

/// Outcome of [`RecoveryEngine::handle`].
#[derive(Debug)]
pub enum Recovery<T> {
    Recovered { value: T, record: ErrorRecord },
    Unrecovered(ErrorRecord),
}

impl<T> Recovery<T> {
    pub fn record(&self) -> &ErrorRecord {
        match self {
            Recovery::Recovered { record, .. } | Recovery::Unrecovered(record) => record,
        }
    }

    pub fn into_result(self) -> Result<T, ErrorRecord> {
        match self {
            Recovery::Recovered { value, .. } => Ok(value),
            Recovery::Unrecovered(record) => Err(record),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub recovered_errors: u64,
    pub by_category: BTreeMap<Category, u64>,
    pub by_kind: BTreeMap<ErrorKind, u64>,
}

impl ErrorStats {
    pub fn recovery_rate(&self) -> f64 {
        if self.total_errors == 0 {
            0.0
        } else {
            self.recovered_errors as f64 / self.total_errors as f64
        }
    }
}

/// Classifies failures, runs at most one automatic retry per failure, and
/// keeps a bounded history.
pub struct RecoveryEngine {
    history: VecDeque<ErrorRecord>,
    history_cap: usize,
    attempts: HashMap<String, u32>,
    max_attempts: u32,
    stats: ErrorStats,
    shrink_factor: f64,
    quality_step: u8,
    max_dimension: u32,
}

impl RecoveryEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_cap),
            history_cap: config.history_cap.max(1),
            attempts: HashMap::new(),
            max_attempts: config.max_recovery_attempts,
            stats: ErrorStats::default(),
            shrink_factor: config.timeout_shrink_factor,
            quality_step: config.timeout_quality_step,
            max_dimension: config.max_dimension,
        }
    }

    /// Records a failure that gets no automatic retry, e.g. a validation
    /// error raised before any work started.
    pub fn record(&mut self, error: &ConvertError, context: ErrorContext) -> ErrorRecord {
        let record = self.open(error, context);
        self.close(record.clone());
        record
    }

    /// Classifies `error` and, when a recovery strategy applies and the
    /// attempt budget allows, invokes `retry` once with adjusted options.
    ///
    /// On success the retried value replaces the failure and the record is
    /// marked recovered. Otherwise the record is returned as classified from
    /// the original error.
    pub async fn handle<T, F, Fut>(
        &mut self,
        error: &ConvertError,
        context: ErrorContext,
        retry: F,
    ) -> Recovery<T>
    where
        F: FnOnce(RecoveryPlan) -> Fut,
        Fut: Future<Output = Result<T, ConvertError>>,
    {
        let mut record = self.open(error, context);

        let plan = if record.retryable {
            self.plan(record.kind, error, &record.context)
        } else {
            None
        };
        let Some(plan) = plan.filter(|_| self.begin_attempt(&record.id)) else {
            self.close(record.clone());
            return Recovery::Unrecovered(record);
        };

        record.recovery_attempted = true;
        warn!(
            error_id = %record.id,
            kind = %record.kind,
            strategy = ?plan.strategy,
            "Attempting automatic recovery"
        );

        match retry(plan).await {
            Ok(value) => {
                record.recovered = true;
                self.stats.recovered_errors += 1;
                info!(error_id = %record.id, kind = %record.kind, "Recovered from error");
                self.close(record.clone());
                Recovery::Recovered { value, record }
            }
            Err(retry_error) => {
                debug!(
                    error_id = %record.id,
                    retry_error = %retry_error,
                    "Automatic recovery failed"
                );
                self.close(record.clone());
                Recovery::Unrecovered(record)
            }
        }
    }

    /// Reserves one manual retry for `record_id`. Returns `false` when the
    /// record is unknown, not retryable, or its attempt budget is spent.
    pub fn begin_manual_attempt(&mut self, record_id: &str) -> bool {
        let retryable = self
            .history
            .iter()
            .any(|record| record.id == record_id && record.retryable);
        retryable && self.begin_attempt(record_id)
    }

    /// Marks a record in history as recovered after a successful manual
    /// retry.
    pub fn mark_recovered(&mut self, record_id: &str) -> Option<ErrorRecord> {
        let record = self.history.iter_mut().find(|record| record.id == record_id)?;
        record.recovery_attempted = true;
        if !record.recovered {
            record.recovered = true;
            self.stats.recovered_errors += 1;
        }
        Some(record.clone())
    }

    pub fn attempts(&self, record_id: &str) -> u32 {
        self.attempts.get(record_id).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> &ErrorStats {
        &self.stats
    }

    pub fn history(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.history.iter()
    }

    /// Up to `n` most recent records, newest first.
    pub fn recent(&self, n: usize) -> Vec<&ErrorRecord> {
        self.history.iter().rev().take(n).collect()
    }

    pub fn find(&self, record_id: &str) -> Option<&ErrorRecord> {
        self.history.iter().find(|record| record.id == record_id)
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.attempts.clear();
    }

    fn open(&mut self, error: &ConvertError, context: ErrorContext) -> ErrorRecord {
        let class = classify(error);
        self.stats.total_errors += 1;
        *self.stats.by_category.entry(class.category).or_default() += 1;
        *self.stats.by_kind.entry(class.kind).or_default() += 1;

        let record = ErrorRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            message: error.to_string(),
            kind: class.kind,
            severity: class.severity,
            category: class.category,
            user_facing: class.user_facing,
            suggestion: suggestion_for(class.kind).to_string(),
            context,
            retryable: !error.is_fatal() && !error.is_validation(),
            recovery_attempted: false,
            recovered: false,
        };
        self.attempts.insert(record.id.clone(), 0);
        record
    }

    fn close(&mut self, record: ErrorRecord) {
        self.history.push_back(record);
        while self.history.len() > self.history_cap {
            if let Some(evicted) = self.history.pop_front() {
                self.attempts.remove(&evicted.id);
            }
        }
    }

    fn begin_attempt(&mut self, record_id: &str) -> bool {
        match self.attempts.get_mut(record_id) {
            Some(count) if *count < self.max_attempts => {
                *count += 1;
                true
            }
            _ => false,
        }
    }

    fn plan(
        &self,
        kind: ErrorKind,
        error: &ConvertError,
        context: &ErrorContext,
    ) -> Option<RecoveryPlan> {
        let options = context.options.clone()?;
        match kind {
            ErrorKind::MemoryError => Some(RecoveryPlan {
                strategy: RecoveryStrategy::ReleaseAndRetry,
                options,
            }),
            ErrorKind::TimeoutError => Some(self.reduce_workload(options, context.output_size)),
            ErrorKind::SizeError => {
                let size = match error {
                    ConvertError::SizeLimit { width, height, .. } => Some((*width, *height)),
                    _ => context.output_size,
                }?;
                self.clamp_to_maximum(options, size)
            }
            _ => None,
        }
    }

    fn reduce_workload(
        &self,
        mut options: ConversionOptions,
        output_size: Option<(u32, u32)>,
    ) -> RecoveryPlan {
        let shrink = |edge: u32| ((f64::from(edge) * self.shrink_factor).round() as u32).max(1);
        match (options.target_width, options.target_height, output_size) {
            (None, None, Some((w, h))) => {
                options.target_width = Some(shrink(w));
                options.target_height = Some(shrink(h));
            }
            (w, h, _) => {
                options.target_width = w.map(shrink);
                options.target_height = h.map(shrink);
            }
        }
        options.quality = options
            .quality
            .saturating_sub(self.quality_step)
            .max(MIN_QUALITY);
        RecoveryPlan {
            strategy: RecoveryStrategy::ReduceWorkload,
            options,
        }
    }

    fn clamp_to_maximum(
        &self,
        mut options: ConversionOptions,
        (width, height): (u32, u32),
    ) -> Option<RecoveryPlan> {
        let longest = width.max(height);
        if longest <= self.max_dimension {
            return None;
        }
        let scale = f64::from(self.max_dimension) / f64::from(longest);
        let fit = |edge: u32| {
            ((f64::from(edge) * scale).floor() as u32).clamp(1, self.max_dimension)
        };
        options.target_width = Some(fit(width));
        options.target_height = Some(fit(height));
        Some(RecoveryPlan {
            strategy: RecoveryStrategy::ClampToMaximum,
            options,
        })
    }
}
