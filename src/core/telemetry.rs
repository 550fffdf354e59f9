use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::Settings;
use crate::db::types::LogLevel;
use crate::db::Backend;
use crate::models::logs::{LogContext, LogRecord};

pub(crate) fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.telemetry().log_level.clone()));

    let builder = fmt().with_env_filter(filter).with_target(false);

    if settings.telemetry().json {
        builder
            .json()
            .with_span_events(fmt::format::FmtSpan::CLOSE)
            .try_init()
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    } else if settings.telemetry().pretty {
        builder
            .pretty()
            .with_span_events(fmt::format::FmtSpan::CLOSE)
            .try_init()
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    } else {
        builder
            .with_span_events(fmt::format::FmtSpan::CLOSE)
            .try_init()
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    }

    Ok(())
}

/// Emit a tracing event and, at or above `min_level`, store the record in the backend.
pub(crate) async fn log_record(
    backend: &dyn Backend,
    min_level: LogLevel,
    level: LogLevel,
    message: &str,
    context: LogContext,
) {
    let record = LogRecord::new(level, message, context);
    emit(&record);

    if level == LogLevel::Off || level < min_level || min_level == LogLevel::Off {
        return;
    }

    if let Err(err) = backend.log_record(&record).await {
        tracing::warn!(error = %err, "Failed to store log record");
    }
}

fn emit(record: &LogRecord) {
    let course = record.course.as_deref().unwrap_or_default();
    let assignment = record.assignment.as_deref().unwrap_or_default();
    let user = record.user.as_deref().unwrap_or_default();
    let error = record.error.as_deref().unwrap_or_default();

    macro_rules! event {
        ($level:ident) => {
            tracing::$level!(
                course_id = course,
                assignment_id = assignment,
                user = user,
                error = error,
                "{}",
                record.message
            )
        };
    }

    match record.level {
        LogLevel::Trace => event!(trace),
        LogLevel::Debug => event!(debug),
        LogLevel::Info => event!(info),
        LogLevel::Warn => event!(warn),
        LogLevel::Error | LogLevel::Fatal => event!(error),
        LogLevel::Off => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryBackend;
    use crate::models::logs::LogQuery;

    #[tokio::test]
    async fn records_below_threshold_are_not_stored() {
        let backend = MemoryBackend::new();

        log_record(&backend, LogLevel::Info, LogLevel::Debug, "quiet", LogContext::default()).await;
        log_record(
            &backend,
            LogLevel::Info,
            LogLevel::Warn,
            "loud",
            LogContext::course("course101").with_user("course-student@test.edulinq.org"),
        )
        .await;

        let records = backend
            .get_log_records(&LogQuery { level: LogLevel::Trace, ..LogQuery::default() })
            .await
            .expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "loud");
        assert_eq!(records[0].course.as_deref(), Some("course101"));
    }
}
