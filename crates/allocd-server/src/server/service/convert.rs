//! Conversions between protobuf messages and domain types.

use allocd_core::{
    Error, Result, proto,
    types::{LogLevel, LogOrder, TaskLog, TaskLogFields},
};

pub fn log_level_from_proto(raw: i32) -> Result<LogLevel> {
    let level = proto::LogLevel::try_from(raw)
        .map_err(|_| Error::invalid(format!("unknown log level: {raw}")))?;
    match level {
        proto::LogLevel::Trace => Ok(LogLevel::Trace),
        proto::LogLevel::Debug => Ok(LogLevel::Debug),
        proto::LogLevel::Info => Ok(LogLevel::Info),
        proto::LogLevel::Warning => Ok(LogLevel::Warning),
        proto::LogLevel::Error => Ok(LogLevel::Error),
        proto::LogLevel::Critical => Ok(LogLevel::Critical),
        proto::LogLevel::Unspecified => Err(Error::invalid("log level must be specified")),
    }
}

pub const fn log_level_to_proto(level: LogLevel) -> proto::LogLevel {
    match level {
        LogLevel::Trace => proto::LogLevel::Trace,
        LogLevel::Debug => proto::LogLevel::Debug,
        LogLevel::Info => proto::LogLevel::Info,
        LogLevel::Warning => proto::LogLevel::Warning,
        LogLevel::Error => proto::LogLevel::Error,
        LogLevel::Critical => proto::LogLevel::Critical,
    }
}

/// Unspecified ordering means ascending.
pub fn log_order_from_proto(raw: i32) -> Result<LogOrder> {
    match proto::OrderBy::try_from(raw) {
        Ok(proto::OrderBy::Unspecified | proto::OrderBy::Asc) => Ok(LogOrder::Ascending),
        Ok(proto::OrderBy::Desc) => Ok(LogOrder::Descending),
        Err(_) => Err(Error::invalid(format!("unknown order: {raw}"))),
    }
}

pub fn task_log_to_proto(log: TaskLog) -> proto::TaskLogsResponse {
    proto::TaskLogsResponse {
        id: log.id,
        task_id: log.task_id.to_string(),
        allocation_id: log.allocation_id.map(|id| id.to_string()),
        agent_id: log.agent_id,
        container_id: log.container_id,
        rank_id: log.rank_id,
        timestamp: Some(log.timestamp.into()),
        level: log_level_to_proto(log.level) as i32,
        log: log.log,
        source: log.source,
        stdtype: log.stdtype,
    }
}

pub fn task_log_fields_to_proto(fields: TaskLogFields) -> proto::TaskLogsFieldsResponse {
    proto::TaskLogsFieldsResponse {
        allocation_ids: fields.allocation_ids.into_iter().collect(),
        agent_ids: fields.agent_ids.into_iter().collect(),
        container_ids: fields.container_ids.into_iter().collect(),
        rank_ids: fields.rank_ids.into_iter().collect(),
        stdtypes: fields.stdtypes.into_iter().collect(),
        sources: fields.sources.into_iter().collect(),
    }
}
