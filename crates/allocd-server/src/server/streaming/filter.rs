//! Translation of a `TaskLogs` request into backend filter predicates.
//!
//! Empty lists and unset bounds produce no filter. Timestamps are validated
//! before anything reaches a backend: a malformed bound fails the whole
//! request with `InvalidRequest`.

use crate::server::service::convert::log_level_from_proto;
use allocd_core::{Error, Result, proto::TaskLogsRequest, types::LogLevel};
use prost_types::Timestamp;
use std::time::SystemTime;

/// Seconds of `0001-01-01T00:00:00Z` relative to the Unix epoch.
const MIN_VALID_SECONDS: i64 = -62_135_596_800;
/// Seconds of `10000-01-01T00:00:00Z` relative to the Unix epoch (exclusive).
const MAX_VALID_SECONDS: i64 = 253_402_300_800;

/// Filterable columns of a task log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogField {
    AllocationId,
    AgentId,
    ContainerId,
    RankId,
    Level,
    Stdtype,
    Source,
    Timestamp,
    Log,
}

impl LogField {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogField::AllocationId => "allocation_id",
            LogField::AgentId => "agent_id",
            LogField::ContainerId => "container_id",
            LogField::RankId => "rank_id",
            LogField::Level => "level",
            LogField::Stdtype => "stdtype",
            LogField::Source => "source",
            LogField::Timestamp => "timestamp",
            LogField::Log => "log",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    In,
    LessThanEqual,
    GreaterThan,
    Substring,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterValues {
    Strings(Vec<String>),
    Integers(Vec<i32>),
    Levels(Vec<LogLevel>),
    Time(SystemTime),
    Text(String),
}

/// One predicate over a log field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    pub field: LogField,
    pub op: FilterOp,
    pub values: FilterValues,
}

impl Filter {
    fn within(field: LogField, values: FilterValues) -> Self {
        Self {
            field,
            op: FilterOp::In,
            values,
        }
    }
}

/// Builds the filter set for a `TaskLogs` request.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] when a timestamp bound is outside
/// `0001-01-01T00:00:00Z..10000-01-01T00:00:00Z` or has out-of-range nanos, or
/// when a level is not a known log level.
pub fn build_task_log_filters(req: &TaskLogsRequest) -> Result<Vec<Filter>> {
    let mut filters = Vec::new();

    let strings = [
        (LogField::AllocationId, &req.allocation_ids),
        (LogField::AgentId, &req.agent_ids),
        (LogField::ContainerId, &req.container_ids),
    ];
    for (field, values) in strings {
        if !values.is_empty() {
            filters.push(Filter::within(field, FilterValues::Strings(values.clone())));
        }
    }

    if !req.rank_ids.is_empty() {
        filters.push(Filter::within(
            LogField::RankId,
            FilterValues::Integers(req.rank_ids.clone()),
        ));
    }

    if !req.levels.is_empty() {
        let levels = req
            .levels
            .iter()
            .map(|&level| log_level_from_proto(level))
            .collect::<Result<Vec<_>>>()?;
        filters.push(Filter::within(LogField::Level, FilterValues::Levels(levels)));
    }

    for (field, values) in [
        (LogField::Stdtype, &req.stdtypes),
        (LogField::Source, &req.sources),
    ] {
        if !values.is_empty() {
            filters.push(Filter::within(field, FilterValues::Strings(values.clone())));
        }
    }

    if let Some(before) = &req.timestamp_before {
        filters.push(Filter {
            field: LogField::Timestamp,
            op: FilterOp::LessThanEqual,
            values: FilterValues::Time(checked_time(before, "timestamp_before")?),
        });
    }

    if let Some(after) = &req.timestamp_after {
        filters.push(Filter {
            field: LogField::Timestamp,
            op: FilterOp::GreaterThan,
            values: FilterValues::Time(checked_time(after, "timestamp_after")?),
        });
    }

    if !req.search_text.is_empty() {
        filters.push(Filter {
            field: LogField::Log,
            op: FilterOp::Substring,
            values: FilterValues::Text(req.search_text.clone()),
        });
    }

    Ok(filters)
}

fn checked_time(ts: &Timestamp, name: &str) -> Result<SystemTime> {
    if !(0..1_000_000_000).contains(&ts.nanos) {
        return Err(Error::invalid(format!(
            "{name} has out-of-range nanos: {}",
            ts.nanos
        )));
    }
    if ts.seconds < MIN_VALID_SECONDS {
        return Err(Error::invalid(format!(
            "{name} is before 0001-01-01: {}s",
            ts.seconds
        )));
    }
    if ts.seconds >= MAX_VALID_SECONDS {
        return Err(Error::invalid(format!(
            "{name} is after 9999-12-31: {}s",
            ts.seconds
        )));
    }
    SystemTime::try_from(ts.clone()).map_err(|e| Error::invalid(format!("{name}: {e}")))
}
