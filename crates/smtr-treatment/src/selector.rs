use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Timelike};
use chrono_tz::Tz;
use serde::Serialize;
use smtr_capture::SourceDescriptor;
use smtr_core::config::{DbtTestConfig, SelectorConfig};

use crate::error::{Result, TreatmentError};

const SOURCE_PREFIX: &str = "source:";
const SELECTOR_PREFIX: &str = "selector:";

/// An input a selector reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum DataSource {
    /// A captured table, as `<source_name>.<table_id>`.
    Source(String),
    /// Another selector, by name.
    Selector(String),
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Source(name) => write!(f, "{SOURCE_PREFIX}{name}"),
            DataSource::Selector(name) => write!(f, "{SELECTOR_PREFIX}{name}"),
        }
    }
}

impl FromStr for DataSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix(SOURCE_PREFIX) {
            match name.split_once('.') {
                Some((source, table)) if !source.is_empty() && !table.is_empty() => {
                    Ok(DataSource::Source(name.to_string()))
                }
                _ => Err(format!("'{s}' must look like source:<source_name>.<table_id>")),
            }
        } else if let Some(name) = s.strip_prefix(SELECTOR_PREFIX) {
            if name.is_empty() {
                return Err(format!("'{s}' names no selector"));
            }
            Ok(DataSource::Selector(name.to_string()))
        } else {
            Err(format!("'{s}' must start with {SOURCE_PREFIX} or {SELECTOR_PREFIX}"))
        }
    }
}

/// Data-quality tests run after a materialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbtTest {
    pub test_select: String,
    pub truncate_date: bool,
    /// Local time of day at which scheduled runs also run the tests.
    pub test_scheduled_time: Option<NaiveTime>,
}

impl DbtTest {
    fn from_config(selector: &str, config: &DbtTestConfig) -> Result<Self> {
        if config.test_select.trim().is_empty() {
            return Err(invalid(selector, "post_test.test_select must not be empty"));
        }
        let test_scheduled_time = config
            .test_scheduled_time
            .as_deref()
            .map(|t| {
                NaiveTime::parse_from_str(t, "%H:%M").map_err(|_| {
                    invalid(selector, &format!("post_test.test_scheduled_time '{t}' is not HH:MM"))
                })
            })
            .transpose()?;
        Ok(Self {
            test_select: config.test_select.clone(),
            truncate_date: config.truncate_date,
            test_scheduled_time,
        })
    }

    /// Whether a run scheduled at `scheduled` should also run the tests.
    pub fn is_due(&self, scheduled: &DateTime<Tz>, force: bool) -> bool {
        if force {
            return true;
        }
        match self.test_scheduled_time {
            Some(at) => scheduled.hour() == at.hour() && scheduled.minute() == at.minute(),
            None => false,
        }
    }
}

/// A named dbt selector and the inputs it depends on.
#[derive(Debug, Clone, Serialize)]
pub struct DbtSelector {
    name: String,
    #[serde(serialize_with = "serialize_ts")]
    initial_datetime: DateTime<Tz>,
    flow_folder_name: Option<String>,
    incremental_delay_hours: i64,
    data_sources: Vec<DataSource>,
    post_test: Option<DbtTest>,
}

fn serialize_ts<S: serde::Serializer>(
    ts: &DateTime<Tz>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&smtr_core::format_timestamp(ts))
}

impl DbtSelector {
    /// Validate a config file entry. References are checked later, against
    /// the full set of sources and selectors, by [`build_selectors`].
    pub fn from_config(config: &SelectorConfig) -> Result<Self> {
        let name = config.name.as_str();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(invalid(name, "name may only contain [a-z0-9_]"));
        }
        if config.incremental_delay_hours < 0 {
            return Err(invalid(name, "incremental_delay_hours must not be negative"));
        }

        let initial_datetime = smtr_core::parse_timestamp(&config.initial_datetime)
            .map_err(|e| invalid(name, &e.to_string()))?;

        let mut data_sources = Vec::with_capacity(config.data_sources.len());
        for entry in &config.data_sources {
            let source: DataSource = entry.parse().map_err(|e: String| invalid(name, &e))?;
            if source == DataSource::Selector(name.to_string()) {
                return Err(invalid(name, "a selector cannot depend on itself"));
            }
            if !data_sources.contains(&source) {
                data_sources.push(source);
            }
        }

        let post_test = config
            .post_test
            .as_ref()
            .map(|t| DbtTest::from_config(name, t))
            .transpose()?;

        Ok(Self {
            name: name.to_string(),
            initial_datetime,
            flow_folder_name: config.flow_folder_name.clone(),
            incremental_delay_hours: config.incremental_delay_hours,
            data_sources,
            post_test,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_datetime(&self) -> &DateTime<Tz> {
        &self.initial_datetime
    }

    pub fn flow_folder_name(&self) -> Option<&str> {
        self.flow_folder_name.as_deref()
    }

    pub fn incremental_delay_hours(&self) -> i64 {
        self.incremental_delay_hours
    }

    pub fn data_sources(&self) -> &[DataSource] {
        &self.data_sources
    }

    pub fn post_test(&self) -> Option<&DbtTest> {
        self.post_test.as_ref()
    }

    /// Qualified names (`source.table`) of the captured tables read.
    pub fn source_dependencies(&self) -> impl Iterator<Item = &str> {
        self.data_sources.iter().filter_map(|d| match d {
            DataSource::Source(name) => Some(name.as_str()),
            DataSource::Selector(_) => None,
        })
    }

    pub fn selector_dependencies(&self) -> impl Iterator<Item = &str> {
        self.data_sources.iter().filter_map(|d| match d {
            DataSource::Selector(name) => Some(name.as_str()),
            DataSource::Source(_) => None,
        })
    }
}

/// Validated selectors keyed by name.
///
/// Every `source:` reference must name a configured source and every
/// `selector:` reference another configured selector.
pub fn build_selectors(
    configs: &[SelectorConfig],
    sources: &HashMap<String, Arc<SourceDescriptor>>,
) -> Result<HashMap<String, Arc<DbtSelector>>> {
    let mut selectors = HashMap::with_capacity(configs.len());
    for config in configs {
        let selector = DbtSelector::from_config(config)?;
        let name = selector.name().to_string();
        if selectors.insert(name.clone(), Arc::new(selector)).is_some() {
            return Err(invalid(&name, "declared more than once"));
        }
    }

    for selector in selectors.values() {
        for qualified in selector.source_dependencies() {
            if !sources.values().any(|s| s.qualified_name() == qualified) {
                return Err(invalid(
                    selector.name(),
                    &format!("unknown data source {SOURCE_PREFIX}{qualified}"),
                ));
            }
        }
        for upstream in selector.selector_dependencies() {
            if !selectors.contains_key(upstream) {
                return Err(invalid(
                    selector.name(),
                    &format!("unknown data source {SELECTOR_PREFIX}{upstream}"),
                ));
            }
        }
    }
    Ok(selectors)
}

fn invalid(name: &str, reason: &str) -> TreatmentError {
    TreatmentError::InvalidSelector {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
