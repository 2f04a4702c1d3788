//! Report definitions: how a report reaches its source and how it is cached.
//!
//! Endpoint files have accumulated several field vocabularies over time. All of
//! them are accepted on load and validated here into a [`ReportDefinition`],
//! whose [`SourceLocator`] only carries the fields its source actually needs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::error::ConfigError;

pub const SUMMARY_INFO_TYPE: &str = "summary";
pub const DEFAULT_PER_PAGE: usize = 100;

const LEGACY_CACHE_FLAG_KEY: &str = "is_csv_cached";
const ENDPOINTS_KEY: &str = "endpoints";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Always fetch live.
    #[default]
    None,
    /// Serve from the snapshot written by the refresher.
    Daily,
}

impl CachePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Daily => "daily",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "daily" => Some(Self::Daily),
            _ => None,
        }
    }

    pub fn is_cached(self) -> bool {
        self == Self::Daily
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a raw endpoint mapping to its effective cache policy.
///
/// An explicit `cache_policy` of `none`/`daily` wins. Otherwise the legacy
/// `is_csv_cached` flag is read as an integer, where anything unreadable counts
/// as `0`, and a positive value means `daily`. Never fails.
pub fn resolve_cache_policy(config: Option<&Value>) -> CachePolicy {
    let Some(Value::Mapping(map)) = config else {
        return CachePolicy::None;
    };

    if let Some(policy) = map
        .get("cache_policy")
        .and_then(Value::as_str)
        .and_then(CachePolicy::parse)
    {
        return policy;
    }

    if legacy_flag(map.get(LEGACY_CACHE_FLAG_KEY)) > 0 {
        CachePolicy::Daily
    } else {
        CachePolicy::None
    }
}

fn legacy_flag(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Some(Value::Bool(b)) => i64::from(*b),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataPolicy {
    #[serde(rename = "microstrategy")]
    MicroStrategy,
    #[serde(rename = "postgresql")]
    PostgreSql,
    #[serde(rename = "mssql")]
    MsSql,
}

impl DataPolicy {
    pub const ALL: [DataPolicy; 3] = [Self::MicroStrategy, Self::PostgreSql, Self::MsSql];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MicroStrategy => "microstrategy",
            Self::PostgreSql => "postgresql",
            Self::MsSql => "mssql",
        }
    }

    /// Accepts current names plus the legacy `behavior` values.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "microstrategy" | "mstr" | "livemstr" | "cachemstr" => Some(Self::MicroStrategy),
            "postgresql" | "postgres" | "pg" | "livepg" | "cachepg" => Some(Self::PostgreSql),
            "mssql" | "sql" | "livesql" | "cachesql" => Some(Self::MsSql),
            _ => None,
        }
    }
}

impl fmt::Display for DataPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_identifier(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A schema-qualified relational table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Result<Self, String> {
        for part in [schema, table] {
            if !is_identifier(part) {
                return Err(format!("'{part}' is not a valid identifier"));
            }
        }
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    /// Parses `schema.table` or a bare `table` in `default_schema`.
    pub fn parse(raw: &str, default_schema: &str) -> Result<Self, String> {
        let parts: Vec<&str> = raw.trim().split('.').map(str::trim).collect();
        match parts.as_slice() {
            [table] => Self::new(default_schema, table),
            [schema, table] => Self::new(schema, table),
            _ => Err(format!("'{raw}' is not a schema.table reference")),
        }
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MstrLocator {
    pub dossier_id: String,
    pub cube_id: Option<String>,
    /// info_type -> visualization key; only non-empty keys survive loading.
    pub viz_keys: BTreeMap<String, String>,
    /// request parameter -> backend attribute key.
    pub filter_mappings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "data_policy")]
pub enum SourceLocator {
    #[serde(rename = "microstrategy")]
    MicroStrategy(MstrLocator),
    #[serde(rename = "postgresql")]
    PostgreSql(TableRef),
    #[serde(rename = "mssql")]
    MsSql(TableRef),
}

impl SourceLocator {
    pub fn data_policy(&self) -> DataPolicy {
        match self {
            Self::MicroStrategy(_) => DataPolicy::MicroStrategy,
            Self::PostgreSql(_) => DataPolicy::PostgreSql,
            Self::MsSql(_) => DataPolicy::MsSql,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDefinition {
    pub name: String,
    pub description: Option<String>,
    pub cache_policy: CachePolicy,
    pub per_page: usize,
    /// Extra columns that accept `_beg_date`/`_end_date` range filters.
    pub date_columns: Vec<String>,
    pub source: SourceLocator,
}

impl ReportDefinition {
    pub fn data_policy(&self) -> DataPolicy {
        self.source.data_policy()
    }

    pub fn info_types(&self) -> Vec<String> {
        match &self.source {
            SourceLocator::MicroStrategy(mstr) => mstr.viz_keys.keys().cloned().collect(),
            SourceLocator::PostgreSql(_) | SourceLocator::MsSql(_) => {
                vec![SUMMARY_INFO_TYPE.to_string()]
            }
        }
    }

    pub fn supports_info_type(&self, info_type: &str) -> bool {
        match &self.source {
            SourceLocator::MicroStrategy(mstr) => mstr.viz_keys.contains_key(info_type),
            SourceLocator::PostgreSql(_) | SourceLocator::MsSql(_) => {
                info_type == SUMMARY_INFO_TYPE
            }
        }
    }

    pub fn requires_agency(&self) -> bool {
        match &self.source {
            SourceLocator::MicroStrategy(mstr) => {
                mstr.filter_mappings.contains_key(crate::ENTITY_FILTER_PARAM)
            }
            _ => false,
        }
    }

    pub fn available_filters(&self) -> Vec<String> {
        match &self.source {
            SourceLocator::MicroStrategy(mstr) => mstr.filter_mappings.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Validates one raw endpoint entry.
    pub fn from_value(name: &str, raw: &Value) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            report: name.to_string(),
            reason,
        };

        if name.trim().is_empty() || name.contains(|c: char| matches!(c, ':' | '/' | ' ')) {
            return Err(invalid("report names may not be empty or contain ':', '/' or spaces".into()));
        }
        if !matches!(raw, Value::Mapping(_)) {
            return Err(invalid("definition must be a mapping".into()));
        }

        let spec: EndpointSpec =
            serde_yaml::from_value(raw.clone()).map_err(|err| invalid(err.to_string()))?;

        let data_policy = match spec
            .data_policy
            .as_deref()
            .or(spec.source.as_deref())
            .or(spec.behavior.as_deref())
        {
            Some(raw_policy) => DataPolicy::parse(raw_policy)
                .ok_or_else(|| invalid(format!("unknown data policy '{raw_policy}'")))?,
            None => DataPolicy::MicroStrategy,
        };

        let per_page = match spec
            .per_page
            .as_ref()
            .or(spec.pagination.as_ref().and_then(|p| p.per_page.as_ref()))
        {
            None | Some(Value::Null) => DEFAULT_PER_PAGE,
            Some(value) => scalar_string(value)
                .and_then(|s| s.trim().parse::<usize>().ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| invalid("per_page must be a positive integer".into()))?,
        };

        let source = match data_policy {
            DataPolicy::MicroStrategy => SourceLocator::MicroStrategy(spec.mstr_locator().map_err(invalid)?),
            DataPolicy::PostgreSql => SourceLocator::PostgreSql(
                spec.table_ref(spec.postgres_table.as_deref(), spec.postgresql.as_ref(), "public")
                    .map_err(invalid)?,
            ),
            DataPolicy::MsSql => SourceLocator::MsSql(
                spec.table_ref(spec.mssql_table.as_deref(), spec.mssql.as_ref(), "dbo")
                    .map_err(invalid)?,
            ),
        };

        Ok(Self {
            name: name.to_string(),
            description: spec.description.filter(|d| !d.trim().is_empty()),
            cache_policy: resolve_cache_policy(Some(raw)),
            per_page,
            date_columns: spec.date_columns,
            source,
        })
    }
}

/// Raw endpoint entry in any of the accepted field vocabularies.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointSpec {
    pub data_policy: Option<String>,
    pub source: Option<String>,
    pub behavior: Option<String>,
    pub description: Option<String>,
    pub per_page: Option<Value>,
    pub pagination: Option<PaginationSpec>,
    pub dossier_id: Option<String>,
    pub cube_id: Option<String>,
    pub viz_keys: Option<BTreeMap<String, Value>>,
    pub filters: Option<BTreeMap<String, Value>>,
    pub mstr: Option<MstrSpec>,
    pub postgres_table: Option<String>,
    pub mssql_table: Option<String>,
    pub postgresql: Option<TableSpec>,
    pub mssql: Option<TableSpec>,
    pub date_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PaginationSpec {
    pub per_page: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MstrSpec {
    pub dossier_id: Option<String>,
    pub cube_id: Option<String>,
    pub viz_keys: Option<BTreeMap<String, Value>>,
    #[serde(alias = "filters")]
    pub filter_mappings: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TableSpec {
    pub schema: Option<String>,
    pub table: Option<String>,
}

impl EndpointSpec {
    fn mstr_locator(&self) -> Result<MstrLocator, String> {
        let nested = self.mstr.clone().unwrap_or_default();

        let dossier_id = nested
            .dossier_id
            .or_else(|| self.dossier_id.clone())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| "microstrategy reports need a dossier_id".to_string())?;
        if !is_identifier(&dossier_id) {
            return Err(format!("dossier_id '{dossier_id}' is not a valid identifier"));
        }

        let cube_id = nested
            .cube_id
            .or_else(|| self.cube_id.clone())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        if let Some(cube) = &cube_id {
            if !is_identifier(cube) {
                return Err(format!("cube_id '{cube}' is not a valid identifier"));
            }
        }

        let viz_keys = nested
            .viz_keys
            .or_else(|| self.viz_keys.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(info_type, key)| {
                let key = scalar_string(&key)?.trim().to_string();
                (!key.is_empty()).then(|| (info_type.trim().to_ascii_lowercase(), key))
            })
            .collect();

        let filter_mappings = nested
            .filter_mappings
            .or_else(|| self.filters.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(param, key)| {
                let key = scalar_string(&key)?.trim().to_string();
                (!key.is_empty()).then_some((param, key))
            })
            .collect();

        Ok(MstrLocator {
            dossier_id,
            cube_id,
            viz_keys,
            filter_mappings,
        })
    }

    fn table_ref(
        &self,
        flat: Option<&str>,
        nested: Option<&TableSpec>,
        default_schema: &str,
    ) -> Result<TableRef, String> {
        if let Some(raw) = flat.filter(|raw| !raw.trim().is_empty()) {
            return TableRef::parse(raw, default_schema);
        }
        match nested {
            Some(TableSpec {
                schema,
                table: Some(table),
            }) => {
                let schema = schema
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(default_schema);
                TableRef::new(schema, table.trim())
            }
            _ => Err("relational reports need a table reference".to_string()),
        }
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Extracts the `name -> definition` mapping from a parsed endpoints document.
///
/// Both a bare top-level mapping and one nested under `endpoints:` are accepted.
pub fn endpoint_entries(document: Value) -> Result<Mapping, ConfigError> {
    match document {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(mut root) => match root.remove(ENDPOINTS_KEY) {
            Some(Value::Mapping(entries)) => Ok(entries),
            Some(Value::Null) => Ok(Mapping::new()),
            Some(other) => {
                root.insert(Value::String(ENDPOINTS_KEY.to_string()), other);
                Ok(root)
            }
            None => Ok(root),
        },
        _ => Err(ConfigError::Parse(
            "endpoint config must be a mapping of report definitions".into(),
        )),
    }
}

/// Every report in the endpoints file, split into usable and rejected entries.
#[derive(Debug, Clone, Default)]
pub struct ReportCatalog {
    pub reports: BTreeMap<String, ReportDefinition>,
    /// report name -> reason it failed validation.
    pub rejected: BTreeMap<String, String>,
}

impl ReportCatalog {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let document: Value =
            serde_yaml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Ok(Self::from_entries(&endpoint_entries(document)?))
    }

    pub fn from_entries(entries: &Mapping) -> Self {
        let mut catalog = Self::default();
        for (key, raw) in entries {
            let Some(name) = scalar_string(key) else {
                catalog
                    .rejected
                    .insert(format!("{key:?}"), "report name must be a scalar".into());
                continue;
            };
            match ReportDefinition::from_value(&name, raw) {
                Ok(definition) => {
                    catalog.reports.insert(name, definition);
                }
                Err(err) => {
                    warn!(report = %name, error = %err, "rejecting endpoint definition");
                    catalog.rejected.insert(name, err.to_string());
                }
            }
        }
        catalog
    }

    pub fn get(&self, name: &str) -> Option<&ReportDefinition> {
        self.reports.get(name)
    }

    pub fn daily_reports(&self) -> impl Iterator<Item = &ReportDefinition> {
        self.reports
            .values()
            .filter(|report| report.cache_policy == CachePolicy::Daily)
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}
