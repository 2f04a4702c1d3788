//! Core tabular model, report definitions and pure data transforms for the report gateway.

pub mod env;
pub mod error;
pub mod frame;
pub mod normalize;
pub mod report;
pub mod table;

pub use error::{CacheError, ConfigError, GatewayError, SourceError};
pub use frame::{apply_filters, paginate, scope_by_entity, PageInfo};
pub use normalize::normalize;
pub use report::{
    resolve_cache_policy, CachePolicy, DataPolicy, EndpointSpec, MstrLocator, ReportCatalog,
    ReportDefinition, SourceLocator, TableRef, SUMMARY_INFO_TYPE,
};
pub use table::{Cell, Snapshot, Table};

pub const CRATE_NAME: &str = "rdg-core";

/// Query parameter that carries the entity (agency) code into source filters.
pub const ENTITY_FILTER_PARAM: &str = "agency_name";

/// Query keys that drive paging and dispatch and are never treated as filters.
pub const RESERVED_QUERY_KEYS: [&str; 4] = ["page", "page_size", "per_page", "info_type"];

pub fn is_reserved_query_key(key: &str) -> bool {
    RESERVED_QUERY_KEYS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(key))
}
