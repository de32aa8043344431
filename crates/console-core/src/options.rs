//! Translation of operator-supplied key query options into resolved requests.
//!
//! Operators type these options by hand, so numeric fields are lenient (an unparseable
//! value falls back to its default) while enumerations are strict (an unknown sort target
//! is rejected rather than silently replaced).

use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConsoleError, Result};
use crate::types::LeaseId;

/// Per-call timeout used when none (or garbage) is supplied.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lowest possible key, used to anchor open-ended scans.
pub const NULL_KEY: &[u8] = b"\0";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    None,
    Ascend,
    Descend,
}

impl FromStr for SortOrder {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "" => Ok(SortOrder::None),
            "ASCEND" => Ok(SortOrder::Ascend),
            "DESCEND" => Ok(SortOrder::Descend),
            _ => Err(ConsoleError::Validation(format!("bad sort order {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortTarget {
    #[default]
    Key,
    Create,
    Modify,
    Value,
    Version,
}

impl FromStr for SortTarget {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "" | "KEY" => Ok(SortTarget::Key),
            "CREATE" => Ok(SortTarget::Create),
            "MODIFY" => Ok(SortTarget::Modify),
            "VALUE" => Ok(SortTarget::Value),
            "VERSION" => Ok(SortTarget::Version),
            _ => Err(ConsoleError::Validation(format!("bad sort target {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Consistency {
    #[default]
    Linearizable,
    Serializable,
}

impl FromStr for Consistency {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "l" => Ok(Consistency::Linearizable),
            "s" => Ok(Consistency::Serializable),
            other => Err(ConsoleError::Validation(format!(
                "unknown \"consistency\" flag {other}"
            ))),
        }
    }
}

/// Timeout in whole seconds; anything unparseable or zero yields `default`.
pub fn parse_timeout(raw: Option<&str>, default: Duration) -> Duration {
    raw.and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Result limit; 0 means unbounded.
pub fn parse_limit(raw: Option<&str>) -> i64 {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|n| *n >= 0)
        .unwrap_or(0)
}

/// Revision to read at; 0 means latest.
pub fn parse_revision(raw: Option<&str>) -> i64 {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|n| *n >= 0)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeMode {
    Single,
    Prefix,
    FromKey,
    Until(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub key: Vec<u8>,
    pub mode: RangeMode,
}

/// Resolve the scanned key span. `prefix` and `from_key` win over an explicit range end.
pub fn resolve_range(
    key: &str,
    prefix: bool,
    from_key: bool,
    range_end: Option<&str>,
) -> Result<KeyRange> {
    if prefix && from_key {
        return Err(ConsoleError::Validation(
            "\"prefix\" and \"fromKey\" cannot be set at the same time, choose one".into(),
        ));
    }

    // An empty prefix matches everything; it cannot be sent as a literal prefix.
    if prefix {
        if key.is_empty() {
            return Ok(KeyRange {
                key: NULL_KEY.to_vec(),
                mode: RangeMode::FromKey,
            });
        }
        return Ok(KeyRange {
            key: key.as_bytes().to_vec(),
            mode: RangeMode::Prefix,
        });
    }

    if from_key {
        let key = if key.is_empty() {
            NULL_KEY.to_vec()
        } else {
            key.as_bytes().to_vec()
        };
        return Ok(KeyRange {
            key,
            mode: RangeMode::FromKey,
        });
    }

    if key.is_empty() {
        return Err(ConsoleError::Validation("key is required".into()));
    }

    let mode = match range_end {
        Some(end) if !end.is_empty() => RangeMode::Until(end.as_bytes().to_vec()),
        _ => RangeMode::Single,
    };
    Ok(KeyRange {
        key: key.as_bytes().to_vec(),
        mode,
    })
}

/// Raw `get` parameters as typed by an operator.
#[derive(Debug, Clone, Default)]
pub struct GetParams {
    pub prefix: bool,
    pub from_key: bool,
    pub range_end: Option<String>,
    pub limit: Option<String>,
    pub revision: Option<String>,
    pub sort_order: Option<String>,
    pub sort_target: Option<String>,
    pub consistency: Option<String>,
    pub keys_only: bool,
}

impl GetParams {
    pub fn parse(&self) -> Result<GetOptions> {
        Ok(GetOptions {
            prefix: self.prefix,
            from_key: self.from_key,
            range_end: self.range_end.clone(),
            limit: parse_limit(self.limit.as_deref()),
            revision: parse_revision(self.revision.as_deref()),
            sort_order: self.sort_order.as_deref().unwrap_or("").parse()?,
            sort_target: self.sort_target.as_deref().unwrap_or("").parse()?,
            consistency: self.consistency.as_deref().unwrap_or("").parse()?,
            keys_only: self.keys_only,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub prefix: bool,
    pub from_key: bool,
    pub range_end: Option<String>,
    pub limit: i64,
    pub revision: i64,
    pub sort_order: SortOrder,
    pub sort_target: SortTarget,
    pub consistency: Consistency,
    pub keys_only: bool,
}

impl GetOptions {
    /// Options that only the current generation can express.
    pub fn uses_range_options(&self) -> bool {
        self.prefix
            || self.from_key
            || self.range_end.as_deref().is_some_and(|e| !e.is_empty())
            || self.limit > 0
            || self.revision > 0
            || self.keys_only
            || self.sort_order != SortOrder::None
            || self.sort_target != SortTarget::Key
            || self.consistency == Consistency::Serializable
    }

    pub fn resolve(&self, key: &str) -> Result<RangeRequest> {
        let range = resolve_range(key, self.prefix, self.from_key, self.range_end.as_deref())?;
        Ok(RangeRequest {
            range,
            limit: self.limit,
            revision: self.revision,
            sort_order: self.sort_order,
            sort_target: self.sort_target,
            keys_only: self.keys_only,
            serializable: self.consistency == Consistency::Serializable,
        })
    }
}

/// Fully resolved range read for the current generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub range: KeyRange,
    pub limit: i64,
    pub revision: i64,
    pub sort_order: SortOrder,
    pub sort_target: SortTarget,
    pub keys_only: bool,
    pub serializable: bool,
}

impl RangeRequest {
    /// Plain linearizable read of a single key.
    pub fn single(key: &str) -> Self {
        Self {
            range: KeyRange {
                key: key.as_bytes().to_vec(),
                mode: RangeMode::Single,
            },
            limit: 0,
            revision: 0,
            sort_order: SortOrder::None,
            sort_target: SortTarget::Key,
            keys_only: false,
            serializable: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    // v3
    pub lease: LeaseId,
    pub prev_kv: bool,
    pub ignore_value: bool,
    pub ignore_lease: bool,
    // v2
    pub ttl: Option<u64>,
    pub prev_value: Option<String>,
    pub prev_index: Option<u64>,
}

impl PutOptions {
    pub fn uses_legacy_options(&self) -> bool {
        self.ttl.is_some() || self.prev_value.is_some() || self.prev_index.is_some()
    }

    pub fn uses_current_options(&self) -> bool {
        !self.lease.is_none() || self.prev_kv || self.ignore_value || self.ignore_lease
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub lease: LeaseId,
    pub prev_kv: bool,
    pub ignore_value: bool,
    pub ignore_lease: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    // v3
    pub prefix: bool,
    pub from_key: bool,
    pub range_end: Option<String>,
    pub prev_kv: bool,
    // v2
    pub dir: bool,
    pub recursive: bool,
    pub prev_value: Option<String>,
    pub prev_index: Option<u64>,
}

impl DeleteOptions {
    pub fn uses_legacy_options(&self) -> bool {
        self.dir || self.recursive || self.prev_value.is_some() || self.prev_index.is_some()
    }

    pub fn uses_current_options(&self) -> bool {
        self.prefix
            || self.from_key
            || self.range_end.as_deref().is_some_and(|e| !e.is_empty())
            || self.prev_kv
    }

    pub fn resolve(&self, key: &str) -> Result<DeleteRequest> {
        let range = resolve_range(key, self.prefix, self.from_key, self.range_end.as_deref())?;
        Ok(DeleteRequest {
            range,
            prev_kv: self.prev_kv,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub range: KeyRange,
    pub prev_kv: bool,
}

/// Options for the legacy directory listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub recursive: bool,
    pub sorted: bool,
    pub quorum: bool,
    /// Append `/` to directory entries.
    pub fill_path: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_and_from_key_rejected() {
        for key in ["", "foo"] {
            let err = resolve_range(key, true, true, None).unwrap_err();
            assert!(matches!(err, ConsoleError::Validation(_)));
        }
    }

    #[test]
    fn empty_prefix_becomes_forward_scan_from_null() {
        let range = resolve_range("", true, false, None).unwrap();
        assert_eq!(range.key, b"\0".to_vec());
        assert_eq!(range.mode, RangeMode::FromKey);
    }

    #[test]
    fn empty_from_key_anchored_at_null() {
        let range = resolve_range("", false, true, None).unwrap();
        assert_eq!(range.key, NULL_KEY.to_vec());
        assert_eq!(range.mode, RangeMode::FromKey);
    }

    #[test]
    fn non_empty_prefix_stays_prefix() {
        let range = resolve_range("/app/", true, false, Some("/zzz")).unwrap();
        assert_eq!(range.key, b"/app/".to_vec());
        assert_eq!(range.mode, RangeMode::Prefix);
    }

    #[test]
    fn explicit_range_end() {
        let range = resolve_range("a", false, false, Some("c")).unwrap();
        assert_eq!(range.mode, RangeMode::Until(b"c".to_vec()));
    }

    #[test]
    fn single_key_requires_key() {
        assert!(matches!(
            resolve_range("", false, false, None),
            Err(ConsoleError::Validation(_))
        ));
    }

    #[test]
    fn sort_strings_case_insensitive() {
        assert_eq!("ascend".parse::<SortOrder>().unwrap(), SortOrder::Ascend);
        assert_eq!("Descend".parse::<SortOrder>().unwrap(), SortOrder::Descend);
        assert_eq!("modify".parse::<SortTarget>().unwrap(), SortTarget::Modify);
        assert_eq!("".parse::<SortTarget>().unwrap(), SortTarget::Key);
    }

    #[test]
    fn unknown_sort_values_rejected() {
        assert!(matches!(
            "sideways".parse::<SortOrder>(),
            Err(ConsoleError::Validation(_))
        ));
        assert!(matches!(
            "size".parse::<SortTarget>(),
            Err(ConsoleError::Validation(_))
        ));
        assert!(matches!(
            "x".parse::<Consistency>(),
            Err(ConsoleError::Validation(_))
        ));
    }

    #[test]
    fn numeric_fallbacks() {
        assert_eq!(parse_timeout(Some("abc"), DEFAULT_TIMEOUT), DEFAULT_TIMEOUT);
        assert_eq!(parse_timeout(Some("0"), DEFAULT_TIMEOUT), DEFAULT_TIMEOUT);
        assert_eq!(
            parse_timeout(Some(" 12 "), DEFAULT_TIMEOUT),
            Duration::from_secs(12)
        );
        assert_eq!(parse_timeout(None, DEFAULT_TIMEOUT), DEFAULT_TIMEOUT);
        assert_eq!(parse_limit(Some("ten")), 0);
        assert_eq!(parse_limit(Some("10")), 10);
        assert_eq!(parse_revision(Some("-4")), 0);
        assert_eq!(parse_revision(Some("42")), 42);
    }

    #[test]
    fn params_parse_into_request() {
        let params = GetParams {
            prefix: true,
            limit: Some("nope".into()),
            revision: Some("7".into()),
            sort_order: Some("DESCEND".into()),
            sort_target: Some("version".into()),
            consistency: Some("s".into()),
            ..Default::default()
        };
        let opts = params.parse().unwrap();
        assert!(opts.uses_range_options());
        let req = opts.resolve("/registry/").unwrap();
        assert_eq!(req.range.mode, RangeMode::Prefix);
        assert_eq!(req.limit, 0);
        assert_eq!(req.revision, 7);
        assert_eq!(req.sort_order, SortOrder::Descend);
        assert_eq!(req.sort_target, SortTarget::Version);
        assert!(req.serializable);
    }

    #[test]
    fn plain_get_has_no_range_options() {
        assert!(!GetOptions::default().uses_range_options());
    }

    #[test]
    fn serializable_read_is_a_range_option() {
        let opts = GetOptions {
            consistency: Consistency::Serializable,
            ..Default::default()
        };
        assert!(opts.uses_range_options());
    }

    #[test]
    fn generation_specific_write_options() {
        let legacy = PutOptions {
            ttl: Some(30),
            ..Default::default()
        };
        assert!(legacy.uses_legacy_options());
        assert!(!legacy.uses_current_options());

        let current = DeleteOptions {
            prev_kv: true,
            ..Default::default()
        };
        assert!(current.uses_current_options());
        assert!(!current.uses_legacy_options());
    }
}
