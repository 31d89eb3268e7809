//! Compatibility issue records
//!
//! Issues are produced by an external rule engine that scans the server for
//! MySQL 8.0 to 8.4 incompatibilities. The migration engine consumes them as
//! immutable records and never re-derives them. The kind is a closed enum so
//! every dispatch site pattern-matches exhaustively.

use serde::{Deserialize, Serialize};

/// The closed set of incompatibility kinds the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Table or column uses a legacy charset (utf8mb3, latin1)
    Charset,
    /// Zero or otherwise invalid date value ('0000-00-00')
    InvalidDate,
    /// Integer display width, e.g. INT(11)
    IntDisplayWidth,
    /// ZEROFILL column attribute
    Zerofill,
    /// MyISAM or other deprecated storage engine
    DeprecatedEngine,
    /// FLOAT(M,D) / DOUBLE(M,D) precision syntax
    FloatPrecision,
    /// ENUM containing an empty-string member
    EnumEmpty,
    /// TIMESTAMP value outside the supported range
    TimestampRange,
    /// Identifier that became a reserved keyword
    ReservedKeyword,
    /// Account using mysql_native_password or another removed plugin
    AuthPlugin,
    /// Grant relying on the removed SUPER privilege
    SuperPrivilege,
    /// System variable removed in 8.4
    RemovedSysVar,
    /// GROUP BY ... ASC/DESC syntax
    GroupbyAscDesc,
    /// SQL_CALC_FOUND_ROWS usage
    SqlCalcFoundRows,
    /// Partitioning scheme no longer supported
    Partition,
    /// BLOB/TEXT column with a default value
    BlobTextDefault,
    /// Foreign key constraint name over 64 characters
    FkNameLength,
}

impl IssueKind {
    /// Stable string tag used in issue keys and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Charset => "charset",
            IssueKind::InvalidDate => "invalid_date",
            IssueKind::IntDisplayWidth => "int_display_width",
            IssueKind::Zerofill => "zerofill",
            IssueKind::DeprecatedEngine => "deprecated_engine",
            IssueKind::FloatPrecision => "float_precision",
            IssueKind::EnumEmpty => "enum_empty",
            IssueKind::TimestampRange => "timestamp_range",
            IssueKind::ReservedKeyword => "reserved_keyword",
            IssueKind::AuthPlugin => "auth_plugin",
            IssueKind::SuperPrivilege => "super_privilege",
            IssueKind::RemovedSysVar => "removed_sys_var",
            IssueKind::GroupbyAscDesc => "groupby_asc_desc",
            IssueKind::SqlCalcFoundRows => "sql_calc_found_rows",
            IssueKind::Partition => "partition",
            IssueKind::BlobTextDefault => "blob_text_default",
            IssueKind::FkNameLength => "fk_name_length",
        }
    }

    /// Kinds whose remediation can silently discard data and therefore
    /// cannot be undone by rollback SQL
    pub fn is_data_lossy(&self) -> bool {
        matches!(self, IssueKind::InvalidDate | IssueKind::TimestampRange)
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How severe an issue is for the upgrade
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// Informational, upgrade proceeds regardless
    Info,
    /// Should be fixed, upgrade may misbehave
    Warning,
    /// Blocks the upgrade
    Critical,
}

/// One detected incompatibility, as produced by the external rule engine.
///
/// Immutable once constructed. `table_name` and `column_name` are parsed out
/// of `location` by the rule engine where they apply; server-level issues
/// (auth plugins, system variables) leave them unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    pub kind: IssueKind,
    pub severity: IssueSeverity,
    /// Dotted location, `schema.table` or `schema.table.column`
    pub location: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
}

impl CompatibilityIssue {
    /// Stable identity key used for before/after set comparison.
    ///
    /// Deliberately excludes the description so cosmetic rewording by the
    /// rule engine does not make a fixed issue look new.
    pub fn issue_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.kind,
            self.location,
            self.table_name.as_deref().unwrap_or(""),
            self.column_name.as_deref().unwrap_or("")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn issue(kind: IssueKind, table: Option<&str>, column: Option<&str>) -> CompatibilityIssue {
        CompatibilityIssue {
            kind,
            severity: IssueSeverity::Warning,
            location: "shop.orders.created_at".into(),
            description: "test".into(),
            table_name: table.map(String::from),
            column_name: column.map(String::from),
        }
    }

    #[test]
    fn issue_key_is_stable_and_ignores_description() {
        let a = issue(IssueKind::InvalidDate, Some("orders"), Some("created_at"));
        let mut b = a.clone();
        b.description = "different wording".into();
        assert_eq!(a.issue_key(), b.issue_key());
        assert_eq!(
            a.issue_key(),
            "invalid_date:shop.orders.created_at:orders:created_at"
        );
    }

    #[test]
    fn issue_key_distinguishes_kinds() {
        let a = issue(IssueKind::Charset, Some("orders"), None);
        let b = issue(IssueKind::Zerofill, Some("orders"), None);
        assert_ne!(a.issue_key(), b.issue_key());
    }

    #[test]
    fn severity_orders_critical_last() {
        assert!(IssueSeverity::Info < IssueSeverity::Warning);
        assert!(IssueSeverity::Warning < IssueSeverity::Critical);
    }

    #[test]
    fn data_lossy_kinds() {
        assert!(IssueKind::InvalidDate.is_data_lossy());
        assert!(IssueKind::TimestampRange.is_data_lossy());
        assert!(!IssueKind::Charset.is_data_lossy());
    }
}
