//! Error taxonomy shared by every relmap crate.
//!
//! Every failure surfaces to the immediate caller with structured context
//! (entity type, property, offending expression fragment, SQL). Nothing is
//! downgraded to a warning.

use crate::value::Value;
use std::fmt;

/// Result alias used throughout relmap.
pub type Result<T> = std::result::Result<T, Error>;

/// The top-level error type.
#[derive(Debug)]
pub enum Error {
    /// Invariant violation during convention convergence or model finalization.
    ModelBuilding(ModelBuildingError),
    /// Unsupported or unsafe query shape.
    Translation(TranslationError),
    /// A second instance with an already-tracked identity.
    IdentityConflict(IdentityConflictError),
    /// Optimistic-concurrency mismatch during save.
    Concurrency(ConcurrencyError),
    /// Save batch that cannot be ordered.
    DependencyCycle(DependencyCycleError),
    /// Failure reported by the data source, wrapped with entity context.
    DataSource(DataSourceError),
    /// A result row did not match the expected shape.
    Materialization(MaterializationError),
    /// Anything else.
    Custom(String),
}

impl Error {
    /// True for optimistic-concurrency failures.
    pub const fn is_concurrency(&self) -> bool {
        matches!(self, Error::Concurrency(_))
    }

    /// The translation error kind, when this is a translation failure.
    pub const fn translation_kind(&self) -> Option<&TranslationErrorKind> {
        match self {
            Error::Translation(e) => Some(&e.kind),
            _ => None,
        }
    }

    /// Create a custom error.
    pub fn custom(message: impl Into<String>) -> Self {
        Error::Custom(message.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ModelBuilding(e) => write!(f, "model building error: {e}"),
            Error::Translation(e) => write!(f, "translation failure: {e}"),
            Error::IdentityConflict(e) => write!(f, "identity conflict: {e}"),
            Error::Concurrency(e) => write!(f, "concurrency error: {e}"),
            Error::DependencyCycle(e) => write!(f, "dependency cycle: {e}"),
            Error::DataSource(e) => write!(f, "data source error: {e}"),
            Error::Materialization(e) => write!(f, "materialization error: {e}"),
            Error::Custom(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::DataSource(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

// ============================================================================
// Entry identification
// ============================================================================

/// Identifies a tracked entity in error reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Entity type name.
    pub entity_type: String,
    /// Key values (temporary values for unsaved entities).
    pub key: Vec<Value>,
}

impl EntryInfo {
    /// Create an entry description.
    pub fn new(entity_type: impl Into<String>, key: Vec<Value>) -> Self {
        Self {
            entity_type: entity_type.into(),
            key,
        }
    }
}

impl fmt::Display for EntryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.entity_type)?;
        for (i, v) in self.key.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")")
    }
}

fn join_entries(entries: &[EntryInfo]) -> String {
    entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Model building
// ============================================================================

/// Fatal error raised while conventions converge or the model is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelBuildingError {
    /// What went wrong.
    pub message: String,
    /// Entity type involved, if any.
    pub entity_type: Option<String>,
    /// Property involved, if any.
    pub property: Option<String>,
    /// Convention that raised the error, if any.
    pub convention: Option<String>,
}

impl ModelBuildingError {
    /// Create a new model building error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            entity_type: None,
            property: None,
            convention: None,
        }
    }

    /// Attach the entity type name.
    pub fn with_entity_type(mut self, name: impl Into<String>) -> Self {
        self.entity_type = Some(name.into());
        self
    }

    /// Attach the property name.
    pub fn with_property(mut self, name: impl Into<String>) -> Self {
        self.property = Some(name.into());
        self
    }

    /// Attach the convention name.
    pub fn with_convention(mut self, name: impl Into<String>) -> Self {
        self.convention = Some(name.into());
        self
    }
}

impl fmt::Display for ModelBuildingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        match (&self.entity_type, &self.property) {
            (Some(et), Some(p)) => write!(f, " (at {et}.{p})")?,
            (Some(et), None) => write!(f, " (at {et})")?,
            _ => {}
        }
        if let Some(c) = &self.convention {
            write!(f, " [convention {c}]")?;
        }
        Ok(())
    }
}

impl From<ModelBuildingError> for Error {
    fn from(e: ModelBuildingError) -> Self {
        Error::ModelBuilding(e)
    }
}

// ============================================================================
// Translation
// ============================================================================

/// Why a query could not be translated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationErrorKind {
    /// An expression shape with no relational equivalent and no client fallback.
    Unsupported {
        /// The offending member, method or operator.
        construct: String,
    },
    /// A correlated collection with Distinct/GroupBy dropped an identifying column.
    IdentifyingColumnMissing {
        /// `alias.Column` of the first missing identifying column.
        column: String,
    },
    /// An aggregate was applied directly over a client-evaluated projection.
    AggregateOverClientEvaluation {
        /// The aggregate operator (`Sum`, `Average`, `Min`, `Max`).
        aggregate: String,
    },
}

/// A fatal per-query translation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationError {
    /// The failure kind.
    pub kind: TranslationErrorKind,
    /// Printed form of the offending expression fragment.
    pub expression: Option<String>,
    /// Additional lines, one per untranslatable construct.
    pub details: Vec<String>,
}

impl TranslationError {
    /// Unsupported construct.
    pub fn unsupported(construct: impl Into<String>) -> Self {
        Self {
            kind: TranslationErrorKind::Unsupported {
                construct: construct.into(),
            },
            expression: None,
            details: Vec::new(),
        }
    }

    /// Identifying column missing from a Distinct/GroupBy collection projection.
    pub fn identifying_column_missing(column: impl Into<String>) -> Self {
        Self {
            kind: TranslationErrorKind::IdentifyingColumnMissing {
                column: column.into(),
            },
            expression: None,
            details: Vec::new(),
        }
    }

    /// Aggregate over a client-evaluated projection.
    pub fn aggregate_over_client_evaluation(aggregate: impl Into<String>) -> Self {
        Self {
            kind: TranslationErrorKind::AggregateOverClientEvaluation {
                aggregate: aggregate.into(),
            },
            expression: None,
            details: Vec::new(),
        }
    }

    /// Attach the printed expression fragment.
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    /// Append a detail line.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }
}

impl fmt::Display for TranslationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TranslationErrorKind::Unsupported { construct } => {
                write!(f, "unable to translate '{construct}'")?;
            }
            TranslationErrorKind::IdentifyingColumnMissing { column } => write!(
                f,
                "collection subquery using Distinct or GroupBy does not project identifying column '{column}'"
            )?,
            TranslationErrorKind::AggregateOverClientEvaluation { aggregate } => write!(
                f,
                "client evaluation followed by aggregate operation '{aggregate}'"
            )?,
        }
        if let Some(expr) = &self.expression {
            write!(f, " in expression `{expr}`")?;
        }
        for detail in &self.details {
            write!(f, "\n{detail}")?;
        }
        Ok(())
    }
}

impl From<TranslationError> for Error {
    fn from(e: TranslationError) -> Self {
        Error::Translation(e)
    }
}

// ============================================================================
// Change tracking and save
// ============================================================================

/// Attaching a second instance with an identity that is already tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConflictError {
    /// The conflicting identity.
    pub entry: EntryInfo,
}

impl fmt::Display for IdentityConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "another instance of {} with the same key is already being tracked",
            self.entry
        )
    }
}

impl From<IdentityConflictError> for Error {
    fn from(e: IdentityConflictError) -> Self {
        Error::IdentityConflict(e)
    }
}

/// Optimistic-concurrency failure: a command affected an unexpected number of rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyError {
    /// Entries whose command did not apply.
    pub entries: Vec<EntryInfo>,
    /// Rows the command was expected to affect.
    pub expected_rows: u64,
    /// Rows the data source reported.
    pub actual_rows: u64,
}

impl fmt::Display for ConcurrencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected {} row(s) affected but got {} for {}; the data may have been modified or deleted since it was loaded",
            self.expected_rows,
            self.actual_rows,
            join_entries(&self.entries)
        )
    }
}

impl From<ConcurrencyError> for Error {
    fn from(e: ConcurrencyError) -> Self {
        Error::Concurrency(e)
    }
}

/// Pending commands that cannot be put in a valid order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCycleError {
    /// Entries participating in the cycle.
    pub entries: Vec<EntryInfo>,
}

impl fmt::Display for DependencyCycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unresolvable dependency cycle between {}",
            join_entries(&self.entries)
        )
    }
}

impl From<DependencyCycleError> for Error {
    fn from(e: DependencyCycleError) -> Self {
        Error::DependencyCycle(e)
    }
}

// ============================================================================
// Data source
// ============================================================================

/// Broad classification of data-source failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceErrorKind {
    /// Connection could not be used.
    Connection,
    /// Query failed (syntax, missing object, ...).
    Query,
    /// Constraint violation (not null, unique, foreign key, check).
    Constraint,
    /// Statement timed out.
    Timeout,
    /// Anything else.
    Other,
}

/// Low-level failure wrapped with entity/property context.
#[derive(Debug)]
pub struct DataSourceError {
    /// Failure class.
    pub kind: DataSourceErrorKind,
    /// Message from the data source.
    pub message: String,
    /// SQL that failed, if known.
    pub sql: Option<String>,
    /// Entity type being saved, if any.
    pub entity_type: Option<String>,
    /// Property most likely involved, if any.
    pub property: Option<String>,
    /// Entries whose command failed.
    pub entries: Vec<EntryInfo>,
    /// Underlying error.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DataSourceError {
    /// Create a data-source error.
    pub fn new(kind: DataSourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sql: None,
            entity_type: None,
            property: None,
            entries: Vec::new(),
            source: None,
        }
    }

    /// Attach the failing SQL.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Attach the entity type.
    pub fn with_entity_type(mut self, name: impl Into<String>) -> Self {
        self.entity_type = Some(name.into());
        self
    }

    /// Attach the property.
    pub fn with_property(mut self, name: impl Into<String>) -> Self {
        self.property = Some(name.into());
        self
    }

    /// Attach the failing entries.
    pub fn with_entries(mut self, entries: Vec<EntryInfo>) -> Self {
        self.entries = entries;
        self
    }

    /// Attach the underlying error.
    pub fn with_source(mut self, source: Box<dyn std::error::Error + Send + Sync>) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        match (&self.entity_type, &self.property) {
            (Some(et), Some(p)) => write!(f, " (while saving {et}.{p})")?,
            (Some(et), None) => write!(f, " (while saving {et})")?,
            _ => {}
        }
        if !self.entries.is_empty() {
            write!(f, " entries: {}", join_entries(&self.entries))?;
        }
        Ok(())
    }
}

impl From<DataSourceError> for Error {
    fn from(e: DataSourceError) -> Self {
        Error::DataSource(e)
    }
}

// ============================================================================
// Materialization
// ============================================================================

/// A row could not be shaped into the expected result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializationError {
    /// What went wrong.
    pub message: String,
    /// Column position involved, if any.
    pub column: Option<usize>,
    /// Entity type being materialized, if any.
    pub entity_type: Option<String>,
}

impl MaterializationError {
    /// Create a materialization error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            column: None,
            entity_type: None,
        }
    }

    /// Attach the column position.
    pub fn at_column(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }

    /// Attach the entity type.
    pub fn with_entity_type(mut self, name: impl Into<String>) -> Self {
        self.entity_type = Some(name.into());
        self
    }
}

impl fmt::Display for MaterializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(c) = self.column {
            write!(f, " (column {c})")?;
        }
        if let Some(et) = &self.entity_type {
            write!(f, " (entity {et})")?;
        }
        Ok(())
    }
}

impl From<MaterializationError> for Error {
    fn from(e: MaterializationError) -> Self {
        Error::Materialization(e)
    }
}
