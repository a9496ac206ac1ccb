//! SQL type descriptors for mapped properties and columns.

use serde::{Deserialize, Serialize};

/// The store type of a property or projected column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    /// BOOLEAN
    Boolean,
    /// TINYINT
    TinyInt,
    /// SMALLINT
    SmallInt,
    /// INTEGER
    Integer,
    /// BIGINT
    BigInt,
    /// REAL
    Real,
    /// DOUBLE PRECISION
    Double,
    /// DECIMAL(p, s)
    Decimal {
        /// Total digits.
        precision: u8,
        /// Digits after the decimal point.
        scale: u8,
    },
    /// TEXT
    Text,
    /// VARCHAR(n)
    VarChar(u32),
    /// BLOB / BYTEA
    Blob,
    /// DATE
    Date,
    /// TIME
    Time,
    /// TIMESTAMP
    Timestamp,
    /// TIMESTAMP WITH TIME ZONE
    TimestampTz,
    /// Interval stored as microseconds.
    Interval,
    /// UUID
    Uuid,
    /// JSON
    Json,
}

impl SqlType {
    /// SQL type name for diagnostics and casts.
    #[must_use]
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::TinyInt => "TINYINT".to_string(),
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Real => "REAL".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({precision}, {scale})"),
            SqlType::Text => "TEXT".to_string(),
            SqlType::VarChar(n) => format!("VARCHAR({n})"),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Time => "TIME".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::TimestampTz => "TIMESTAMPTZ".to_string(),
            SqlType::Interval => "BIGINT".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
        }
    }

    /// Integer-valued types (candidates for identity generation).
    #[must_use]
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer | SqlType::BigInt
        )
    }

    /// Any numeric type.
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        self.is_integer()
            || matches!(
                self,
                SqlType::Real | SqlType::Double | SqlType::Decimal { .. }
            )
    }

    /// Character types.
    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self, SqlType::Text | SqlType::VarChar(_))
    }

    /// Types whose values are assignable to each other without conversion.
    ///
    /// Used to validate foreign keys against principal keys and predicate
    /// operands against each other.
    #[must_use]
    pub const fn is_compatible_with(&self, other: &SqlType) -> bool {
        (self.is_integer() && other.is_integer())
            || (self.is_numeric() && other.is_numeric())
            || (self.is_text() && other.is_text())
            || matches!(
                (self, other),
                (SqlType::Boolean, SqlType::Boolean)
                    | (SqlType::Blob, SqlType::Blob)
                    | (SqlType::Date, SqlType::Date)
                    | (SqlType::Time, SqlType::Time)
                    | (SqlType::Timestamp | SqlType::TimestampTz, SqlType::Timestamp | SqlType::TimestampTz)
                    | (SqlType::Interval, SqlType::Interval)
                    | (SqlType::Uuid, SqlType::Uuid)
                    | (SqlType::Json, SqlType::Json)
            )
    }
}
