//! The relational side of translation: scalar expressions, select
//! expressions, the command tree and its rendering.

pub mod expr;
pub mod render;
pub mod select;

pub use expr::{DatePart, SqlBinaryOp, SqlExpr, SqlUnaryOp, value_type};
pub use render::{QuerySqlGenerator, SqlRenderer};
pub use select::{
    ColumnShape, CommandNode, FromItem, JoinClause, JoinKind, OrderingClause, ProjectionColumn,
    SelectExpression, TableSource,
};
