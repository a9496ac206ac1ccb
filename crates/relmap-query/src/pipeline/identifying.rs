//! Identifying-column check for collection projections.

use super::lowering::IdentifyingCheck;
use relmap_core::TranslationError;

/// A Distinct or GroupBy collection must keep the key of every table it
/// reads, or its rows cannot be stitched back to their parents.
pub(crate) fn check(checks: &[IdentifyingCheck]) -> Result<(), TranslationError> {
    for check in checks {
        if let Some(missing) = check.required.iter().find(|c| !check.available.contains(c)) {
            let column = missing.column_display().unwrap_or_else(|| format!("{missing:?}"));
            tracing::debug!(target: "relmap::query", %column, "identifying column missing");
            return Err(TranslationError::identifying_column_missing(column));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::SqlExpr;
    use relmap_core::{SqlType, TranslationErrorKind};

    #[test]
    fn test_first_missing_column_is_reported() {
        let squad = SqlExpr::column("s", "SquadId", SqlType::Integer, false);
        let mission = SqlExpr::column("s", "MissionId", SqlType::Integer, false);
        let checks = vec![IdentifyingCheck {
            required: vec![squad.clone(), mission],
            available: vec![squad],
        }];
        let err = check(&checks).unwrap_err();
        assert_eq!(
            err.kind,
            TranslationErrorKind::IdentifyingColumnMissing {
                column: "s.MissionId".to_string()
            }
        );
        assert!(check(&[]).is_ok());
    }
}
