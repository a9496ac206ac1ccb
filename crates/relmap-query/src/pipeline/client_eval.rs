//! Client-evaluation check, the last pipeline stage.

use super::lowering::LoweredQuery;
use crate::result::CompiledQuery;
use relmap_core::TranslationError;

/// Fail on constructs no one can evaluate, and on store aggregates over
/// values only the client can compute.
pub(crate) fn finish(lowered: LoweredQuery) -> Result<CompiledQuery, TranslationError> {
    if let Some(kind) = lowered.terminal.filter(|k| k.is_aggregate()) {
        if !lowered.client_constructs.is_empty() {
            let mut err = TranslationError::aggregate_over_client_evaluation(kind.name());
            for construct in &lowered.client_constructs {
                err = err.with_detail(format!("'{construct}' is evaluated on the client"));
            }
            return Err(err);
        }
    }
    if let Some((first, rest)) = lowered.failures.split_first() {
        let mut err = TranslationError::unsupported(first.construct.clone()).with_expression(first.expression.clone());
        for failure in rest {
            err = err.with_detail(format!("'{}' in {}", failure.construct, failure.expression));
        }
        return Err(err);
    }
    Ok(CompiledQuery {
        select: lowered.select,
        shape: lowered.shape,
        splits: lowered.splits,
        cardinality: lowered.cardinality,
    })
}
