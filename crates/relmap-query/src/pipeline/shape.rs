//! Entity-shape binding.
//!
//! Decides, for every part of a selector, whether it materializes an
//! entity, a scalar, an anonymous object or a correlated collection.

use super::navigation::{ExpandedQuery, SourceRef, is_collection};
use crate::expr::Expr;
use relmap_core::TranslationError;

/// Shape of a selector before lowering.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Shape {
    /// All mapped columns of a source.
    Entity(SourceRef),
    Scalar(Expr),
    Object(Vec<(String, Shape)>),
    Collection(Box<ExpandedQuery>),
}

impl Shape {
    /// Bind `selector`.
    pub(crate) fn bind(selector: &Expr) -> Result<Shape, TranslationError> {
        match selector {
            Expr::Source(source) => Ok(Shape::Entity(source.clone())),
            Expr::New(fields) => fields
                .iter()
                .map(|(name, e)| Shape::bind(e).map(|s| (name.clone(), s)))
                .collect::<Result<Vec<_>, _>>()
                .map(Shape::Object),
            Expr::Correlated(q) if is_collection(selector) => Ok(Shape::Collection(q.clone())),
            Expr::Group(group) => Err(TranslationError::unsupported(format!("GroupBy({})", group.key))
                .with_detail("a grouping must be projected through its key and aggregates")),
            other => Ok(Shape::Scalar(other.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::navigation::NavigationExpander;
    use crate::pipeline::test_model::gears_model;
    use crate::query::Query;

    #[test]
    fn test_bind_object_with_entity_scalar_and_collection() {
        let model = gears_model();
        let q = Query::from("Gear").select(
            "g",
            Expr::new_object([
                ("Gear", Expr::param("g")),
                ("Squad", Expr::param("g").member("Squad").member("Name")),
                ("Weapons", Expr::param("g").member("Weapons")),
            ]),
        );
        let expanded = NavigationExpander::new(&model).expand(q).unwrap();
        let shape = Shape::bind(&expanded.selector).unwrap();
        let Shape::Object(fields) = &shape else {
            panic!("expected object");
        };
        assert!(matches!(fields[0].1, Shape::Entity(_)));
        assert!(matches!(fields[1].1, Shape::Scalar(_)));
        assert!(matches!(fields[2].1, Shape::Collection(_)));
    }

    #[test]
    fn test_bare_grouping_is_rejected() {
        let model = gears_model();
        let q = Query::from("Gear").group_by("g", Expr::param("g").member("Rank"));
        let expanded = NavigationExpander::new(&model).expand(q).unwrap();
        assert!(Shape::bind(&expanded.selector).is_err());
    }
}
