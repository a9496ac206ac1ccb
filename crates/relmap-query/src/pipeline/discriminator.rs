//! Discriminator injection.
//!
//! Single-table hierarchies are filtered to the discriminator values of the
//! queried type and its descendants, unless the query targets the root of a
//! hierarchy whose table holds nothing else. Entity shapes learn how to pick
//! the concrete type of each row.

use super::lowering::LoweredQuery;
use crate::result::{ConcreteType, ResultShape};
use crate::sql::{SelectExpression, SqlExpr};
use relmap_metadata::{HierarchyMapping, Model};

pub(crate) fn apply(model: &Model, lowered: &mut LoweredQuery) {
    lowered.select.for_each_select_mut(&mut |s| filter(model, s));
    lowered.shape.for_each_mut(&mut |shape| resolve(model, shape));
    for split in &mut lowered.splits {
        split.select.for_each_select_mut(&mut |s| filter(model, s));
        split.shape.for_each_mut(&mut |shape| resolve(model, shape));
    }
}

fn filter(model: &Model, select: &mut SelectExpression) {
    let mut conditions = Vec::new();
    for (position, table) in select.tables().enumerate() {
        let Some(et) = table.entity_type else {
            continue;
        };
        let Some(HierarchyMapping::SingleTable {
            discriminator,
            is_complete,
            ..
        }) = model.hierarchy_mapping(et)
        else {
            continue;
        };
        if model.root(et) == et && *is_complete {
            continue;
        }
        let values = model
            .self_and_descendants(et)
            .into_iter()
            .filter_map(|t| model.discriminator_value(t).cloned())
            .map(SqlExpr::Constant)
            .collect();
        let sql_type = model
            .property(*discriminator)
            .map_or(relmap_core::SqlType::Text, relmap_metadata::Property::sql_type);
        let column = SqlExpr::column(table.alias.clone(), model.column_name(*discriminator), sql_type, false);
        conditions.push((
            position,
            table.alias.clone(),
            SqlExpr::In {
                operand: Box::new(column),
                values,
                negated: false,
            },
        ));
    }
    for (position, alias, condition) in conditions {
        if position == 0 {
            select.apply_predicate(condition);
        } else {
            select.apply_join_condition(&alias, condition);
        }
    }
}

fn resolve(model: &Model, shape: &mut ResultShape) {
    match shape {
        ResultShape::Entity(entity) => {
            if model.self_and_descendants(entity.entity_type).len() < 2 {
                return;
            }
            match model.hierarchy_mapping(entity.entity_type) {
                Some(HierarchyMapping::SingleTable { discriminator, .. }) => {
                    if let Some((_, index)) = entity.properties.iter().find(|(p, _)| p == discriminator) {
                        entity.concrete = ConcreteType::Discriminator { index: *index };
                    }
                }
                Some(HierarchyMapping::TablePerType { .. }) => {
                    // Most derived first.
                    let mut leaves = entity.tables.clone();
                    leaves.reverse();
                    entity.concrete = ConcreteType::LeafKeys(leaves);
                }
                _ => {}
            }
        }
        ResultShape::Scalar {
            property: Some(property),
            discriminator_of,
            ..
        } => {
            let Some(declaring) = model.property(*property).map(relmap_metadata::Property::declaring_type) else {
                return;
            };
            let root = model.root(declaring);
            if model.discriminator_property(root) == Some(*property) {
                *discriminator_of = Some(root);
            }
        }
        _ => {}
    }
}
