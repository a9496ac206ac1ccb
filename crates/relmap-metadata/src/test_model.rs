use crate::*;
use relmap_core::SqlType;

/// Squads and gears keyed by nickname and squad, with `Officer` derived
/// from `Gear`.
pub(crate) fn gears_model() -> ModelBuilder {
    let mut mb = ModelBuilder::new();
    let squad = mb.entity("Squad").unwrap();
    mb.property(squad, "Id", SqlType::Integer).unwrap();
    mb.property(squad, "Name", SqlType::Text).unwrap();

    let gear = mb.entity("Gear").unwrap();
    mb.property(gear, "Nickname", SqlType::Text).unwrap();
    mb.property(gear, "SquadId", SqlType::Integer).unwrap();
    mb.property(gear, "FullName", SqlType::Text).unwrap();
    mb.has_key(gear, &["Nickname", "SquadId"]).unwrap();
    mb.navigation(gear, "Squad", squad, Cardinality::One).unwrap();
    mb.navigation(squad, "Members", gear, Cardinality::Many).unwrap();

    let officer = mb.entity("Officer").unwrap();
    mb.set_base_type(officer, Some(gear), ConfigurationSource::Explicit).unwrap();
    mb
}
