use relmap_core::SqlType;
use relmap_metadata::{Cardinality, ConfigurationSource, FinalizedModel, ModelBuilder};

/// Squads, gears (with an `Officer` subtype stored in the same table),
/// weapons owned by gears through a composite key, and missions with their
/// participating squads.
pub(crate) fn gears_model() -> FinalizedModel {
    let mut mb = ModelBuilder::new();

    let squad = mb.entity("Squad").unwrap();
    mb.property(squad, "Id", SqlType::Integer).unwrap();
    mb.property(squad, "Name", SqlType::Text).unwrap();

    let gear = mb.entity("Gear").unwrap();
    mb.property(gear, "Nickname", SqlType::Text).unwrap();
    mb.property(gear, "SquadId", SqlType::Integer).unwrap();
    mb.property(gear, "FullName", SqlType::Text).unwrap();
    mb.property(gear, "Rank", SqlType::Integer).unwrap();
    mb.property(gear, "HasSoulPatch", SqlType::Boolean).unwrap();
    mb.property(gear, "LeaderNickname", SqlType::Text).unwrap();
    mb.has_key(gear, &["Nickname", "SquadId"]).unwrap();
    let nickname = mb.model().find_property(gear, "Nickname").unwrap();
    mb.set_nullable(nickname, false, ConfigurationSource::Explicit).unwrap();
    mb.navigation(gear, "Squad", squad, Cardinality::One).unwrap();
    mb.navigation(squad, "Members", gear, Cardinality::Many).unwrap();

    let officer = mb.entity("Officer").unwrap();
    mb.set_base_type(officer, Some(gear), ConfigurationSource::Explicit).unwrap();

    let weapon = mb.entity("Weapon").unwrap();
    mb.property(weapon, "Id", SqlType::Integer).unwrap();
    mb.property(weapon, "Name", SqlType::Text).unwrap();
    mb.property(weapon, "IsAutomatic", SqlType::Boolean).unwrap();
    mb.property(weapon, "OwnerNickname", SqlType::Text).unwrap();
    let owner_squad = mb.property(weapon, "OwnerSquadId", SqlType::Integer).unwrap();
    mb.set_nullable(owner_squad, true, ConfigurationSource::Explicit).unwrap();
    let owner = mb.navigation(weapon, "Owner", gear, Cardinality::One).unwrap();
    mb.has_foreign_key(owner, &["OwnerNickname", "OwnerSquadId"]).unwrap();
    mb.navigation(gear, "Weapons", weapon, Cardinality::Many).unwrap();

    let mission = mb.entity("Mission").unwrap();
    mb.property(mission, "Id", SqlType::Integer).unwrap();
    mb.property(mission, "CodeName", SqlType::Text).unwrap();
    mb.property(mission, "Duration", SqlType::Interval).unwrap();
    mb.property(mission, "Timeline", SqlType::Timestamp).unwrap();

    let squad_mission = mb.entity("SquadMission").unwrap();
    mb.property(squad_mission, "SquadId", SqlType::Integer).unwrap();
    mb.property(squad_mission, "MissionId", SqlType::Integer).unwrap();
    mb.has_key(squad_mission, &["SquadId", "MissionId"]).unwrap();
    mb.navigation(squad_mission, "Mission", mission, Cardinality::One).unwrap();
    mb.navigation(mission, "ParticipatingSquads", squad_mission, Cardinality::Many).unwrap();

    mb.finalize().unwrap()
}
