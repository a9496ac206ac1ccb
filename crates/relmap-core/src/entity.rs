//! Bridge between typed Rust structs and [`DynamicEntity`].

use crate::dynamic::DynamicEntity;
use crate::error::Result;

/// A typed entity that can be converted to and from its dynamic form.
///
/// Implement this for plain structs to use them with a session instead of
/// building [`DynamicEntity`] values by hand.
pub trait Entity: Sized {
    /// The entity type name registered in the model.
    const TYPE_NAME: &'static str;

    /// Convert into the dynamic property bag.
    fn to_dynamic(&self) -> DynamicEntity;

    /// Build from a dynamic property bag.
    fn from_dynamic(entity: &DynamicEntity) -> Result<Self>;
}

impl Entity for DynamicEntity {
    const TYPE_NAME: &'static str = "";

    fn to_dynamic(&self) -> DynamicEntity {
        self.clone()
    }

    fn from_dynamic(entity: &DynamicEntity) -> Result<Self> {
        Ok(entity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, MaterializationError};
    use crate::value::Value;

    #[derive(Debug, PartialEq)]
    struct Squad {
        id: i64,
        name: String,
    }

    impl Entity for Squad {
        const TYPE_NAME: &'static str = "Squad";

        fn to_dynamic(&self) -> DynamicEntity {
            DynamicEntity::new(Self::TYPE_NAME)
                .with("Id", self.id)
                .with("Name", self.name.as_str())
        }

        fn from_dynamic(entity: &DynamicEntity) -> Result<Self> {
            let id = entity
                .get("Id")
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::from(MaterializationError::new("missing Id")))?;
            let name = entity
                .get("Name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(Self { id, name })
        }
    }

    #[test]
    fn test_entity_round_trip_through_dynamic() {
        let squad = Squad {
            id: 7,
            name: "Delta".to_string(),
        };
        let dynamic = squad.to_dynamic();
        assert_eq!(dynamic.entity_type(), "Squad");
        assert_eq!(Squad::from_dynamic(&dynamic).unwrap(), squad);
    }
}
