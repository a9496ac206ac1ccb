use super::{Convention, ConventionContext, ConventionResult, NavigationAddedConvention};
use crate::builder::ModelBuilder;
use crate::elements::Navigation;
use crate::ids::NavigationId;

/// Pairs a new navigation with the single unpaired navigation pointing back
/// from its target. Ambiguous candidates are left unpaired.
#[derive(Debug, Default)]
pub struct InverseNavigationConvention;

impl Convention for InverseNavigationConvention {
    fn name(&self) -> &'static str {
        "InverseNavigation"
    }
}

impl NavigationAddedConvention for InverseNavigationConvention {
    fn process_navigation_added(
        &self,
        builder: &mut ModelBuilder,
        navigation: NavigationId,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        let model = builder.model();
        let Some(nav) = model.navigation(navigation) else {
            return Ok(());
        };
        if nav.inverse().is_some() {
            return Ok(());
        }
        let source = nav.declaring_type();
        let is_collection = nav.is_collection();
        let candidates: Vec<NavigationId> = model
            .all_navigations(nav.target_type())
            .into_iter()
            .filter(|n| *n != navigation)
            .filter_map(|n| model.navigation(n))
            .filter(|n| {
                n.inverse().is_none()
                    && model.is_assignable_from(n.target_type(), source)
                    && !(is_collection && n.is_collection())
            })
            .map(Navigation::id)
            .collect();
        match candidates.as_slice() {
            [single] => {
                let single = *single;
                if let Err(rejection) = builder.set_inverse(navigation, single) {
                    tracing::debug!(
                        target: "relmap::conventions",
                        navigation = %navigation,
                        %rejection,
                        "Inverse not paired"
                    );
                }
            }
            [] => {}
            _ => tracing::debug!(
                target: "relmap::conventions",
                navigation = %navigation,
                candidates = candidates.len(),
                "Ambiguous inverse navigation left unpaired"
            ),
        }
        Ok(())
    }
}
