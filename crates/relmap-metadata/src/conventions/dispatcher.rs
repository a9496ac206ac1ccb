use super::{ConventionContext, ConventionEvent, ConventionSet};
use crate::builder::ModelBuilder;
use relmap_core::ModelBuildingError;
use std::sync::Arc;

/// Run `$call` for each handler in `$list` until one stops processing or the
/// element the event is about disappears.
macro_rules! run_handlers {
    ($builder:expr, $ctx:expr, $list:expr, $alive:expr, |$c:ident| $call:expr) => {
        for $c in $list {
            if $ctx.should_stop() || !$alive($builder) {
                break;
            }
            $call.map_err(|e: ModelBuildingError| {
                if e.convention.is_some() {
                    e
                } else {
                    e.with_convention($c.name())
                }
            })?;
        }
    };
}

impl ModelBuilder {
    /// Queue an event and, unless a dispatch is already running, drain the
    /// queue in FIFO order.
    pub(crate) fn raise(&mut self, event: ConventionEvent) {
        if self.aborted.is_some() {
            return;
        }
        self.pending.push_back(event);
        if self.dispatching {
            return;
        }
        self.dispatching = true;
        while let Some(event) = self.pending.pop_front() {
            tracing::debug!(
                target: "relmap::conventions",
                event = event.kind(),
                queued = self.pending.len(),
                "Dispatching convention event"
            );
            self.dispatched += 1;
            if let Err(error) = self.dispatch(&event) {
                tracing::warn!(
                    target: "relmap::conventions",
                    event = event.kind(),
                    error = %error,
                    "Convention aborted model building"
                );
                self.aborted = Some(error);
                self.pending.clear();
                break;
            }
        }
        self.dispatching = false;
    }

    fn dispatch(&mut self, event: &ConventionEvent) -> Result<(), ModelBuildingError> {
        let set: Arc<ConventionSet> = Arc::clone(&self.conventions);
        let mut ctx = ConventionContext::default();
        match event {
            ConventionEvent::EntityTypeAdded(id) => {
                let id = *id;
                run_handlers!(
                    self,
                    ctx,
                    &set.entity_type_added,
                    |b: &ModelBuilder| b.model.entity_type(id).is_some(),
                    |c| c.process_entity_type_added(self, id, &mut ctx)
                );
            }
            ConventionEvent::BaseTypeChanged {
                entity_type,
                new_base,
                old_base,
            } => {
                let id = *entity_type;
                run_handlers!(
                    self,
                    ctx,
                    &set.base_type_changed,
                    |b: &ModelBuilder| b.model.entity_type(id).is_some(),
                    |c| c.process_base_type_changed(self, id, *new_base, *old_base, &mut ctx)
                );
            }
            ConventionEvent::EntityTypeAnnotationChanged {
                entity_type,
                name,
                new,
                old,
            } => {
                let id = *entity_type;
                run_handlers!(
                    self,
                    ctx,
                    &set.entity_type_annotation_changed,
                    |b: &ModelBuilder| b.model.entity_type(id).is_some(),
                    |c| c.process_entity_type_annotation_changed(
                        self,
                        id,
                        name,
                        new.as_ref(),
                        old.as_ref(),
                        &mut ctx
                    )
                );
            }
            ConventionEvent::PropertyAdded(id) => {
                let id = *id;
                run_handlers!(
                    self,
                    ctx,
                    &set.property_added,
                    |b: &ModelBuilder| b.model.property(id).is_some(),
                    |c| c.process_property_added(self, id, &mut ctx)
                );
            }
            ConventionEvent::PropertyAnnotationChanged {
                property,
                name,
                new,
                old,
            } => {
                let id = *property;
                run_handlers!(
                    self,
                    ctx,
                    &set.property_annotation_changed,
                    |b: &ModelBuilder| b.model.property(id).is_some(),
                    |c| c.process_property_annotation_changed(
                        self,
                        id,
                        name,
                        new.as_ref(),
                        old.as_ref(),
                        &mut ctx
                    )
                );
            }
            ConventionEvent::KeyAdded(id) => {
                let id = *id;
                run_handlers!(
                    self,
                    ctx,
                    &set.key_added,
                    |b: &ModelBuilder| b.model.key(id).is_some(),
                    |c| c.process_key_added(self, id, &mut ctx)
                );
            }
            ConventionEvent::PrimaryKeyChanged {
                entity_type,
                new,
                old,
            } => {
                let id = *entity_type;
                run_handlers!(
                    self,
                    ctx,
                    &set.primary_key_changed,
                    |b: &ModelBuilder| b.model.entity_type(id).is_some(),
                    |c| c.process_primary_key_changed(self, id, *new, *old, &mut ctx)
                );
            }
            ConventionEvent::ForeignKeyAdded(id) => {
                let id = *id;
                run_handlers!(
                    self,
                    ctx,
                    &set.foreign_key_added,
                    |b: &ModelBuilder| b.model.foreign_key(id).is_some(),
                    |c| c.process_foreign_key_added(self, id, &mut ctx)
                );
            }
            ConventionEvent::NavigationAdded(id) => {
                let id = *id;
                run_handlers!(
                    self,
                    ctx,
                    &set.navigation_added,
                    |b: &ModelBuilder| b.model.navigation(id).is_some(),
                    |c| c.process_navigation_added(self, id, &mut ctx)
                );
            }
            ConventionEvent::ModelFinalizing => {
                run_handlers!(
                    self,
                    ctx,
                    &set.model_finalizing,
                    |_: &ModelBuilder| true,
                    |c| c.process_model_finalizing(self, &mut ctx)
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::conventions::{
        Convention, ConventionContext, ConventionResult, EntityTypeAddedConvention,
        PropertyAnnotationChangedConvention,
    };
    use crate::*;
    use relmap_core::{Error, ModelBuildingError, SqlType};
    use std::sync::{Arc, Mutex};

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        spawn: Option<(&'static str, &'static str)>,
        stop: bool,
    }

    impl Convention for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }
    }

    impl EntityTypeAddedConvention for Recorder {
        fn process_entity_type_added(
            &self,
            builder: &mut ModelBuilder,
            entity_type: EntityTypeId,
            context: &mut ConventionContext,
        ) -> ConventionResult {
            let name = builder.model().entity_type_name(entity_type).to_string();
            self.log.lock().unwrap().push(format!("{name}:{}", self.label));
            if let Some((trigger, spawned)) = self.spawn {
                if name == trigger {
                    builder.add_entity_type(spawned, ConfigurationSource::Convention).unwrap();
                }
            }
            if self.stop {
                context.stop_processing();
            }
            Ok(())
        }
    }

    #[test]
    fn test_events_processed_in_raised_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = ConventionSet::empty();
        set.entity_type_added.push(Arc::new(Recorder {
            label: "first",
            log: Arc::clone(&log),
            spawn: Some(("Gear", "Squad")),
            stop: false,
        }));
        set.entity_type_added.push(Arc::new(Recorder {
            label: "second",
            log: Arc::clone(&log),
            spawn: None,
            stop: false,
        }));
        let mut mb = ModelBuilder::with_conventions(set, ModelBuilderOptions::default());
        mb.entity("Gear").unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["Gear:first", "Gear:second", "Squad:first", "Squad:second"]
        );
        assert!(mb.model().find_entity_type("Squad").is_some());
        assert_eq!(mb.dispatched_events(), 2);
    }

    #[test]
    fn test_stop_processing_skips_remaining_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = ConventionSet::empty();
        set.entity_type_added.push(Arc::new(Recorder {
            label: "stopper",
            log: Arc::clone(&log),
            spawn: None,
            stop: true,
        }));
        set.entity_type_added.push(Arc::new(Recorder {
            label: "never",
            log: Arc::clone(&log),
            spawn: None,
            stop: false,
        }));
        let mut mb = ModelBuilder::with_conventions(set, ModelBuilderOptions::default());
        mb.entity("Gear").unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["Gear:stopper"]);
    }

    struct Exploding;

    impl Convention for Exploding {
        fn name(&self) -> &'static str {
            "Exploding"
        }
    }

    impl EntityTypeAddedConvention for Exploding {
        fn process_entity_type_added(
            &self,
            _builder: &mut ModelBuilder,
            _entity_type: EntityTypeId,
            _context: &mut ConventionContext,
        ) -> ConventionResult {
            Err(ModelBuildingError::new("boom"))
        }
    }

    #[test]
    fn test_fatal_convention_error_aborts_building() {
        let mut set = ConventionSet::with_defaults();
        set.entity_type_added.push(Arc::new(Exploding));
        let mut mb = ModelBuilder::with_conventions(set, ModelBuilderOptions::default());

        let err = mb.entity("Gear").unwrap_err();
        let Rejection::Aborted(e) = &err else {
            panic!("expected abort, got {err:?}");
        };
        assert_eq!(e.convention.as_deref(), Some("Exploding"));
        assert!(matches!(mb.entity("Squad"), Err(Rejection::Aborted(_))));
        assert!(matches!(mb.finalize(), Err(Error::ModelBuilding(_))));
    }

    struct CountingAnnotations(Arc<Mutex<u32>>);

    impl Convention for CountingAnnotations {
        fn name(&self) -> &'static str {
            "CountingAnnotations"
        }
    }

    impl PropertyAnnotationChangedConvention for CountingAnnotations {
        fn process_property_annotation_changed(
            &self,
            _builder: &mut ModelBuilder,
            _property: PropertyId,
            _name: &str,
            _new: Option<&Annotation>,
            _old: Option<&Annotation>,
            _context: &mut ConventionContext,
        ) -> ConventionResult {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn test_same_annotation_twice_raises_one_event() {
        let count = Arc::new(Mutex::new(0));
        let mut set = ConventionSet::with_defaults();
        set.property_annotation_changed
            .push(Arc::new(CountingAnnotations(Arc::clone(&count))));
        let mut mb = ModelBuilder::with_conventions(set, ModelBuilderOptions::default());
        let gear = mb.entity("Gear").unwrap();
        let rank = mb.property(gear, "Rank", SqlType::Integer).unwrap();
        let target = AnnotationTarget::Property(rank);

        mb.set_annotation(target, "Custom", "x", ConfigurationSource::Explicit).unwrap();
        mb.set_annotation(target, "Custom", "x", ConfigurationSource::Explicit).unwrap();
        assert_eq!(*count.lock().unwrap(), 1);

        mb.remove_annotation(target, "Custom", ConfigurationSource::Explicit).unwrap();
        assert_eq!(*count.lock().unwrap(), 2);
    }
}
