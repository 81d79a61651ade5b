// src/module_registry.rs
//
// Factories capable of producing fresh `Module` instances, keyed by a
// stable numeric type id so a `Pattern`/`Scene` command referencing
// "module type 20" can be resolved without the control thread needing to
// know concrete Rust types. Used only during graph construction/recompile,
// never on the RT path.

use std::collections::HashMap;

use crate::module::{Module, Polyphony};

pub trait ModuleFactory: Send {
    fn create(&self) -> Box<dyn Module>;
    fn polyphony(&self) -> Polyphony;
    fn num_channels(&self) -> usize;
}

pub struct SimpleModuleFactory<F>
where
    F: Fn() -> Box<dyn Module> + Send,
{
    create_fn: F,
    polyphony: Polyphony,
    channels: usize,
}

impl<F> SimpleModuleFactory<F>
where
    F: Fn() -> Box<dyn Module> + Send,
{
    pub fn new(create_fn: F, polyphony: Polyphony) -> Self {
        Self {
            create_fn,
            polyphony,
            channels: 2,
        }
    }

    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }
}

impl<F> ModuleFactory for SimpleModuleFactory<F>
where
    F: Fn() -> Box<dyn Module> + Send,
{
    fn create(&self) -> Box<dyn Module> {
        (self.create_fn)()
    }

    fn polyphony(&self) -> Polyphony {
        self.polyphony
    }

    fn num_channels(&self) -> usize {
        self.channels
    }
}

#[derive(Clone)]
pub struct ModuleTypeInfo {
    pub id: u32,
    pub name: &'static str,
    pub category: &'static str,
}

impl ModuleTypeInfo {
    pub fn new(id: u32, name: &'static str, category: &'static str) -> Self {
        Self { id, name, category }
    }
}

/// Maps a module type id to its factory and display metadata. Populated
/// once at startup by `nodes::register_standard_modules` and consulted by
/// the control thread when compiling an `Instrument`'s graph from a
/// declarative description.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: HashMap<u32, (ModuleTypeInfo, Box<dyn ModuleFactory>)>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, info: ModuleTypeInfo, factory: impl ModuleFactory + 'static) {
        self.entries.insert(info.id, (info, Box::new(factory)));
    }

    pub fn factory(&self, type_id: u32) -> Option<&dyn ModuleFactory> {
        self.entries.get(&type_id).map(|(_, f)| f.as_ref())
    }

    pub fn info(&self, type_id: u32) -> Option<&ModuleTypeInfo> {
        self.entries.get(&type_id).map(|(i, _)| i)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::AudioBuffer;
    use crate::module::ProcessContext;

    struct Passthrough;
    impl Module for Passthrough {
        fn prepare(&mut self, _sample_rate: f64, _max_block: usize) {}
        fn process(&mut self, _ctx: &ProcessContext, _inputs: &[&AudioBuffer], output: &mut AudioBuffer) -> bool {
            output.clear();
            true
        }
        fn num_channels(&self) -> usize {
            1
        }
        fn set_param(&mut self, _param_id: u32, _value: f32) {}
    }

    #[test]
    fn registry_looks_up_registered_factory() {
        let mut registry = ModuleRegistry::new();
        registry.register(
            ModuleTypeInfo::new(1, "Passthrough", "Utility"),
            SimpleModuleFactory::new(|| Box::new(Passthrough), Polyphony::Global),
        );
        assert!(registry.factory(1).is_some());
        assert!(registry.factory(2).is_none());
        assert_eq!(registry.info(1).unwrap().name, "Passthrough");
    }
}
