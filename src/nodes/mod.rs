// Standard module types for the instrument graph.

mod effects;
mod envelope;
mod filters;
mod modulation;
mod oscillators;
mod utility;

pub use effects::*;
pub use envelope::*;
pub use filters::*;
pub use modulation::*;
pub use oscillators::*;
pub use utility::*;

use crate::module::Polyphony;
use crate::module_registry::{ModuleRegistry, ModuleTypeInfo, SimpleModuleFactory};

// ═══════════════════════════════════════════════════════════════════
// Module Type IDs
// ═══════════════════════════════════════════════════════════════════

pub mod module_types {
    // Oscillators (1-9)
    pub const SINE_OSC: u32 = 1;
    pub const SAW_OSC: u32 = 2;
    pub const SQUARE_OSC: u32 = 3;
    pub const TRIANGLE_OSC: u32 = 4;

    // Envelopes (10-19)
    pub const ADSR_ENV: u32 = 10;

    // Effects (20-39)
    pub const GAIN: u32 = 20;
    pub const PAN: u32 = 21;
    pub const DELAY: u32 = 23;
    pub const REVERB: u32 = 24;

    // Filters (40-49)
    pub const LOWPASS: u32 = 40;
    pub const HIGHPASS: u32 = 41;
    pub const BANDPASS: u32 = 42;
    pub const NOTCH: u32 = 43;

    // Modulators (50-59)
    pub const LFO: u32 = 50;

    // Utility (100+)
    pub const OUTPUT: u32 = 100;
}

// ═══════════════════════════════════════════════════════════════════
// Parameter IDs (per module type)
// ═══════════════════════════════════════════════════════════════════

pub mod params {
    // Oscillator params
    pub const FREQ: u32 = 0;
    pub const DETUNE: u32 = 1;
    pub const PULSE_WIDTH: u32 = 3;

    // Envelope params
    pub const ATTACK: u32 = 0;
    pub const DECAY: u32 = 1;
    pub const SUSTAIN: u32 = 2;
    pub const RELEASE: u32 = 3;

    // Gain/mixer params
    pub const GAIN: u32 = 0;
    pub const PAN: u32 = 1;

    // Filter params
    pub const CUTOFF: u32 = 0;
    pub const RESONANCE: u32 = 1;

    // LFO params
    pub const RATE: u32 = 0;
    pub const DEPTH: u32 = 1;
    pub const WAVEFORM: u32 = 2;

    // Delay params
    pub const TIME: u32 = 0;
    pub const FEEDBACK: u32 = 1;
    pub const MIX: u32 = 2;

    // Reverb params: reuses DECAY (0), DAMPING (1), MIX (2)
    pub const DAMPING: u32 = 1;
}

// ═══════════════════════════════════════════════════════════════════
// Registry population
// ═══════════════════════════════════════════════════════════════════

/// Populates a registry with every built-in module type. These are
/// illustrative, testable DSP implementations, not the engine's specified
/// subject matter --- a real deployment would register a larger, plugin-
/// sourced set the same way.
pub fn register_standard_modules(registry: &mut ModuleRegistry) {
    register_oscillators(registry);
    register_envelopes(registry);
    register_filters(registry);
    register_modulators(registry);
    register_effects(registry);
    register_utility(registry);
}

fn register_oscillators(registry: &mut ModuleRegistry) {
    registry.register(
        ModuleTypeInfo::new(module_types::SINE_OSC, "Sine", "Oscillators"),
        SimpleModuleFactory::new(|| Box::new(SineOsc::new()), Polyphony::PerVoice).channels(1),
    );
    registry.register(
        ModuleTypeInfo::new(module_types::SAW_OSC, "Saw", "Oscillators"),
        SimpleModuleFactory::new(|| Box::new(SawOsc::new()), Polyphony::PerVoice).channels(1),
    );
    registry.register(
        ModuleTypeInfo::new(module_types::SQUARE_OSC, "Square", "Oscillators"),
        SimpleModuleFactory::new(|| Box::new(SquareOsc::new()), Polyphony::PerVoice).channels(1),
    );
    registry.register(
        ModuleTypeInfo::new(module_types::TRIANGLE_OSC, "Triangle", "Oscillators"),
        SimpleModuleFactory::new(|| Box::new(TriangleOsc::new()), Polyphony::PerVoice).channels(1),
    );
}

fn register_envelopes(registry: &mut ModuleRegistry) {
    registry.register(
        ModuleTypeInfo::new(module_types::ADSR_ENV, "ADSR", "Envelopes"),
        SimpleModuleFactory::new(|| Box::new(AdsrEnvelope::new()), Polyphony::PerVoice).channels(1),
    );
}

fn register_filters(registry: &mut ModuleRegistry) {
    registry.register(
        ModuleTypeInfo::new(module_types::LOWPASS, "Lowpass", "Filters"),
        SimpleModuleFactory::new(|| Box::new(SvfFilter::lowpass()), Polyphony::PerVoice).channels(1),
    );
    registry.register(
        ModuleTypeInfo::new(module_types::HIGHPASS, "Highpass", "Filters"),
        SimpleModuleFactory::new(|| Box::new(SvfFilter::highpass()), Polyphony::PerVoice).channels(1),
    );
    registry.register(
        ModuleTypeInfo::new(module_types::BANDPASS, "Bandpass", "Filters"),
        SimpleModuleFactory::new(|| Box::new(SvfFilter::bandpass()), Polyphony::PerVoice).channels(1),
    );
    registry.register(
        ModuleTypeInfo::new(module_types::NOTCH, "Notch", "Filters"),
        SimpleModuleFactory::new(|| Box::new(SvfFilter::notch()), Polyphony::PerVoice).channels(1),
    );
}

fn register_modulators(registry: &mut ModuleRegistry) {
    registry.register(
        ModuleTypeInfo::new(module_types::LFO, "LFO", "Modulators"),
        SimpleModuleFactory::new(|| Box::new(Lfo::new()), Polyphony::Global).channels(1),
    );
}

fn register_effects(registry: &mut ModuleRegistry) {
    registry.register(
        ModuleTypeInfo::new(module_types::GAIN, "Gain", "Effects"),
        SimpleModuleFactory::new(|| Box::new(GainNode::new()), Polyphony::Global).channels(2),
    );
    registry.register(
        ModuleTypeInfo::new(module_types::PAN, "Pan", "Effects"),
        SimpleModuleFactory::new(|| Box::new(PanNode::new()), Polyphony::Global).channels(2),
    );
    registry.register(
        ModuleTypeInfo::new(module_types::DELAY, "Delay", "Effects"),
        SimpleModuleFactory::new(|| Box::new(DelayNode::new()), Polyphony::Global).channels(2),
    );
    registry.register(
        ModuleTypeInfo::new(module_types::REVERB, "Reverb", "Effects"),
        SimpleModuleFactory::new(|| Box::new(ReverbNode::new()), Polyphony::Global).channels(2),
    );
}

fn register_utility(registry: &mut ModuleRegistry) {
    registry.register(
        ModuleTypeInfo::new(module_types::OUTPUT, "Output", "Utility"),
        SimpleModuleFactory::new(|| Box::new(OutputNode::new()), Polyphony::Global).channels(2),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_has_all_module_types() {
        let mut registry = ModuleRegistry::new();
        register_standard_modules(&mut registry);
        assert!(registry.factory(module_types::SINE_OSC).is_some());
        assert!(registry.factory(module_types::ADSR_ENV).is_some());
        assert!(registry.factory(module_types::REVERB).is_some());
        assert!(registry.factory(module_types::OUTPUT).is_some());
        assert_eq!(registry.len(), 15);
    }
}
