//! WebAssembly bindings via wasm-bindgen for browser integration.
//!
//! This module is only compiled when the `web` feature is enabled. Unlike
//! `ffi` (which splits the engine into an audio-thread handle and a
//! control-thread handle for a real multi-threaded host), wasm-bindgen
//! targets run single-threaded inside one JS event loop, so `CadenceEngine`
//! here owns both halves and exposes the handle's methods directly.
//!
//! # JavaScript example
//! ```javascript
//! import init, { CadenceEngine, CadenceRegistry, CadenceGraphDef, CadenceScene } from './cadence.js';
//!
//! await init();
//! cadence_init();
//!
//! const engine = new CadenceEngine(CadenceConfig.default_config());
//! const registry = new CadenceRegistry();
//! const def = new CadenceGraphDef();
//! const osc = def.add_node(1);   // SINE_OSC
//! const out = def.add_node(100); // OUTPUT
//! def.connect(osc, out);
//! def.set_output(out);
//!
//! const scene = new CadenceScene(512, 16);
//! const idx = scene.add_instrument(def, registry, 48000.0);
//! scene.add_layer(idx, -1, 0, 127, 0);
//! engine.install_scene(scene);
//!
//! const output = engine.process(new Uint32Array(), 128);
//! ```

use wasm_bindgen::prelude::*;

use crate::compile::{self, GraphDef};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::midi::MidiEvent;
use crate::module_registry::ModuleRegistry;
use crate::nodes::register_standard_modules;
use crate::pattern::{Pattern, PatternEvent, PatternEventKind};
use crate::scene::{Instrument, Layer, LayerFilter, Scene};
use crate::song::{Song, SongPlayback};
use crate::time_mapper::TempoPoint;
use crate::track::{Track, TrackItem};

// ═══════════════════════════════════════════════════════════════════════════
// Initialization
// ═══════════════════════════════════════════════════════════════════════════

/// Sets up the panic hook and console logging. Call once before using
/// anything else in this module.
#[wasm_bindgen(js_name = cadence_init)]
pub fn cadence_init() {
    console_error_panic_hook::set_once();
    console_log::init_with_level(log::Level::Debug).ok();
}

// ═══════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════

#[wasm_bindgen]
#[derive(Clone, Copy)]
pub struct CadenceConfig {
    pub sample_rate: f64,
    pub ppqn_factor: u32,
    pub max_block_size: usize,
    pub max_voices_per_instrument: usize,
    pub rt_command_capacity: usize,
    pub output_channels: usize,
}

#[wasm_bindgen]
impl CadenceConfig {
    #[wasm_bindgen(js_name = default_config)]
    pub fn default_config() -> CadenceConfig {
        let d = EngineConfig::default();
        CadenceConfig {
            sample_rate: d.sample_rate,
            ppqn_factor: d.ppqn_factor,
            max_block_size: d.max_block_size,
            max_voices_per_instrument: d.max_voices_per_instrument,
            rt_command_capacity: d.rt_command_capacity,
            output_channels: 2,
        }
    }
}

impl From<CadenceConfig> for EngineConfig {
    fn from(c: CadenceConfig) -> Self {
        EngineConfig {
            sample_rate: c.sample_rate,
            ppqn_factor: c.ppqn_factor,
            max_block_size: c.max_block_size,
            max_voices_per_instrument: c.max_voices_per_instrument,
            rt_command_capacity: c.rt_command_capacity,
            ..EngineConfig::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

/// Owns both the RT engine and its control handle --- sound here because
/// wasm-bindgen targets are single-threaded; there is no separate audio
/// callback thread to hand the control half to.
#[wasm_bindgen]
pub struct CadenceEngine {
    engine: Engine,
    handle: crate::engine::EngineHandle,
    output_channels: usize,
}

#[wasm_bindgen]
impl CadenceEngine {
    #[wasm_bindgen(constructor)]
    pub fn new(config: CadenceConfig) -> Result<CadenceEngine, JsValue> {
        let output_channels = config.output_channels.max(1);
        let (engine, handle) = Engine::new(config.into(), output_channels)
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        Ok(CadenceEngine { engine, handle, output_channels })
    }

    pub fn play(&mut self) {
        self.engine.play();
    }

    #[wasm_bindgen(js_name = requestStop)]
    pub fn request_stop(&mut self) {
        self.engine.request_stop();
    }

    #[wasm_bindgen(js_name = requestTempo)]
    pub fn request_tempo(&mut self, bpm: f64) {
        self.engine.request_tempo(bpm);
    }

    /// Returns `false` if the seek could not complete this call (no room
    /// for a stuck-note release); call again on the next block.
    pub fn seek(&mut self, target_ppqn: u64) -> bool {
        self.engine.seek(target_ppqn)
    }

    #[wasm_bindgen(js_name = songPosPpqn)]
    pub fn song_pos_ppqn(&self) -> u64 {
        self.engine.master().song_pos_ppqn
    }

    #[wasm_bindgen(js_name = lateTime)]
    pub fn late_time(&self, counter: u64) -> u32 {
        self.engine.late_time(counter)
    }

    /// Injects one MIDI event (`status`, `data1`, `data2`) into the aux
    /// input. Returns `false` if the aux ring is full.
    #[wasm_bindgen(js_name = injectAux)]
    pub fn inject_aux(&mut self, status: u8, data1: u8, data2: u8) -> bool {
        let event = MidiEvent::new(0, &[status, data1, data2]);
        self.handle.inject_aux(event).is_ok()
    }

    #[wasm_bindgen(js_name = installScene)]
    pub fn install_scene(&mut self, scene: CadenceScene) -> bool {
        self.handle.install_scene(scene.inner).is_ok()
    }

    #[wasm_bindgen(js_name = clearScene)]
    pub fn clear_scene(&mut self) -> bool {
        self.handle.clear_scene().is_ok()
    }

    #[wasm_bindgen(js_name = installSong)]
    pub fn install_song(&mut self, song: CadenceSongPlayback) -> bool {
        self.handle.install_song(song.inner).is_ok()
    }

    #[wasm_bindgen(js_name = clearSong)]
    pub fn clear_song(&mut self) -> bool {
        self.handle.clear_song().is_ok()
    }

    /// Renders one block. `host_midi` is a flat `Uint32Array` of packed
    /// events, four `u32`s per event: `[time_samples, status, data1,
    /// data2]`. Returns the rendered, planar `output_channels * frames`
    /// buffer.
    pub fn process(&mut self, host_midi: &[u32], frames: usize) -> Vec<f32> {
        let host_events: Vec<MidiEvent> = host_midi
            .chunks_exact(4)
            .map(|c| MidiEvent::new(c[0], &[c[1] as u8, c[2] as u8, c[3] as u8]))
            .collect();
        let _ = self.output_channels;
        self.engine.process(&host_events, frames).to_vec()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Module registry
// ═══════════════════════════════════════════════════════════════════════════

#[wasm_bindgen]
pub struct CadenceRegistry {
    inner: ModuleRegistry,
}

#[wasm_bindgen]
impl CadenceRegistry {
    #[wasm_bindgen(constructor)]
    pub fn new() -> CadenceRegistry {
        let mut inner = ModuleRegistry::new();
        register_standard_modules(&mut inner);
        CadenceRegistry { inner }
    }
}

impl Default for CadenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Declarative graph construction
// ═══════════════════════════════════════════════════════════════════════════

#[wasm_bindgen]
pub struct CadenceGraphDef {
    inner: GraphDef,
}

#[wasm_bindgen]
impl CadenceGraphDef {
    #[wasm_bindgen(constructor)]
    pub fn new() -> CadenceGraphDef {
        CadenceGraphDef { inner: GraphDef::new() }
    }

    #[wasm_bindgen(js_name = addNode)]
    pub fn add_node(&mut self, module_type: u32) -> u64 {
        self.inner.add_node(module_type)
    }

    pub fn connect(&mut self, source_node: u64, dest_node: u64) {
        self.inner.connect(source_node, dest_node);
    }

    #[wasm_bindgen(js_name = setParam)]
    pub fn set_param(&mut self, node: u64, param_id: u32, value: f32) {
        self.inner.set_param(node, param_id, value);
    }

    #[wasm_bindgen(js_name = setOutput)]
    pub fn set_output(&mut self, node: u64) {
        self.inner.output_node = Some(node);
    }
}

impl Default for CadenceGraphDef {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scene / instrument construction
// ═══════════════════════════════════════════════════════════════════════════

#[wasm_bindgen]
pub struct CadenceScene {
    inner: Scene,
    max_block: usize,
    max_voices: usize,
}

#[wasm_bindgen]
impl CadenceScene {
    #[wasm_bindgen(constructor)]
    pub fn new(max_block: usize, max_voices: usize) -> CadenceScene {
        CadenceScene { inner: Scene::new("scene"), max_block, max_voices }
    }

    /// Compiles `def` against `registry` into a fresh instrument and adds
    /// it to this scene, returning its instrument index, or `null` on a
    /// compile error (e.g. unknown module type or dangling connection).
    #[wasm_bindgen(js_name = addInstrument)]
    pub fn add_instrument(&mut self, def: &CadenceGraphDef, registry: &CadenceRegistry, sample_rate: f64) -> Option<u32> {
        let graph = compile::compile(&def.inner, &registry.inner, self.max_block, self.max_voices).ok()?;
        let mut instrument = Instrument::new("instrument", self.max_block, self.max_voices);
        instrument.graph = graph;
        instrument.graph.prepare(sample_rate);
        Some(self.inner.add_instrument(instrument) as u32)
    }

    /// `channel` of `-1` means "any channel".
    #[wasm_bindgen(js_name = addLayer)]
    pub fn add_layer(&mut self, instrument_index: u32, channel: i16, note_lo: u8, note_hi: u8, transpose: i8) {
        let filter = LayerFilter {
            channel: if channel < 0 { None } else { Some(channel as u8) },
            note_lo,
            note_hi,
            transpose,
        };
        self.inner.add_layer(Layer { filter, instrument_index: instrument_index as usize });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Song construction
// ═══════════════════════════════════════════════════════════════════════════

#[wasm_bindgen]
pub struct CadenceSongBuilder {
    patterns: Vec<Pattern>,
    tracks: Vec<Track>,
    tempo_map: Vec<TempoPoint>,
    loop_start_ppqn: u64,
    loop_end_ppqn: u64,
    looping: bool,
}

#[wasm_bindgen]
impl CadenceSongBuilder {
    #[wasm_bindgen(constructor)]
    pub fn new() -> CadenceSongBuilder {
        CadenceSongBuilder {
            patterns: Vec::new(),
            tracks: Vec::new(),
            tempo_map: vec![TempoPoint { start_ppqn: 0, bpm: 120.0 }],
            loop_start_ppqn: 0,
            loop_end_ppqn: 0,
            looping: false,
        }
    }

    #[wasm_bindgen(js_name = setLoop)]
    pub fn set_loop(&mut self, start_ppqn: u64, end_ppqn: u64, looping: bool) {
        self.loop_start_ppqn = start_ppqn;
        self.loop_end_ppqn = end_ppqn;
        self.looping = looping;
    }

    #[wasm_bindgen(js_name = setTempo)]
    pub fn set_tempo(&mut self, start_ppqn: u64, bpm: f64) {
        self.tempo_map.push(TempoPoint { start_ppqn, bpm });
        self.tempo_map.sort_by_key(|p| p.start_ppqn);
    }

    #[wasm_bindgen(js_name = addPattern)]
    pub fn add_pattern(&mut self, loop_end_ppqn: u64) -> u32 {
        self.patterns.push(Pattern::new("pattern", loop_end_ppqn));
        (self.patterns.len() - 1) as u32
    }

    /// `kind`: 0 = NoteOn (uses `note`/`velocity`), 1 = NoteOff (uses
    /// `note`), 2 = ParamChange (`note` as the low byte of `param_id`,
    /// `velocity` as the low byte of `value_bits`).
    #[wasm_bindgen(js_name = patternPushEvent)]
    pub fn pattern_push_event(
        &mut self,
        pattern_index: u32,
        time_ppqn: u64,
        channel: u8,
        kind: u8,
        note: u8,
        velocity: u8,
    ) -> bool {
        let Some(pattern) = self.patterns.get_mut(pattern_index as usize) else {
            return false;
        };
        let event_kind = match kind {
            0 => PatternEventKind::NoteOn { note, velocity },
            1 => PatternEventKind::NoteOff { note },
            2 => PatternEventKind::ParamChange { param_id: note as u32, value_bits: velocity as u32 },
            _ => return false,
        };
        pattern.push_event(PatternEvent { time_ppqn, channel, kind: event_kind });
        true
    }

    #[wasm_bindgen(js_name = addTrack)]
    pub fn add_track(&mut self) -> u32 {
        self.tracks.push(Track::new("track"));
        (self.tracks.len() - 1) as u32
    }

    #[wasm_bindgen(js_name = trackAddItem)]
    pub fn track_add_item(
        &mut self,
        track_index: u32,
        pattern_index: u32,
        start_ppqn: u64,
        end_ppqn: u64,
        offset_ppqn: u64,
    ) -> bool {
        let Some(pattern) = self.patterns.get(pattern_index as usize) else {
            return false;
        };
        let pattern_id = pattern.id;
        let Some(track) = self.tracks.get_mut(track_index as usize) else {
            return false;
        };
        track.add_item(TrackItem { pattern_id, start_ppqn, end_ppqn, offset_ppqn });
        true
    }

    /// Consumes this builder, compiling every track against its referenced
    /// patterns into an RT-installable `CadenceSongPlayback`.
    pub fn compile(self, sample_rate: f64, ppqn_factor: u32) -> CadenceSongPlayback {
        let compiled_patterns: Vec<_> = self.patterns.iter().map(|p| p.compile()).collect();

        let song = Song::new("song");
        let _ = song.id;
        let mut playback = SongPlayback::new(self.tempo_map, sample_rate, ppqn_factor);
        playback.loop_start_ppqn = self.loop_start_ppqn;
        playback.loop_end_ppqn = self.loop_end_ppqn;
        playback.looping = self.looping;

        for mut track in self.tracks {
            let lookup = |id| compiled_patterns.iter().find(|p| p.id == id).cloned();
            playback.tracks.push(track.compile(lookup));
        }

        CadenceSongPlayback { inner: playback }
    }
}

impl Default for CadenceSongBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[wasm_bindgen]
pub struct CadenceSongPlayback {
    inner: SongPlayback,
}
