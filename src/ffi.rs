// src/ffi.rs
//
// C-compatible FFI bindings for host integration (Swift/iOS, C/C++ hosts).
//
// Safety requirements:
// - All pointers must be non-null unless documented otherwise
// - All handles must be created by this module and not fabricated
// - Caller must call the corresponding `_destroy` function for each `_create`
// - `cadence_engine_process` must only be called from the audio thread that
//   owns the engine; everything else here is safe to call from any thread

use std::slice;

use crate::compile::{self, GraphDef};
use crate::config::EngineConfig;
use crate::engine::{Engine, EngineHandle as RtEngineHandle};
use crate::midi::MidiEvent;
use crate::module_registry::ModuleRegistry;
use crate::nodes::register_standard_modules;
use crate::pattern::{Pattern, PatternEvent, PatternEventKind};
use crate::scene::{Instrument, Layer, LayerFilter, Scene};
use crate::song::{Song, SongPlayback};
use crate::time_mapper::TempoPoint;
use crate::track::{Track, TrackItem};

#[cfg(feature = "ios")]
use log::LevelFilter;
#[cfg(feature = "ios")]
use oslog::OsLogger;

const LOG_SUBSYSTEM: &str = "engine.cadence";

// ═══════════════════════════════════════════════════════════════════════════
// Logger initialization (iOS only --- other hosts wire their own `log`
// backend before calling anything else here)
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(feature = "ios")]
#[unsafe(no_mangle)]
pub extern "C" fn cadence_init_logger() {
    OsLogger::new(LOG_SUBSYSTEM).level_filter(LevelFilter::Debug).init().ok();
}

// ═══════════════════════════════════════════════════════════════════════════
// Config
// ═══════════════════════════════════════════════════════════════════════════

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CadenceConfig {
    pub sample_rate: f64,
    pub ppqn_factor: u32,
    pub max_block_size: usize,
    pub max_voices_per_instrument: usize,
    pub rt_command_capacity: usize,
    pub output_channels: usize,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        let d = EngineConfig::default();
        Self {
            sample_rate: d.sample_rate,
            ppqn_factor: d.ppqn_factor,
            max_block_size: d.max_block_size,
            max_voices_per_instrument: d.max_voices_per_instrument,
            rt_command_capacity: d.rt_command_capacity,
            output_channels: 2,
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_config_default() -> CadenceConfig {
    CadenceConfig::default()
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
// Opaque handles
// ═══════════════════════════════════════════════════════════════════════════

/// Audio-thread side: owns the RT engine, called from the process callback.
pub struct CadenceEngine {
    inner: Engine,
    output_channels: usize,
}

/// Control-thread side: the handle used to install scenes/songs and inject
/// MIDI from off the audio thread.
pub struct CadenceHandle {
    inner: RtEngineHandle,
}

pub struct CadenceRegistry {
    inner: ModuleRegistry,
}

pub struct CadenceGraphDef {
    inner: GraphDef,
}

pub struct CadenceScene {
    inner: Scene,
    max_block: usize,
    max_voices: usize,
}

/// Authoring-side song builder: accumulates patterns and tracks under
/// plain, builder-local `u32` handles (not `DocId`s --- those stay internal
/// to the library) until `cadence_song_builder_compile` produces the
/// RT-installable `SongPlayback`.
pub struct CadenceSongBuilder {
    patterns: Vec<Pattern>,
    tracks: Vec<Track>,
    tempo_map: Vec<TempoPoint>,
    loop_start_ppqn: u64,
    loop_end_ppqn: u64,
    looping: bool,
}

pub struct CadenceSongPlayback {
    inner: Option<SongPlayback>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine lifecycle
// ═══════════════════════════════════════════════════════════════════════════

/// Creates the engine pair. On success, writes the audio-side handle to
/// `out_engine` and the control-side handle to `out_handle` and returns
/// `true`. On failure (invalid config) neither pointer is written and
/// `false` is returned.
///
/// # Safety
/// `out_engine` and `out_handle` must be valid, non-null, writable pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_create(
    config: CadenceConfig,
    out_engine: *mut *mut CadenceEngine,
    out_handle: *mut *mut CadenceHandle,
) -> bool {
    let output_channels = config.output_channels.max(1);
    let Ok((engine, handle)) = Engine::new(config.into(), output_channels) else {
        return false;
    };

    let engine_box = Box::new(CadenceEngine { inner: engine, output_channels });
    let handle_box = Box::new(CadenceHandle { inner: handle });

    unsafe {
        *out_engine = Box::into_raw(engine_box);
        *out_handle = Box::into_raw(handle_box);
    }
    true
}

/// # Safety
/// `engine` must be a pointer returned by `cadence_engine_create` and not
/// previously destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_destroy(engine: *mut CadenceEngine) {
    if !engine.is_null() {
        drop(unsafe { Box::from_raw(engine) });
    }
}

/// # Safety
/// `handle` must be a pointer returned by `cadence_engine_create` and not
/// previously destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_handle_destroy(handle: *mut CadenceHandle) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle) });
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_engine_play(engine: &mut CadenceEngine) {
    engine.inner.play();
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_engine_request_stop(engine: &mut CadenceEngine) {
    engine.inner.request_stop();
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_engine_request_tempo(engine: &mut CadenceEngine, bpm: f64) {
    engine.inner.request_tempo(bpm);
}

/// Returns `false` if the seek could not complete this call (no room for a
/// stuck-note release); the host should call again on the next callback.
#[unsafe(no_mangle)]
pub extern "C" fn cadence_engine_seek(engine: &mut CadenceEngine, target_ppqn: u64) -> bool {
    engine.inner.seek(target_ppqn)
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_engine_song_pos_ppqn(engine: &CadenceEngine) -> u64 {
    engine.inner.master().song_pos_ppqn
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_engine_late_time(engine: &CadenceEngine, counter: u64) -> u32 {
    engine.inner.late_time(counter)
}

/// Renders one block. `host_midi`/`host_midi_len` describe this block's raw
/// MIDI input (may be null/0 for none); the rendered, planar
/// `output_channels * frames` buffer is written into `out` (caller-owned,
/// must hold at least `out_len` `f32`s). Returns the number of samples
/// actually written.
///
/// # Safety
/// `engine` and `out` must be valid; `host_midi` must point to at least
/// `host_midi_len` contiguous `CadenceMidiEvent`s, or be null if
/// `host_midi_len` is 0. `out` must point to at least `out_len` writable
/// `f32`s.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_process(
    engine: &mut CadenceEngine,
    host_midi: *const CadenceMidiEvent,
    host_midi_len: usize,
    frames: usize,
    out: *mut f32,
    out_len: usize,
) -> usize {
    let host_events: Vec<MidiEvent> = if host_midi.is_null() || host_midi_len == 0 {
        Vec::new()
    } else {
        unsafe { slice::from_raw_parts(host_midi, host_midi_len) }.iter().map(|e| (*e).into()).collect()
    };

    let rendered = engine.inner.process(&host_events, frames);
    let n = rendered.len().min(out_len);
    if !out.is_null() && n > 0 {
        unsafe { slice::from_raw_parts_mut(out, n) }.copy_from_slice(&rendered[..n]);
    }
    let _ = engine.output_channels;
    n
}

// ═══════════════════════════════════════════════════════════════════════════
// MIDI
// ═══════════════════════════════════════════════════════════════════════════

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CadenceMidiEvent {
    pub time_samples: u32,
    pub size: u8,
    pub bytes: [u8; 4],
}

impl From<CadenceMidiEvent> for MidiEvent {
    fn from(e: CadenceMidiEvent) -> Self {
        MidiEvent { time_samples: e.time_samples, size: e.size, bytes: e.bytes }
    }
}

/// Injects one event into the engine's aux MIDI input (off-audio-thread
/// path, e.g. a UI-thread virtual keyboard). Returns `false` if the aux
/// ring is full.
#[unsafe(no_mangle)]
pub extern "C" fn cadence_handle_inject_aux(handle: &mut CadenceHandle, event: CadenceMidiEvent) -> bool {
    handle.inner.inject_aux(event.into()).is_ok()
}

// ═══════════════════════════════════════════════════════════════════════════
// Module registry
// ═══════════════════════════════════════════════════════════════════════════

#[unsafe(no_mangle)]
pub extern "C" fn cadence_registry_create() -> *mut CadenceRegistry {
    let mut inner = ModuleRegistry::new();
    register_standard_modules(&mut inner);
    Box::into_raw(Box::new(CadenceRegistry { inner }))
}

/// # Safety
/// `registry` must be a pointer returned by `cadence_registry_create` and
/// not previously destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_registry_destroy(registry: *mut CadenceRegistry) {
    if !registry.is_null() {
        drop(unsafe { Box::from_raw(registry) });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Declarative graph construction
// ═══════════════════════════════════════════════════════════════════════════

#[unsafe(no_mangle)]
pub extern "C" fn cadence_graph_def_create() -> *mut CadenceGraphDef {
    Box::into_raw(Box::new(CadenceGraphDef { inner: GraphDef::new() }))
}

/// # Safety
/// `def` must be a pointer returned by `cadence_graph_def_create` and not
/// previously destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_graph_def_destroy(def: *mut CadenceGraphDef) {
    if !def.is_null() {
        drop(unsafe { Box::from_raw(def) });
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_graph_def_add_node(def: &mut CadenceGraphDef, module_type: u32) -> u64 {
    def.inner.add_node(module_type)
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_graph_def_connect(def: &mut CadenceGraphDef, source_node: u64, dest_node: u64) {
    def.inner.connect(source_node, dest_node);
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_graph_def_set_param(def: &mut CadenceGraphDef, node: u64, param_id: u32, value: f32) {
    def.inner.set_param(node, param_id, value);
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_graph_def_set_output(def: &mut CadenceGraphDef, node: u64) {
    def.inner.output_node = Some(node);
}

// ═══════════════════════════════════════════════════════════════════════════
// Scene / instrument construction
// ═══════════════════════════════════════════════════════════════════════════

#[unsafe(no_mangle)]
pub extern "C" fn cadence_scene_create(max_block: usize, max_voices: usize) -> *mut CadenceScene {
    Box::into_raw(Box::new(CadenceScene { inner: Scene::new("scene"), max_block, max_voices }))
}

/// # Safety
/// `scene` must be a pointer returned by `cadence_scene_create`, not
/// previously destroyed or passed to `cadence_engine_install_scene` (which
/// takes ownership).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_scene_destroy(scene: *mut CadenceScene) {
    if !scene.is_null() {
        drop(unsafe { Box::from_raw(scene) });
    }
}

/// Compiles `def` against `registry` into a fresh instrument and adds it to
/// `scene`, returning its instrument index (for use with
/// `cadence_scene_add_layer`), or `u32::MAX` on a compile error (e.g.
/// unknown module type or dangling connection). `def` is borrowed, not
/// consumed --- destroy it separately once done.
#[unsafe(no_mangle)]
pub extern "C" fn cadence_scene_add_instrument(
    scene: &mut CadenceScene,
    def: &CadenceGraphDef,
    registry: &CadenceRegistry,
    sample_rate: f64,
) -> u32 {
    let Ok(graph) = compile::compile(&def.inner, &registry.inner, scene.max_block, scene.max_voices) else {
        return u32::MAX;
    };
    let mut instrument = Instrument::new("instrument", scene.max_block, scene.max_voices);
    instrument.graph = graph;
    instrument.graph.prepare(sample_rate);
    scene.inner.add_instrument(instrument) as u32
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_scene_add_layer(
    scene: &mut CadenceScene,
    instrument_index: u32,
    channel: i16, // negative means "any channel"
    note_lo: u8,
    note_hi: u8,
    transpose: i8,
) {
    let filter = LayerFilter {
        channel: if channel < 0 { None } else { Some(channel as u8) },
        note_lo,
        note_hi,
        transpose,
    };
    scene.inner.add_layer(Layer { filter, instrument_index: instrument_index as usize });
}

/// Installs `scene` (taking ownership) on the RT command queue. Returns
/// `false` if the queue was full --- the host should retry.
///
/// # Safety
/// `scene` must be a pointer returned by `cadence_scene_create` and not
/// previously destroyed; ownership transfers to the engine either way, so
/// the caller must not use or destroy it afterward.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_install_scene(handle: &mut CadenceHandle, scene: *mut CadenceScene) -> bool {
    let scene = unsafe { Box::from_raw(scene) };
    handle.inner.install_scene(scene.inner).is_ok()
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_engine_clear_scene(handle: &mut CadenceHandle) -> bool {
    handle.inner.clear_scene().is_ok()
}

// ═══════════════════════════════════════════════════════════════════════════
// Song construction
// ═══════════════════════════════════════════════════════════════════════════

#[unsafe(no_mangle)]
pub extern "C" fn cadence_song_builder_create() -> *mut CadenceSongBuilder {
    Box::into_raw(Box::new(CadenceSongBuilder {
        patterns: Vec::new(),
        tracks: Vec::new(),
        tempo_map: vec![TempoPoint { start_ppqn: 0, bpm: 120.0 }],
        loop_start_ppqn: 0,
        loop_end_ppqn: 0,
        looping: false,
    }))
}

/// # Safety
/// `builder` must be a pointer returned by `cadence_song_builder_create`
/// and not previously destroyed or consumed by
/// `cadence_song_builder_compile`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_song_builder_destroy(builder: *mut CadenceSongBuilder) {
    if !builder.is_null() {
        drop(unsafe { Box::from_raw(builder) });
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_song_builder_set_loop(builder: &mut CadenceSongBuilder, start_ppqn: u64, end_ppqn: u64, looping: bool) {
    builder.loop_start_ppqn = start_ppqn;
    builder.loop_end_ppqn = end_ppqn;
    builder.looping = looping;
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_song_builder_set_tempo(builder: &mut CadenceSongBuilder, start_ppqn: u64, bpm: f64) {
    builder.tempo_map.push(TempoPoint { start_ppqn, bpm });
    builder.tempo_map.sort_by_key(|p| p.start_ppqn);
}

/// Adds an empty pattern, returning its builder-local index (used with
/// `cadence_song_builder_pattern_push_event` and as the `pattern_index`
/// argument to `cadence_song_builder_track_add_item`).
#[unsafe(no_mangle)]
pub extern "C" fn cadence_song_builder_add_pattern(builder: &mut CadenceSongBuilder, loop_end_ppqn: u64) -> u32 {
    builder.patterns.push(Pattern::new("pattern", loop_end_ppqn));
    (builder.patterns.len() - 1) as u32
}

/// `kind`: 0 = NoteOn (uses `note`/`velocity`), 1 = NoteOff (uses `note`),
/// 2 = ParamChange (uses `note` as the low byte of `param_id` and
/// `velocity` as the low byte of `value_bits` --- a deliberately narrow ABI
/// surface since param automation isn't this engine's primary subject
/// matter; a full surface would take `u32`/`f32` directly).
#[unsafe(no_mangle)]
pub extern "C" fn cadence_song_builder_pattern_push_event(
    builder: &mut CadenceSongBuilder,
    pattern_index: u32,
    time_ppqn: u64,
    channel: u8,
    kind: u8,
    note: u8,
    velocity: u8,
) -> bool {
    let Some(pattern) = builder.patterns.get_mut(pattern_index as usize) else {
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

#[unsafe(no_mangle)]
pub extern "C" fn cadence_song_builder_add_track(builder: &mut CadenceSongBuilder) -> u32 {
    builder.tracks.push(Track::new("track"));
    (builder.tracks.len() - 1) as u32
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_song_builder_track_add_item(
    builder: &mut CadenceSongBuilder,
    track_index: u32,
    pattern_index: u32,
    start_ppqn: u64,
    end_ppqn: u64,
    offset_ppqn: u64,
) -> bool {
    let Some(pattern) = builder.patterns.get(pattern_index as usize) else {
        return false;
    };
    let pattern_id = pattern.id;
    let Some(track) = builder.tracks.get_mut(track_index as usize) else {
        return false;
    };
    track.add_item(TrackItem { pattern_id, start_ppqn, end_ppqn, offset_ppqn });
    true
}

/// Consumes `builder`, compiling every track against its referenced
/// patterns and assembling the tempo map/loop settings into a
/// `CadenceSongPlayback` ready to install. The builder pointer is invalid
/// after this call.
///
/// # Safety
/// `builder` must be a pointer returned by `cadence_song_builder_create`
/// and not previously destroyed or compiled.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_song_builder_compile(
    builder: *mut CadenceSongBuilder,
    sample_rate: f64,
    ppqn_factor: u32,
) -> *mut CadenceSongPlayback {
    let builder = unsafe { Box::from_raw(builder) };
    let compiled_patterns: Vec<_> = builder.patterns.iter().map(|p| p.compile()).collect();

    let song = Song::new("song");
    let _ = song.id;
    let mut playback = SongPlayback::new(builder.tempo_map, sample_rate, ppqn_factor);
    playback.loop_start_ppqn = builder.loop_start_ppqn;
    playback.loop_end_ppqn = builder.loop_end_ppqn;
    playback.looping = builder.looping;

    for mut track in builder.tracks {
        let lookup = |id| compiled_patterns.iter().find(|p| p.id == id).cloned();
        playback.tracks.push(track.compile(lookup));
    }

    Box::into_raw(Box::new(CadenceSongPlayback { inner: Some(playback) }))
}

/// Installs the compiled song (taking ownership) on the RT command queue.
/// Returns `false` if the queue was full --- the host should retry.
///
/// # Safety
/// `song` must be a pointer returned by `cadence_song_builder_compile` and
/// not previously destroyed; ownership transfers to the engine either way.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_engine_install_song(handle: &mut CadenceHandle, song: *mut CadenceSongPlayback) -> bool {
    let mut song = unsafe { Box::from_raw(song) };
    match song.inner.take() {
        Some(playback) => handle.inner.install_song(playback).is_ok(),
        None => false,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn cadence_engine_clear_song(handle: &mut CadenceHandle) -> bool {
    handle.inner.clear_song().is_ok()
}

/// # Safety
/// `song` must be a pointer returned by `cadence_song_builder_compile` and
/// not previously destroyed or installed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cadence_song_playback_destroy(song: *mut CadenceSongPlayback) {
    if !song.is_null() {
        drop(unsafe { Box::from_raw(song) });
    }
}
