// src/main.rs
//
// Demo binary: builds a two-beat metronome click (alternating low/high
// click notes, one bar, looping) over a one-instrument scene, then drives
// `Engine::process` block by block the way a host's audio callback would,
// printing a peak meter periodically. Not a host integration --- see
// `ffi`/`wasm` for that --- just a smoke test runnable without an audio
// device.

use cadence::compile::{compile, GraphDef};
use cadence::config::EngineConfig;
use cadence::engine::Engine;
use cadence::module_registry::ModuleRegistry;
use cadence::nodes::{module_types, params, register_standard_modules};
use cadence::pattern::{Pattern, PatternEvent, PatternEventKind};
use cadence::scene::{Instrument, Layer, LayerFilter, Scene};
use cadence::song::SongPlayback;
use cadence::time_mapper::TempoPoint;
use cadence::track::{Track, TrackItem};

const SAMPLE_RATE: f64 = 44_100.0;
const PPQN_FACTOR: u32 = 48;
const MAX_BLOCK: usize = 512;
const MAX_VOICES: usize = 8;
const BAR_PPQN: u64 = 2 * PPQN_FACTOR as u64;

fn build_click_instrument() -> Instrument {
    let mut registry = ModuleRegistry::new();
    register_standard_modules(&mut registry);

    let mut def = GraphDef::new();
    let osc = def.add_node(module_types::SINE_OSC);
    let env = def.add_node(module_types::ADSR_ENV);
    let out = def.add_node(module_types::OUTPUT);
    def.connect(osc, env);
    def.connect(env, out);
    def.output_node = Some(out);
    def.set_param(env, params::ATTACK, 0.001);
    def.set_param(env, params::DECAY, 0.05);
    def.set_param(env, params::SUSTAIN, 0.0);
    def.set_param(env, params::RELEASE, 0.02);

    let mut instrument = Instrument::new("click", MAX_BLOCK, MAX_VOICES);
    instrument.graph = compile(&def, &registry, MAX_BLOCK, MAX_VOICES).expect("demo graph compiles");
    instrument.graph.prepare(SAMPLE_RATE);
    instrument
}

/// A two-beat click: note 36 on beat one, note 38 on beat two, each held
/// for just under a beat so it never overlaps the next click.
fn build_metronome_pattern() -> Pattern {
    let mut pattern = Pattern::new("metronome", BAR_PPQN);
    let beat = PPQN_FACTOR as u64;
    pattern.push_event(PatternEvent { time_ppqn: 0, channel: 0, kind: PatternEventKind::NoteOn { note: 36, velocity: 0x7F } });
    pattern.push_event(PatternEvent { time_ppqn: beat - 1, channel: 0, kind: PatternEventKind::NoteOff { note: 36 } });
    pattern.push_event(PatternEvent { time_ppqn: beat, channel: 0, kind: PatternEventKind::NoteOn { note: 38, velocity: 0x7F } });
    pattern.push_event(PatternEvent { time_ppqn: 2 * beat - 1, channel: 0, kind: PatternEventKind::NoteOff { note: 38 } });
    pattern
}

fn build_song() -> SongPlayback {
    let compiled_pattern = build_metronome_pattern().compile();

    let mut track = Track::new("click-track");
    track.add_item(TrackItem { pattern_id: compiled_pattern.id, start_ppqn: 0, end_ppqn: BAR_PPQN, offset_ppqn: 0 });
    let track_playback = track.compile(|id| if id == compiled_pattern.id { Some(compiled_pattern.clone()) } else { None });

    let mut playback = SongPlayback::new(vec![TempoPoint { start_ppqn: 0, bpm: 120.0 }], SAMPLE_RATE, PPQN_FACTOR);
    playback.tracks.push(track_playback);
    playback.loop_start_ppqn = 0;
    playback.loop_end_ppqn = BAR_PPQN;
    playback.looping = true;
    playback
}

fn main() {
    let _ = log::set_max_level(log::LevelFilter::Info);

    let config = EngineConfig { sample_rate: SAMPLE_RATE, ppqn_factor: PPQN_FACTOR, max_block_size: MAX_BLOCK, ..EngineConfig::default() };
    let (mut engine, mut handle) = Engine::new(config, 2).expect("demo config is valid");

    let mut scene = Scene::new("metronome-scene");
    let idx = scene.add_instrument(build_click_instrument());
    scene.add_layer(Layer { filter: LayerFilter::default(), instrument_index: idx });
    handle.install_scene(scene).expect("rt command queue has room");
    handle.install_song(build_song()).expect("rt command queue has room");

    engine.play();

    println!("cadence-engine metronome demo: {SAMPLE_RATE} Hz, {PPQN_FACTOR} ppqn, 120 BPM");

    let frames_per_block = 512usize;
    for block in 0..256u32 {
        let out = engine.process(&[], frames_per_block);
        let peak = out.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        if block % 32 == 0 {
            println!("block {:>4} | song_ppqn={:>5} | peak={:.4}", block, engine.master().song_pos_ppqn, peak);
        }
    }

    println!("done.");
}
