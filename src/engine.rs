// src/engine.rs
//
// Top-level engine: owns the transport, the current Scene and SongPlayback,
// and drives one process callback per §4.8's ordered algorithm --- clear aux
// and song MIDI, ingest host MIDI, drain the RT command queue, render the
// song into MIDI, render the scene into audio, then run an optional master
// effect over the mixed block.
//
// `Engine` is the RT-side object: every method on it (including `process`)
// is meant to be called from a single owning thread, which is either the
// real audio callback or, in this reference implementation's tests, the
// thread that constructed it. `EngineHandle` is the cross-thread-safe
// control surface: installing a new Scene or SongPlayback is the one
// mutation genuinely suited to a prepare-on-one-thread,
// swap-on-another handoff (a freshly compiled graph built off the RT
// thread), so those two operations go through the RT command queue via
// `SwapPointer`, per `rt_queue`'s documented contract. Both commands run
// the §4.6 stuck-note release protocol against the displaced Scene/Song
// before swapping it out, emitting note-offs through a `ReleaseSink` the
// next `process()` call folds into the aux stream; if the sink can't hold
// every release this block, the swap retries next call rather than
// dropping notes. Transport control (play/stop/tempo/seek) and the master
// effect are plain `&mut self` methods on `Engine` itself --- see
// DESIGN.md for why that split was chosen over routing every mutation
// through the command queue.

use std::sync::Arc;
use std::sync::Mutex;

use log::{debug, warn};
use rtrb::RingBuffer;

use crate::audio_buffer::AudioBuffer;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::midi::{MidiBuffer, MidiEvent, MidiMerger};
use crate::module::{Module, ProcessContext};
use crate::prefetch::PrefetchStack;
use crate::rt_queue::{
    CommandOutcome, RtCommand, RtCommandQueue, RtCommandReceiver, RtCommandSender, SwapPointer,
    DEFAULT_DRAIN_BUDGET,
};
use crate::scene::Scene;
use crate::song::SongPlayback;
use crate::time::Master;
use crate::time_mapper::{map_late_time, TempoPoint};

/// Bounded, lock-protected sink for note-offs an `EngineCommand` needs to
/// emit during a `Scene`/`SongPlayback` swap (§4.6) before the old state is
/// dropped. Drained into the aux buffer once per `Engine::process` call.
/// A plain `Mutex` rather than a second SPSC ring: the only writer is an
/// `EngineCommand::execute` running on the RT thread, and the only reader
/// is `Engine::process` on the same thread, so the lock is never actually
/// contended --- it exists purely so the sink can be shared behind the
/// `Arc` an `EngineCommand` carries across the command queue.
pub struct ReleaseSink {
    buffer: Mutex<MidiBuffer>,
}

impl ReleaseSink {
    pub fn new(capacity: usize) -> Self {
        Self { buffer: Mutex::new(MidiBuffer::with_capacity(capacity)) }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.lock().unwrap().remaining()
    }

    #[must_use]
    pub fn push(&self, event: MidiEvent) -> bool {
        self.buffer.lock().unwrap().push(event)
    }

    pub fn drain_into(&self, dest: &mut MidiBuffer) {
        let mut buf = self.buffer.lock().unwrap();
        for event in buf.as_slice() {
            let _ = dest.push(*event);
        }
        buf.clear();
    }
}

/// Commands that mutate engine-wide slots from off the RT thread. Each
/// variant is self-contained (it carries its own `Arc<SwapPointer<_>>`
/// target and `Arc<ReleaseSink>`), so it needs no access to `Engine` beyond
/// what `execute` already owns --- the RT thread's `RtCommandReceiver::drain`
/// never touches `Engine` directly either.
pub enum EngineCommand {
    InstallScene {
        target: Arc<SwapPointer<Option<Scene>>>,
        next: Option<Box<Option<Scene>>>,
        release: Arc<ReleaseSink>,
    },
    InstallSong {
        target: Arc<SwapPointer<Option<SongPlayback>>>,
        next: Option<Box<Option<SongPlayback>>>,
        release: Arc<ReleaseSink>,
    },
}

/// Per-command cost charged against the drain budget: both variants are a
/// single pointer swap plus a bounded scan over the displaced state's
/// active notes, cheap relative to the ~100-unit default budget.
const SWAP_COMMAND_COST: usize = 4;

impl RtCommand for EngineCommand {
    fn execute(&mut self) -> (CommandOutcome, usize) {
        match self {
            EngineCommand::InstallScene { target, next, release } => {
                // SAFETY: `execute` only ever runs on the RT thread, which
                // is the sole reader of the swap pointer between installs.
                let old: &Option<Scene> = unsafe { target.current() };
                // `Box<Option<Scene>>` derefs to `Option<Scene>`, so binding
                // through this explicit type coerces the reference before
                // `as_ref()` is resolved --- otherwise method lookup finds
                // `Box`'s own `AsRef` impl first and yields `&Option<Scene>`
                // instead of the `Option<&Scene>` wanted here.
                let next_state: &Option<Scene> = next.as_ref().expect("InstallScene executed twice");
                let new_ref = next_state.as_ref();

                if let Some(old_scene) = old.as_ref() {
                    let stuck = old_scene.active_notes.iter_active().filter(|&(ch, note)| {
                        !new_ref.map_or(false, |s| s.accepts_channel(ch, note))
                    });
                    let stuck_count = stuck.count();
                    if release.remaining() < stuck_count {
                        return (CommandOutcome::CallAgainLater, 0);
                    }
                    for (ch, note) in old_scene.active_notes.iter_active() {
                        if !new_ref.map_or(false, |s| s.accepts_channel(ch, note)) {
                            let _ = release.push(MidiEvent::note_off(0, ch, note));
                        }
                    }
                }

                let next = next.take().expect("InstallScene executed twice");
                // The displaced value is dropped here, on the RT thread.
                // Acceptable for a Scene/SongPlayback (no non-RT-safe
                // resources in their Drop impls); a host whose graphs do
                // hold such resources would instead return `old` through a
                // second ring back to the control thread for deferred
                // drop. See DESIGN.md.
                drop(target.install(next));
                (CommandOutcome::Done, SWAP_COMMAND_COST)
            }
            EngineCommand::InstallSong { target, next, release } => {
                let old: &Option<SongPlayback> = unsafe { target.current() };
                let next_state: &Option<SongPlayback> = next.as_ref().expect("InstallSong executed twice");
                let new_ref = next_state.as_ref();

                if let Some(old_song) = old.as_ref() {
                    let sustained = |track_id, ch, note| {
                        new_ref
                            .and_then(|s| s.tracks.iter().find(|t| t.id == track_id))
                            .is_some_and(|t| t.confirm_sustained_note(new_ref.map_or(0, |s| s.song_pos_ppqn), ch, note))
                    };

                    let mut stuck_count = 0usize;
                    for old_track in &old_song.tracks {
                        for (ch, note) in old_track.active_notes.iter_active() {
                            if !sustained(old_track.id, ch, note) {
                                stuck_count += 1;
                            }
                        }
                    }
                    if release.remaining() < stuck_count {
                        return (CommandOutcome::CallAgainLater, 0);
                    }
                    for old_track in &old_song.tracks {
                        for (ch, note) in old_track.active_notes.iter_active() {
                            if !sustained(old_track.id, ch, note) {
                                let _ = release.push(MidiEvent::note_off(0, ch, note));
                            }
                        }
                    }
                }

                let next = next.take().expect("InstallSong executed twice");
                drop(target.install(next));
                (CommandOutcome::Done, SWAP_COMMAND_COST)
            }
        }
    }
}

/// Control-side handle: cheap to clone the pieces it holds, safe to use
/// from any thread. `install_scene`/`install_song` enqueue a command rather
/// than mutating anything directly.
pub struct EngineHandle {
    scene_slot: Arc<SwapPointer<Option<Scene>>>,
    song_slot: Arc<SwapPointer<Option<SongPlayback>>>,
    commands: RtCommandSender<EngineCommand>,
    aux_tx: rtrb::Producer<MidiEvent>,
    release: Arc<ReleaseSink>,
}

impl EngineHandle {
    pub fn install_scene(&mut self, scene: Scene) -> EngineResult<()> {
        let command = EngineCommand::InstallScene {
            target: self.scene_slot.clone(),
            next: Some(Box::new(Some(scene))),
            release: self.release.clone(),
        };
        self.commands
            .try_send(command)
            .map_err(|_| EngineError::ResourceUnavailable("rt command queue full"))
    }

    pub fn clear_scene(&mut self) -> EngineResult<()> {
        let command = EngineCommand::InstallScene {
            target: self.scene_slot.clone(),
            next: Some(Box::new(None)),
            release: self.release.clone(),
        };
        self.commands
            .try_send(command)
            .map_err(|_| EngineError::ResourceUnavailable("rt command queue full"))
    }

    pub fn install_song(&mut self, song: SongPlayback) -> EngineResult<()> {
        let command = EngineCommand::InstallSong {
            target: self.song_slot.clone(),
            next: Some(Box::new(Some(song))),
            release: self.release.clone(),
        };
        self.commands
            .try_send(command)
            .map_err(|_| EngineError::ResourceUnavailable("rt command queue full"))
    }

    pub fn clear_song(&mut self) -> EngineResult<()> {
        let command = EngineCommand::InstallSong {
            target: self.song_slot.clone(),
            next: Some(Box::new(None)),
            release: self.release.clone(),
        };
        self.commands
            .try_send(command)
            .map_err(|_| EngineError::ResourceUnavailable("rt command queue full"))
    }

    /// Injects one MIDI event into the engine's aux input, a lock-free path
    /// distinct from the host's own audio-callback MIDI (e.g. a UI-thread
    /// virtual keyboard, or a control-side sequencer preview). Returns the
    /// event back if the ring is full.
    pub fn inject_aux(&mut self, event: MidiEvent) -> Result<(), MidiEvent> {
        self.aux_tx.push(event).map_err(|e| e.0)
    }
}

/// The RT-rendered engine: transport, the active Scene/SongPlayback slots,
/// MIDI plumbing, and the master output buffer.
pub struct Engine {
    config: EngineConfig,
    master: Master,
    scene_slot: Arc<SwapPointer<Option<Scene>>>,
    song_slot: Arc<SwapPointer<Option<SongPlayback>>>,
    commands: RtCommandReceiver<EngineCommand>,
    aux_rx: rtrb::Consumer<MidiEvent>,
    aux_buffer: MidiBuffer,
    host_buffer: MidiBuffer,
    song_track_scratch: Vec<MidiBuffer>,
    song_merged: MidiBuffer,
    song_merger: MidiMerger,
    master_effect: Option<Box<dyn Module>>,
    master_effect_input: Vec<f32>,
    master_mix: Vec<f32>,
    output_channels: usize,
    /// Free-running sample counter, independent of transport/song position,
    /// used by [`Self::late_time`] as "now" for late-scheduled commands.
    free_running_frame_counter: u64,
    prefetch: Option<PrefetchStack>,
    release: Arc<ReleaseSink>,
}

impl Engine {
    pub fn new(config: EngineConfig, output_channels: usize) -> EngineResult<(Engine, EngineHandle)> {
        config.validate()?;

        let scene_slot = Arc::new(SwapPointer::new(Box::new(None)));
        let song_slot = Arc::new(SwapPointer::new(Box::new(None)));
        let (commands_tx, commands_rx) = RtCommandQueue::<EngineCommand>::new(config.rt_command_capacity);
        let (aux_tx, aux_rx) = RingBuffer::<MidiEvent>::new(config.max_block_size.max(64));

        let midi_capacity = config.max_block_size.max(64);
        let sample_capacity = output_channels * config.max_block_size;
        let release = Arc::new(ReleaseSink::new(midi_capacity));

        let engine = Engine {
            config,
            master: Master::new(config.sample_rate, config.ppqn_factor),
            scene_slot: scene_slot.clone(),
            song_slot: song_slot.clone(),
            commands: commands_rx,
            aux_rx,
            aux_buffer: MidiBuffer::with_capacity(midi_capacity),
            host_buffer: MidiBuffer::with_capacity(midi_capacity),
            song_track_scratch: Vec::new(),
            song_merged: MidiBuffer::with_capacity(midi_capacity),
            song_merger: MidiMerger::new(32),
            master_effect: None,
            master_effect_input: vec![0.0; sample_capacity],
            master_mix: vec![0.0; sample_capacity],
            output_channels,
            free_running_frame_counter: 0,
            prefetch: None,
            release: release.clone(),
        };

        let handle = EngineHandle {
            scene_slot,
            song_slot,
            commands: commands_tx,
            aux_tx,
            release,
        };

        Ok((engine, handle))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn master(&self) -> &Master {
        &self.master
    }

    pub fn play(&mut self) {
        self.master.play();
    }

    pub fn request_stop(&mut self) {
        self.master.request_stop();
    }

    pub fn request_tempo(&mut self, bpm: f64) {
        self.master.request_tempo(bpm);
    }

    /// Seeks the installed song (if any) to `target_ppqn`, running the
    /// stuck-note release protocol. Returns `false` if a destination track
    /// buffer had no room for a release note-off --- per
    /// `SongPlayback::seek`'s contract, retry next callback. With no song
    /// installed this just relocates the transport's own position.
    #[must_use]
    pub fn seek(&mut self, target_ppqn: u64) -> bool {
        let song_opt: &mut Option<SongPlayback> = unsafe { self.song_slot.current_mut() };
        match song_opt.as_mut() {
            Some(song) => {
                if self.song_track_scratch.len() < song.tracks.len() {
                    self.song_track_scratch
                        .resize_with(song.tracks.len(), || MidiBuffer::with_capacity(64));
                }
                song.seek(target_ppqn, &mut self.master, &mut self.song_track_scratch[..song.tracks.len()])
            }
            None => {
                self.master.seek_ppqn(target_ppqn);
                true
            }
        }
    }

    pub fn set_master_effect(&mut self, mut effect: Option<Box<dyn Module>>) {
        if let Some(effect) = effect.as_mut() {
            effect.prepare(self.config.sample_rate, self.config.max_block_size);
        }
        self.master_effect = effect;
    }

    pub fn install_prefetch(&mut self, stack: PrefetchStack) {
        self.prefetch = Some(stack);
    }

    pub fn prefetch(&self) -> Option<&PrefetchStack> {
        self.prefetch.as_ref()
    }

    /// Most recently ingested block's host MIDI input, for monitoring ---
    /// the non-RT-facing "appsink" of §4.8's ingest step. In a real
    /// multi-thread host this would need its own atomically-flipped
    /// double buffer so a concurrent reader never races the next block's
    /// write; here `Engine`'s methods are all called from one owning
    /// thread, so a direct read-back is sound. See DESIGN.md.
    pub fn host_input_monitor(&self) -> &[MidiEvent] {
        self.host_buffer.as_slice()
    }

    pub fn aux_input_monitor(&self) -> &[MidiEvent] {
        self.aux_buffer.as_slice()
    }

    /// Maps a free-running sample counter to a late-scheduling time value
    /// for the currently installed song's tempo map and loop range, per
    /// §4.10.
    pub fn late_time(&self, counter: u64) -> u32 {
        let song_opt: &Option<SongPlayback> = unsafe { self.song_slot.current() };
        let empty_map: &[TempoPoint] = &[];
        let (tempo_map, loop_start, loop_end): (&[TempoPoint], Option<u64>, Option<u64>) = match song_opt {
            Some(song) if song.looping => (&song.tempo_map, Some(song.loop_start_ppqn), Some(song.loop_end_ppqn)),
            Some(song) => (&song.tempo_map, None, None),
            None => (empty_map, None, None),
        };
        map_late_time(counter, self.free_running_frame_counter, &self.master, loop_start, loop_end, tempo_map)
    }

    /// Renders one block of `frames` samples (clamped to
    /// `config.max_block_size`), returning the mixed, planar
    /// `output_channels * frames` output buffer.
    ///
    /// Order, per §4.8:
    /// 1. Clear aux and song MIDI buffers; drain the aux input ring.
    /// 2. Ingest host MIDI input.
    /// 3. Drain the RT command queue under a fixed per-block cost budget,
    ///    then drain any §4.6 release note-offs a Scene/Song swap queued
    ///    into the aux stream.
    /// 4. If a song is installed, render it into the song MIDI buffer.
    /// 5. Render the scene: aux + host + song merge into each
    ///    instrument's inbound stream, then every instrument renders audio,
    ///    mixed into the master buffer.
    /// 6. If a master effect is installed, run it over the full buffer.
    pub fn process(&mut self, host_in: &[MidiEvent], frames: usize) -> &[f32] {
        let frames = frames.min(self.config.max_block_size);
        let span = self.output_channels * frames;

        self.aux_buffer.clear();
        self.song_merged.clear();
        while let Ok(event) = self.aux_rx.pop() {
            if !self.aux_buffer.push(event) {
                warn!("aux MIDI input dropped: buffer full");
                break;
            }
        }

        self.host_buffer.clear();
        for &event in host_in {
            if !self.host_buffer.push(event) {
                warn!("host MIDI input dropped: buffer full");
                break;
            }
        }

        let drained = self.commands.drain(DEFAULT_DRAIN_BUDGET);
        if drained > 0 {
            debug!("drained {drained} cost units of rt commands");
        }
        self.release.drain_into(&mut self.aux_buffer);

        let song_opt: &mut Option<SongPlayback> = unsafe { self.song_slot.current_mut() };
        if let Some(song) = song_opt.as_mut() {
            if self.song_track_scratch.len() < song.tracks.len() {
                self.song_track_scratch
                    .resize_with(song.tracks.len(), || MidiBuffer::with_capacity(64));
            }
            let rolling =
                song.render_block(&mut self.master, frames as u32, &mut self.song_track_scratch[..song.tracks.len()]);
            if !rolling {
                debug!("song playback came to rest");
            }
            let refs: Vec<&[MidiEvent]> =
                self.song_track_scratch[..song.tracks.len()].iter().map(|b| b.as_slice()).collect();
            self.song_merger.merge(&refs, &mut self.song_merged);
        }
        self.free_running_frame_counter = self.free_running_frame_counter.wrapping_add(frames as u64);

        let scene_opt: &mut Option<Scene> = unsafe { self.scene_slot.current_mut() };
        match scene_opt.as_mut() {
            Some(scene) => {
                scene.render(
                    frames,
                    self.master.song_pos_samples,
                    self.master.tempo_bpm,
                    self.aux_buffer.as_slice(),
                    self.host_buffer.as_slice(),
                    self.song_merged.as_slice(),
                );
                scene.mix_into(&mut self.master_mix[..span], self.output_channels, frames);
            }
            None => {
                self.master_mix[..span].fill(0.0);
            }
        }

        if let Some(effect) = self.master_effect.as_mut() {
            self.master_effect_input[..span].copy_from_slice(&self.master_mix[..span]);
            let ctx = ProcessContext::new(frames, self.config.sample_rate, self.master.song_pos_samples, self.master.tempo_bpm);
            let input = AudioBuffer {
                channels: self.output_channels,
                frames,
                data: &mut self.master_effect_input[..span],
            };
            let mut output = AudioBuffer {
                channels: self.output_channels,
                frames,
                data: &mut self.master_mix[..span],
            };
            let _ = effect.process(&ctx, &[&input], &mut output);
        }

        &self.master_mix[..span]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Instrument, Layer, LayerFilter};

    fn test_config() -> EngineConfig {
        EngineConfig {
            max_block_size: 64,
            rt_command_capacity: 16,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn process_with_no_scene_or_song_is_silent() {
        let (mut engine, _handle) = Engine::new(test_config(), 2).unwrap();
        let out = engine.process(&[], 32);
        assert_eq!(out.len(), 64);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn installed_scene_routes_host_midi_within_one_block() {
        let (mut engine, mut handle) = Engine::new(test_config(), 2).unwrap();
        let mut scene = Scene::new("s");
        let idx = scene.add_instrument(Instrument::new("inst", 64, 4));
        scene.add_layer(Layer { filter: LayerFilter::default(), instrument_index: idx });
        handle.install_scene(scene).unwrap();

        let host = [MidiEvent::note_on(0, 0, 60, 100)];
        let out = engine.process(&host, 32);
        assert_eq!(out.len(), 64);
        assert_eq!(engine.host_input_monitor().len(), 1);
    }

    #[test]
    fn aux_injection_reaches_aux_monitor() {
        let (mut engine, mut handle) = Engine::new(test_config(), 2).unwrap();
        handle.inject_aux(MidiEvent::note_on(0, 0, 64, 100)).unwrap();
        engine.process(&[], 16);
        assert_eq!(engine.aux_input_monitor().len(), 1);
    }

    #[test]
    fn seek_with_no_song_just_relocates_transport() {
        let (mut engine, _handle) = Engine::new(test_config(), 2).unwrap();
        let ok = engine.seek(480);
        assert!(ok);
        assert_eq!(engine.master().song_pos_ppqn, 480);
    }

    struct FixedGain(f32);
    impl Module for FixedGain {
        fn prepare(&mut self, _sample_rate: f64, _max_block: usize) {}
        fn process(&mut self, _ctx: &ProcessContext, inputs: &[&AudioBuffer], output: &mut AudioBuffer) -> bool {
            for ch in 0..output.channels {
                for (d, s) in output.channel_mut(ch).iter_mut().zip(inputs[0].channel(ch)) {
                    *d = s * self.0;
                }
            }
            false
        }
        fn num_channels(&self) -> usize {
            2
        }
        fn set_param(&mut self, _param_id: u32, _value: f32) {}
    }

    #[test]
    fn master_effect_runs_over_mixed_output() {
        let (mut engine, mut handle) = Engine::new(test_config(), 2).unwrap();
        let mut scene = Scene::new("s");
        let idx = scene.add_instrument(Instrument::new("inst", 64, 4));
        scene.add_layer(Layer { filter: LayerFilter::default(), instrument_index: idx });
        handle.install_scene(scene).unwrap();
        engine.set_master_effect(Some(Box::new(FixedGain(0.0))));

        let host = [MidiEvent::note_on(0, 0, 60, 100)];
        let out = engine.process(&host, 16).to_vec();
        assert!(out.iter().all(|&s| s == 0.0));
    }
}
