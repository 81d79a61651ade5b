// src/scene.rs
//
// Scene: Layers -> Instruments -> Modules. A Layer filters incoming MIDI by
// channel/note range and transpose, routing what passes through to one
// Instrument. An Instrument owns a small `Graph` of Modules (main
// synth/sampler plus an insert chain) and renders its own voices.

use crate::doc::{DocId, Document};
use crate::graph::Graph;
use crate::midi::{MidiBuffer, MidiEvent, MidiMerger};
use crate::pattern::ActiveNotes;
use crate::voice_allocator::VoiceAllocator;

#[derive(Debug, Clone, Copy)]
pub struct LayerFilter {
    pub channel: Option<u8>,
    pub note_lo: u8,
    pub note_hi: u8,
    pub transpose: i8,
}

impl Default for LayerFilter {
    fn default() -> Self {
        Self {
            channel: None,
            note_lo: 0,
            note_hi: 127,
            transpose: 0,
        }
    }
}

impl LayerFilter {
    pub fn accepts(&self, event: &MidiEvent) -> bool {
        if let Some(ch) = self.channel {
            if event.channel() != ch {
                return false;
            }
        }
        match event.note() {
            Some(n) => n >= self.note_lo && n <= self.note_hi,
            None => true,
        }
    }

    pub fn apply(&self, event: MidiEvent) -> MidiEvent {
        let Some(note) = event.note() else {
            return event;
        };
        let shifted = (note as i16 + self.transpose as i16).clamp(0, 127) as u8;
        let mut bytes = event.bytes;
        bytes[1] = shifted;
        MidiEvent {
            time_samples: event.time_samples,
            size: event.size,
            bytes,
        }
    }
}

pub struct Layer {
    pub filter: LayerFilter,
    pub instrument_index: usize,
}

/// One Instrument: a voice-allocated DSP graph plus its own inbound MIDI
/// buffer, filled each block by the scene's layer routing.
pub struct Instrument {
    pub doc: Document,
    pub graph: Graph,
    pub voices: VoiceAllocator,
    inbound: MidiBuffer,
}

impl Instrument {
    pub fn new(name: impl Into<String>, max_block: usize, max_voices: usize) -> Self {
        Self {
            doc: Document::new(name),
            graph: Graph::new(max_block, max_voices),
            voices: VoiceAllocator::new(max_voices),
            inbound: MidiBuffer::with_capacity(max_block),
        }
    }

    pub fn id(&self) -> DocId {
        self.doc.id
    }

    fn dispatch_midi(&mut self) {
        self.voices.clear_triggers();
        for event in self.inbound.as_slice() {
            if let Some(note) = event.note() {
                if event.is_note_on() {
                    self.voices.note_on(note, event.bytes[2] as f32 / 127.0);
                } else if event.is_note_off() {
                    self.voices.note_off(note);
                }
            }
        }
    }

    pub fn render(&mut self, frames: usize, sample_pos: u64, bpm: f64) {
        self.dispatch_midi();
        self.inbound.clear();
        self.graph.process_block(frames, sample_pos, bpm, &self.voices);
    }

    pub fn output(&self) -> &[f32] {
        self.graph.output()
    }
}

/// Layers -> Instruments routing and rendering for one scene.
pub struct Scene {
    pub doc: Document,
    pub layers: Vec<Layer>,
    pub instruments: Vec<Instrument>,
    merger: MidiMerger,
    /// Which (channel, note) pairs are currently sounding, tracked from the
    /// merged input stream so a scene swap (§4.6) knows what it must
    /// release before the old scene is dropped.
    pub active_notes: ActiveNotes,
}

impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            doc: Document::new(name),
            layers: Vec::new(),
            instruments: Vec::new(),
            merger: MidiMerger::new(3),
            active_notes: ActiveNotes::new(),
        }
    }

    /// Whether any layer in this scene would route a note on `channel`,
    /// regardless of note range --- used by the swap protocol's "is this
    /// inherited note still sustained by the new scene" check, since a
    /// brand-new scene has no voices of its own yet to confirm against.
    pub fn accepts_channel(&self, channel: u8, note: u8) -> bool {
        self.layers
            .iter()
            .any(|layer| layer.filter.accepts(&MidiEvent::note_on(0, channel, note, 1)))
    }

    pub fn add_instrument(&mut self, instrument: Instrument) -> usize {
        self.instruments.push(instrument);
        self.instruments.len() - 1
    }

    pub fn add_layer(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    /// Merges `aux`, `host`, and `song` MIDI per §4.8's input-merge step,
    /// routes each event through the matching layers into instrument
    /// inbound buffers, then renders every instrument for this block.
    pub fn render(&mut self, frames: usize, sample_pos: u64, bpm: f64, aux: &[MidiEvent], host: &[MidiEvent], song: &[MidiEvent]) {
        let mut merged = MidiBuffer::with_capacity(aux.len() + host.len() + song.len() + 1);
        self.merger.merge(&[aux, host, song], &mut merged);

        for event in merged.as_slice() {
            if let Some(note) = event.note() {
                if event.is_note_on() {
                    self.active_notes.set(event.channel(), note);
                } else if event.is_note_off() {
                    self.active_notes.clear_note(event.channel(), note);
                }
            }
            for layer in &self.layers {
                if layer.filter.accepts(event) {
                    if let Some(instrument) = self.instruments.get_mut(layer.instrument_index) {
                        let routed = layer.filter.apply(*event);
                        let _ = instrument_push(instrument, routed);
                    }
                }
            }
        }

        for instrument in &mut self.instruments {
            instrument.render(frames, sample_pos, bpm);
        }
    }

    /// Sums every instrument's rendered output into `dest`, a planar
    /// `channels * frames` buffer the caller owns (sized for the engine's
    /// master output, e.g. stereo), matching `AudioBuffer`'s per-channel
    /// layout. An instrument whose own graph has fewer channels than `dest`
    /// is mixed up by channel-modulo (mono synth feeding a stereo master).
    pub fn mix_into(&self, dest: &mut [f32], channels: usize, frames: usize) {
        dest.fill(0.0);
        for instrument in &self.instruments {
            let src = instrument.output();
            let src_channels = instrument.graph.output_channels();
            if src_channels == 0 {
                continue;
            }
            for ch in 0..channels {
                let src_ch = ch % src_channels;
                let src_start = src_ch * frames;
                let Some(src_slice) = src.get(src_start..src_start + frames) else {
                    continue;
                };
                let dest_start = ch * frames;
                for (d, s) in dest[dest_start..dest_start + frames].iter_mut().zip(src_slice) {
                    *d += s;
                }
            }
        }
    }
}

fn instrument_push(instrument: &mut Instrument, event: MidiEvent) -> bool {
    instrument.inbound.push(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_filter_respects_channel_and_range() {
        let filter = LayerFilter { channel: Some(0), note_lo: 60, note_hi: 72, transpose: 0 };
        let in_range = MidiEvent::note_on(0, 0, 64, 100);
        let out_of_range = MidiEvent::note_on(0, 0, 40, 100);
        let wrong_channel = MidiEvent::note_on(0, 1, 64, 100);
        assert!(filter.accepts(&in_range));
        assert!(!filter.accepts(&out_of_range));
        assert!(!filter.accepts(&wrong_channel));
    }

    #[test]
    fn layer_transpose_shifts_note() {
        let filter = LayerFilter { transpose: 12, ..Default::default() };
        let shifted = filter.apply(MidiEvent::note_on(0, 0, 60, 100));
        assert_eq!(shifted.note(), Some(72));
    }

    #[test]
    fn scene_routes_events_to_matching_instrument() {
        let mut scene = Scene::new("scene-a");
        let idx = scene.add_instrument(Instrument::new("inst-a", 64, 4));
        scene.add_layer(Layer { filter: LayerFilter::default(), instrument_index: idx });

        let host = [MidiEvent::note_on(0, 0, 60, 100)];
        scene.render(32, 0, 120.0, &[], &host, &[]);
        assert_eq!(scene.instruments[idx].voices.active_count(), 1);
    }

    #[test]
    fn mix_into_sums_instrument_outputs() {
        let mut scene = Scene::new("scene-a");
        let idx = scene.add_instrument(Instrument::new("inst-a", 64, 4));
        scene.add_layer(Layer { filter: LayerFilter::default(), instrument_index: idx });
        scene.instruments[idx].graph.prepare(48_000.0);

        scene.render(32, 0, 120.0, &[], &[], &[]);
        let mut dest = vec![0.0f32; 2 * 32];
        scene.mix_into(&mut dest, 2, 32);
        assert_eq!(dest.len(), 64);
    }
}
