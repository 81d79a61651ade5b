// src/track.rs
//
// A track places pattern instances ("items") along an absolute PPQN
// timeline and merges their renders into one MIDI stream addressed to a
// single external output (an instrument, or a pass-through to the host).
//
// `Track` is the authoring side. `compile` resolves overlapping items (the
// rule: the earlier item --- by start position --- always wins for its
// entire length; a later item fully contained in an earlier one is dropped,
// and a later item that only partially overlaps is clipped to start where
// the earlier one ends) and produces a `TrackPlayback`,
// which is the RT-safe structure the song renders from. Each compile bumps
// `generation` so `SongPlayback` can tell a stale playback apart from a
// fresh one when installed via the RT command queue's swap primitive.

use crate::doc::DocId;
use crate::midi::{MidiBuffer, MidiMerger};
use crate::pattern::{ActiveNotes, ClipPlayback, PatternPlayback};

#[derive(Debug, Clone, Copy)]
pub struct TrackItem {
    pub pattern_id: DocId,
    pub start_ppqn: u64,
    pub end_ppqn: u64,
    pub offset_ppqn: u64,
}

pub struct Track {
    pub id: DocId,
    pub name: String,
    pub items: Vec<TrackItem>,
    pub external_output: Option<DocId>,
    generation: u64,
}

impl Track {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: DocId::new(),
            name: name.into(),
            items: Vec::new(),
            external_output: None,
            generation: 0,
        }
    }

    pub fn add_item(&mut self, item: TrackItem) {
        self.items.push(item);
        self.generation += 1;
    }

    pub fn remove_item_at(&mut self, index: usize) {
        if index < self.items.len() {
            self.items.remove(index);
            self.generation += 1;
        }
    }

    /// Resolves overlaps (sort by start; each item in turn is clipped back
    /// to where the previously-kept item ends, and dropped entirely if
    /// fully contained within it) and compiles each surviving span into a
    /// `ClipPlayback` against its pattern. `lookup` resolves a pattern id
    /// to its compiled playback view; a dangling id is simply skipped ---
    /// the controller is expected to have reaped the track item already.
    pub fn compile(&mut self, lookup: impl Fn(DocId) -> Option<PatternPlayback>) -> TrackPlayback {
        self.generation += 1;
        let mut items = self.items.clone();
        items.sort_by_key(|i| i.start_ppqn);

        let mut resolved: Vec<TrackItem> = Vec::with_capacity(items.len());
        let mut cursor_end = u64::MIN;
        for item in items.iter() {
            let mut item = *item;
            if let Some(prev_end) = resolved.last().map(|_| cursor_end) {
                if item.start_ppqn < prev_end {
                    item.start_ppqn = prev_end;
                }
            }
            if item.end_ppqn > item.start_ppqn {
                cursor_end = item.end_ppqn;
                resolved.push(item);
            }
        }

        let clips = resolved
            .into_iter()
            .filter_map(|item| {
                lookup(item.pattern_id).map(|pattern| {
                    ClipPlayback::new(pattern, item.start_ppqn, item.end_ppqn, item.start_ppqn, item.offset_ppqn)
                })
            })
            .collect();

        TrackPlayback {
            id: self.id,
            clips,
            muted: false,
            active_notes: ActiveNotes::new(),
            generation: self.generation,
            merger: MidiMerger::new(8),
            scratch: Vec::new(),
        }
    }
}

/// Compiled, RT-renderable track. Owns no `Arc` back to `Track` ---
/// installed wholesale via the command queue's swap primitive whenever the
/// control thread recompiles.
pub struct TrackPlayback {
    pub id: DocId,
    clips: Vec<ClipPlayback>,
    pub muted: bool,
    pub active_notes: ActiveNotes,
    pub generation: u64,
    merger: MidiMerger,
    scratch: Vec<MidiBuffer>,
}

impl TrackPlayback {
    /// Renders `[window_start_ppqn, window_end_ppqn)` into `dest`. A muted
    /// track still advances every clip's cursor (so unmuting mid-song
    /// doesn't replay stale history) but emits nothing and leaves
    /// `active_notes` untouched.
    pub fn render(
        &mut self,
        window_start_ppqn: u64,
        window_end_ppqn: u64,
        channel: u8,
        ppqn_to_sample_offset: impl Fn(u64) -> u32 + Copy,
        dest: &mut MidiBuffer,
    ) {
        if self.scratch.len() < self.clips.len() {
            self.scratch.resize_with(self.clips.len(), || MidiBuffer::with_capacity(64));
        }

        let mut sink = ActiveNotes::new();
        let active = if self.muted { &mut sink } else { &mut self.active_notes };

        for (clip, buf) in self.clips.iter_mut().zip(self.scratch.iter_mut()) {
            buf.clear();
            clip.render(window_start_ppqn, window_end_ppqn, channel, active, ppqn_to_sample_offset, buf);
        }

        if self.muted {
            return;
        }

        let refs: Vec<&[crate::midi::MidiEvent]> = self.scratch.iter().map(|b| b.as_slice()).collect();
        self.merger.merge(&refs, dest);
    }

    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }

    /// Reseeks every clip's cursor to `new_ppqn` and reconciles
    /// `active_notes` against what the new position's pattern content
    /// actually sustains: any note that was on before the seek and is not
    /// reconfirmed here gets an explicit note-off written into `dest` at
    /// `time_samples`, before `active_notes` is replaced. A note the new
    /// position legitimately still holds is left alone rather than cut and
    /// retriggered. Returns `false` if `dest` ran out of room for a
    /// required note-off, in which case `active_notes` is left unswapped so
    /// the caller can retry once the buffer has drained.
    #[must_use]
    pub fn seek(&mut self, new_ppqn: u64, channel: u8, time_samples: u32, dest: &mut MidiBuffer) -> bool {
        let old = self.active_notes;
        let mut rebuilt = ActiveNotes::new();
        for clip in self.clips.iter_mut() {
            clip.seek_ppqn(new_ppqn);
            clip.resync_active(new_ppqn, channel, &mut rebuilt);
        }
        if !self.muted {
            for (ch, note) in old.iter_active() {
                if !rebuilt.is_active(ch, note) && !dest.push(crate::midi::MidiEvent::note_off(time_samples, ch, note)) {
                    return false;
                }
            }
        }
        self.active_notes = rebuilt;
        true
    }

    /// §4.6 "actually sustained" test for a single (channel, note) pair, via
    /// `ClipPlayback::sustained_at`'s per-note index --- used by the
    /// engine's scene/song swap protocol, which only needs to check the
    /// handful of notes the old state had active, not a full replay.
    pub fn confirm_sustained_note(&self, song_ppqn: u64, channel: u8, note: u8) -> bool {
        self.clips.iter().any(|c| c.sustained_at(song_ppqn, channel, note))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Pattern, PatternEvent, PatternEventKind};

    #[test]
    fn earlier_item_wins_and_trims_later_start() {
        let mut track = Track::new("t1");
        let pat_id = DocId::new();
        track.add_item(TrackItem { pattern_id: pat_id, start_ppqn: 0, end_ppqn: 400, offset_ppqn: 0 });
        track.add_item(TrackItem { pattern_id: pat_id, start_ppqn: 200, end_ppqn: 600, offset_ppqn: 0 });

        let mut pattern = Pattern::new("p", 384);
        pattern.push_event(PatternEvent { time_ppqn: 0, channel: 0, kind: PatternEventKind::NoteOn { note: 60, velocity: 100 } });
        let compiled = pattern.compile();

        let pb = track.compile(|_| Some(compiled.clone()));
        assert_eq!(pb.clip_count(), 2);
    }

    #[test]
    fn fully_contained_later_item_is_dropped() {
        let mut track = Track::new("t1");
        let pat_id = DocId::new();
        track.add_item(TrackItem { pattern_id: pat_id, start_ppqn: 0, end_ppqn: 400, offset_ppqn: 0 });
        track.add_item(TrackItem { pattern_id: pat_id, start_ppqn: 100, end_ppqn: 200, offset_ppqn: 0 });

        let mut pattern = Pattern::new("p", 384);
        pattern.push_event(PatternEvent { time_ppqn: 0, channel: 0, kind: PatternEventKind::NoteOn { note: 60, velocity: 100 } });
        let compiled = pattern.compile();

        let pb = track.compile(|_| Some(compiled.clone()));
        assert_eq!(pb.clip_count(), 1);
    }

    #[test]
    fn seek_releases_notes_not_sustained_at_new_position() {
        let mut track = Track::new("t1");
        let pat_id = DocId::new();
        track.add_item(TrackItem { pattern_id: pat_id, start_ppqn: 0, end_ppqn: 384, offset_ppqn: 0 });

        let mut pattern = Pattern::new("p", 384);
        pattern.push_event(PatternEvent { time_ppqn: 0, channel: 0, kind: PatternEventKind::NoteOn { note: 60, velocity: 100 } });
        pattern.push_event(PatternEvent { time_ppqn: 96, channel: 0, kind: PatternEventKind::NoteOff { note: 60 } });
        let compiled = pattern.compile();

        let mut pb = track.compile(|_| Some(compiled.clone()));
        pb.render(0, 50, 0, |p| p as u32, &mut MidiBuffer::with_capacity(8));
        assert!(pb.active_notes.is_active(0, 60));

        let mut dest = MidiBuffer::with_capacity(8);
        pb.seek(200, 0, 0, &mut dest);
        assert!(!pb.active_notes.is_active(0, 60));
        assert_eq!(dest.len(), 1);
    }

    #[test]
    fn seek_leaves_genuinely_sustained_note_alone() {
        let mut track = Track::new("t1");
        let pat_id = DocId::new();
        track.add_item(TrackItem { pattern_id: pat_id, start_ppqn: 0, end_ppqn: 384, offset_ppqn: 0 });

        let mut pattern = Pattern::new("p", 384);
        pattern.push_event(PatternEvent { time_ppqn: 0, channel: 0, kind: PatternEventKind::NoteOn { note: 60, velocity: 100 } });
        pattern.push_event(PatternEvent { time_ppqn: 350, channel: 0, kind: PatternEventKind::NoteOff { note: 60 } });
        let compiled = pattern.compile();

        let mut pb = track.compile(|_| Some(compiled.clone()));
        pb.render(0, 50, 0, |p| p as u32, &mut MidiBuffer::with_capacity(8));
        assert!(pb.active_notes.is_active(0, 60));

        let mut dest = MidiBuffer::with_capacity(8);
        pb.seek(200, 0, 0, &mut dest);
        assert!(pb.active_notes.is_active(0, 60));
        assert!(dest.is_empty());
    }

    #[test]
    fn muted_track_emits_nothing() {
        let mut track = Track::new("t1");
        let pat_id = DocId::new();
        track.add_item(TrackItem { pattern_id: pat_id, start_ppqn: 0, end_ppqn: 400, offset_ppqn: 0 });
        let mut pattern = Pattern::new("p", 384);
        pattern.push_event(PatternEvent { time_ppqn: 0, channel: 0, kind: PatternEventKind::NoteOn { note: 60, velocity: 100 } });
        let compiled = pattern.compile();
        let mut pb = track.compile(|_| Some(compiled.clone()));
        pb.muted = true;

        let mut dest = MidiBuffer::with_capacity(8);
        pb.render(0, 100, 0, |p| p as u32, &mut dest);
        assert!(dest.is_empty());
    }
}
