// src/pattern.rs
//
// Patterns are the smallest unit of recorded/programmed MIDI content: a
// fixed-length, PPQN-addressed list of events. `Pattern` is the authoring
// side (mutable until placed on a track); `PatternPlayback` is the
// refcounted, read-only, RT-safe view a `ClipPlayback` renders from.
//
// Mirrors the old scheduler's sorted-scratch-buffer compile step, but here
// the sort happens once at playback-compile time rather than every block.

use std::sync::Arc;

use crate::doc::DocId;
use crate::midi::{MidiBuffer, MidiEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternEventKind {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    ParamChange { param_id: u32, value_bits: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternEvent {
    pub time_ppqn: u64,
    pub channel: u8,
    pub kind: PatternEventKind,
}

/// Authoring-side pattern: events in insertion order, not yet indexed.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub id: DocId,
    pub name: String,
    pub events: Vec<PatternEvent>,
    pub loop_end_ppqn: u64,
}

impl Pattern {
    pub fn new(name: impl Into<String>, loop_end_ppqn: u64) -> Self {
        Self {
            id: DocId::new(),
            name: name.into(),
            events: Vec::new(),
            loop_end_ppqn,
        }
    }

    pub fn push_event(&mut self, event: PatternEvent) {
        self.events.push(event);
    }

    /// Builds the RT-safe, refcounted playback view. Called from the
    /// control thread whenever the pattern's content changes; the result
    /// is handed to the graph via the command queue's swap primitive.
    ///
    /// The primary `events` vec is sorted strictly by `time_ppqn` (stable,
    /// so same-tick events keep their insertion order) --- the renderer's
    /// cursor walk and `lower_bound`'s binary search both depend on this
    /// being a true time ordering across every channel/note, not just
    /// within one. A second index, sorted by `(channel, note, time_ppqn)`,
    /// is built alongside it purely to serve the §4.6 "actually sustained"
    /// query, which needs the latest event for one specific (channel, note)
    /// pair rather than a time cursor.
    pub fn compile(&self) -> PatternPlayback {
        let mut events = self.events.clone();
        events.sort_by_key(|e| e.time_ppqn);

        let mut note_index: Vec<usize> = (0..events.len()).collect();
        note_index.sort_by_key(|&i| (events[i].channel, note_key(&events[i].kind), events[i].time_ppqn));

        PatternPlayback {
            id: self.id,
            events: Arc::new(events),
            note_index: Arc::new(note_index),
            loop_end_ppqn: self.loop_end_ppqn,
        }
    }
}

fn note_key(kind: &PatternEventKind) -> u8 {
    match kind {
        PatternEventKind::NoteOn { note, .. } => *note,
        PatternEventKind::NoteOff { note } => *note,
        PatternEventKind::ParamChange { .. } => 0,
    }
}

/// Refcounted, immutable playback view of a pattern. Cheap to clone (an
/// `Arc` bump) so multiple `ClipPlayback`s can share the same compiled
/// pattern across a song without copying events.
#[derive(Clone)]
pub struct PatternPlayback {
    pub id: DocId,
    events: Arc<Vec<PatternEvent>>,
    /// Indices into `events`, sorted by `(channel, note, time_ppqn)`.
    /// Additional to the primary time ordering; serves only
    /// `sustained_at`'s per-(channel, note) binary search.
    note_index: Arc<Vec<usize>>,
    pub loop_end_ppqn: u64,
}

impl PatternPlayback {
    pub fn events(&self) -> &[PatternEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Binary search for the first event at or after `time_ppqn`, using the
    /// same overflow-safe midpoint as the old time-mapper seek: standard
    /// `(low + high) / 2` overflows when both bounds approach `usize::MAX`
    /// on a sufficiently long pattern; this form never sums the bounds.
    pub fn lower_bound(&self, time_ppqn: u64) -> usize {
        let mut low = 0usize;
        let mut high = self.events.len();
        while low < high {
            let mid = (low >> 1) + (high >> 1) + (low & high & 1);
            if self.events[mid].time_ppqn < time_ppqn {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// §4.6 "actually sustained" test: binary-searches `note_index` for the
    /// latest event at or before `rel_time_ppqn` on this `channel`/`note`;
    /// the note is sustained iff that event is a Note-On with nonzero
    /// velocity.
    pub fn sustained_at(&self, channel: u8, note: u8, rel_time_ppqn: u64) -> bool {
        let target = (channel, note);
        let key_of = |i: usize| (self.events[i].channel, note_key(&self.events[i].kind));

        let lo = self.note_index.partition_point(|&i| key_of(i) < target);
        let hi = self.note_index.partition_point(|&i| key_of(i) <= target);
        let group = &self.note_index[lo..hi];

        let pos = group.partition_point(|&i| self.events[i].time_ppqn <= rel_time_ppqn);
        if pos == 0 {
            return false;
        }
        matches!(
            self.events[group[pos - 1]].kind,
            PatternEventKind::NoteOn { velocity, .. } if velocity > 0
        )
    }
}

/// 16 MIDI channels x 128 notes, tracked as a bitmask so "is anything still
/// sounding" and "which notes need a release" are O(1) word tests rather
/// than a scan over recent events.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveNotes {
    // 128 bits per channel = 2 u64 words; 16 channels.
    words: [[u64; 2]; 16],
}

impl ActiveNotes {
    pub fn new() -> Self {
        Self::default()
    }

    fn word_bit(note: u8) -> (usize, u32) {
        ((note as usize) / 64, (note as u32) % 64)
    }

    pub fn is_active(&self, channel: u8, note: u8) -> bool {
        let (w, b) = Self::word_bit(note);
        (self.words[channel as usize & 0x0F][w] >> b) & 1 != 0
    }

    pub fn set(&mut self, channel: u8, note: u8) {
        let (w, b) = Self::word_bit(note);
        self.words[channel as usize & 0x0F][w] |= 1 << b;
    }

    pub fn clear_note(&mut self, channel: u8, note: u8) {
        let (w, b) = Self::word_bit(note);
        self.words[channel as usize & 0x0F][w] &= !(1 << b);
    }

    pub fn clear_all(&mut self) {
        self.words = [[0; 2]; 16];
    }

    pub fn any_active(&self) -> bool {
        self.words.iter().any(|ch| ch[0] != 0 || ch[1] != 0)
    }

    /// Accumulates a pattern event as "sticky": NoteOn sets the bit, NoteOff
    /// clears it, and a bit left set at the end of the pattern means the
    /// note rings past the loop boundary.
    pub fn accumulate_sticky(&mut self, channel: u8, kind: &PatternEventKind) {
        match kind {
            PatternEventKind::NoteOn { note, .. } => self.set(channel, *note),
            PatternEventKind::NoteOff { note } => self.clear_note(channel, *note),
            PatternEventKind::ParamChange { .. } => {}
        }
    }

    /// Variant used when re-deriving state after a seek: behaves like
    /// `accumulate_sticky` but additionally records, in `pending_release`,
    /// any note that was active going in and gets turned off by this event
    /// — used by the stuck-note release protocol to know which notes need
    /// an explicit off sent rather than just a silent bit clear.
    pub fn accumulate_sticky_with_release(
        &mut self,
        channel: u8,
        kind: &PatternEventKind,
        pending_release: &mut ActiveNotes,
    ) {
        match kind {
            PatternEventKind::NoteOn { note, .. } => {
                self.set(channel, *note);
                pending_release.clear_note(channel, *note);
            }
            PatternEventKind::NoteOff { note } => {
                if self.is_active(channel, *note) {
                    pending_release.set(channel, *note);
                }
                self.clear_note(channel, *note);
            }
            PatternEventKind::ParamChange { .. } => {}
        }
    }

    pub fn iter_active(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        (0u8..16).flat_map(move |ch| {
            (0u8..128).filter(move |&n| self.is_active(ch, n))
        })
    }
}

/// One placement of a pattern on a track's timeline. Renders a half-open
/// `[start_ppqn, end_ppqn)` window of the pattern, looping the pattern's
/// own content if the placement is longer than `pattern.loop_end_ppqn`.
///
/// `offset_ppqn` lets a placement start partway into the pattern (e.g. a
/// clip that begins on beat 3 of a 4-beat pattern); `min_time_ppqn` is the
/// earliest absolute song position this placement can ever be asked to
/// render from, used to reject a seek that lands before the clip starts
/// instead of silently reading garbage history.
pub struct ClipPlayback {
    pattern: PatternPlayback,
    pos: usize,
    pub start_ppqn: u64,
    pub end_ppqn: u64,
    pub item_start_ppqn: u64,
    pub offset_ppqn: u64,
    pub min_time_ppqn: u64,
}

impl ClipPlayback {
    pub fn new(
        pattern: PatternPlayback,
        start_ppqn: u64,
        end_ppqn: u64,
        item_start_ppqn: u64,
        offset_ppqn: u64,
    ) -> Self {
        Self {
            pattern,
            pos: 0,
            start_ppqn,
            end_ppqn,
            item_start_ppqn,
            offset_ppqn,
            min_time_ppqn: start_ppqn,
        }
    }

    fn pattern_time(&self, song_ppqn: u64) -> u64 {
        let loop_len = self.pattern.loop_end_ppqn.max(1);
        let elapsed = song_ppqn.saturating_sub(self.item_start_ppqn) + self.offset_ppqn;
        elapsed % loop_len
    }

    /// Overflow-safe binary search to the pattern index matching an
    /// absolute song PPQN position. Same non-summing midpoint as
    /// `PatternPlayback::lower_bound`.
    pub fn seek_ppqn(&mut self, song_ppqn: u64) {
        let target = self.pattern_time(song_ppqn.max(self.min_time_ppqn));
        self.pos = self.pattern.lower_bound(target);
    }

    /// Linear scan forward/back from the current cursor. Used when the new
    /// position is close to the old one (e.g. normal forward playback
    /// across a loop wrap), cheaper than a fresh binary search.
    pub fn seek_samples_near(&mut self, song_ppqn: u64) {
        let target = self.pattern_time(song_ppqn.max(self.min_time_ppqn));
        let events = self.pattern.events();
        while self.pos > 0 && events[self.pos - 1].time_ppqn >= target {
            self.pos -= 1;
        }
        while self.pos < events.len() && events[self.pos].time_ppqn < target {
            self.pos += 1;
        }
    }

    /// Rebuilds which notes this clip's pattern considers sustained at
    /// `song_ppqn` by replaying every event with a pattern-relative time
    /// before the target into `active_notes`, without emitting any MIDI.
    /// Used by the stuck-note release protocol to tell a genuinely-stuck
    /// note (on in the old state, not reconfirmed here) from one that's
    /// still legitimately held across a seek. A full scan rather than a cue
    /// from `self.pos`, since the events are in time order but `self.pos`
    /// may be positioned anywhere relative to `target`.
    pub fn resync_active(&self, song_ppqn: u64, channel: u8, active_notes: &mut ActiveNotes) {
        if song_ppqn < self.start_ppqn || song_ppqn >= self.end_ppqn {
            return;
        }
        let target = self.pattern_time(song_ppqn.max(self.min_time_ppqn));
        for ev in self.pattern.events() {
            if ev.time_ppqn < target {
                active_notes.accumulate_sticky(channel, &ev.kind);
            }
        }
    }

    /// §4.6 "actually sustained" test for a single (channel, note) pair at
    /// `song_ppqn`, via `PatternPlayback::sustained_at`'s per-note index ---
    /// used by the stuck-note confirmation step on a `Scene`/`SongPlayback`
    /// swap, where only the notes the old state had active need checking,
    /// not a full replay.
    pub fn sustained_at(&self, song_ppqn: u64, channel: u8, note: u8) -> bool {
        if song_ppqn < self.start_ppqn || song_ppqn >= self.end_ppqn {
            return false;
        }
        let target = self.pattern_time(song_ppqn.max(self.min_time_ppqn));
        self.pattern.sustained_at(channel, note, target)
    }

    /// Renders events in `[window_start_ppqn, window_end_ppqn)`, translating
    /// each to a relative sample offset via `ppqn_to_sample_offset`, and
    /// updates the active-notes bitmask as events are emitted.
    pub fn render(
        &mut self,
        window_start_ppqn: u64,
        window_end_ppqn: u64,
        channel: u8,
        active_notes: &mut ActiveNotes,
        ppqn_to_sample_offset: impl Fn(u64) -> u32,
        dest: &mut MidiBuffer,
    ) {
        let start = window_start_ppqn.max(self.start_ppqn);
        let end = window_end_ppqn.min(self.end_ppqn);
        if start >= end {
            return;
        }

        self.seek_samples_near(start);
        let loop_len = self.pattern.loop_end_ppqn.max(1);

        loop {
            let Some(ev) = self.pattern.events().get(self.pos) else {
                break;
            };
            // Map the pattern-relative tick back to an absolute song tick
            // for this loop iteration.
            let cycles_elapsed = (start.saturating_sub(self.item_start_ppqn) + self.offset_ppqn) / loop_len;
            let abs = self.item_start_ppqn + cycles_elapsed * loop_len + ev.time_ppqn - self.offset_ppqn;
            if ev.time_ppqn >= loop_len {
                break;
            }
            if abs >= end {
                break;
            }
            if abs >= start {
                active_notes.accumulate_sticky(channel, &ev.kind);
                if let Some(midi) = pattern_event_to_midi(channel, &ev.kind, ppqn_to_sample_offset(abs)) {
                    let _ = dest.push(midi);
                }
            }
            self.pos += 1;
        }
    }
}

fn pattern_event_to_midi(channel: u8, kind: &PatternEventKind, time_samples: u32) -> Option<MidiEvent> {
    match kind {
        PatternEventKind::NoteOn { note, velocity } => {
            Some(MidiEvent::note_on(time_samples, channel, *note, *velocity))
        }
        PatternEventKind::NoteOff { note } => Some(MidiEvent::note_off(time_samples, channel, *note)),
        PatternEventKind::ParamChange { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_sorts_primary_vec_by_time_across_channels() {
        let mut p = Pattern::new("p", 384);
        p.push_event(PatternEvent {
            time_ppqn: 10,
            channel: 1,
            kind: PatternEventKind::NoteOn { note: 64, velocity: 100 },
        });
        p.push_event(PatternEvent {
            time_ppqn: 0,
            channel: 0,
            kind: PatternEventKind::NoteOn { note: 60, velocity: 100 },
        });
        let pb = p.compile();
        assert_eq!(pb.events()[0].kind, PatternEventKind::NoteOn { note: 60, velocity: 100 });
        assert_eq!(pb.events()[1].kind, PatternEventKind::NoteOn { note: 64, velocity: 100 });
    }

    #[test]
    fn sustained_at_finds_latest_note_on_for_channel_note() {
        let mut p = Pattern::new("p", 384);
        // Interleaved across channels so a (channel, note, time) sort would
        // scatter these relative to the earlier, unrelated channel-1 event.
        p.push_event(PatternEvent {
            time_ppqn: 5,
            channel: 1,
            kind: PatternEventKind::NoteOn { note: 64, velocity: 100 },
        });
        p.push_event(PatternEvent {
            time_ppqn: 0,
            channel: 0,
            kind: PatternEventKind::NoteOn { note: 60, velocity: 100 },
        });
        p.push_event(PatternEvent {
            time_ppqn: 96,
            channel: 0,
            kind: PatternEventKind::NoteOff { note: 60 },
        });
        let pb = p.compile();
        assert!(pb.sustained_at(0, 60, 50));
        assert!(!pb.sustained_at(0, 60, 96));
        assert!(!pb.sustained_at(0, 61, 50));
        assert!(pb.sustained_at(1, 64, 10));
    }

    #[test]
    fn lower_bound_finds_first_at_or_after() {
        let mut p = Pattern::new("p", 384);
        for t in [0u64, 96, 192, 288] {
            p.push_event(PatternEvent {
                time_ppqn: t,
                channel: 0,
                kind: PatternEventKind::NoteOn { note: 60, velocity: 1 },
            });
        }
        let pb = p.compile();
        assert_eq!(pb.lower_bound(100), 2);
        assert_eq!(pb.lower_bound(0), 0);
        assert_eq!(pb.lower_bound(1000), 4);
    }

    #[test]
    fn active_notes_sticky_tracks_on_off() {
        let mut an = ActiveNotes::new();
        an.accumulate_sticky(0, &PatternEventKind::NoteOn { note: 60, velocity: 100 });
        assert!(an.is_active(0, 60));
        an.accumulate_sticky(0, &PatternEventKind::NoteOff { note: 60 });
        assert!(!an.is_active(0, 60));
    }

    #[test]
    fn active_notes_release_variant_flags_pending() {
        let mut an = ActiveNotes::new();
        let mut pending = ActiveNotes::new();
        an.accumulate_sticky_with_release(0, &PatternEventKind::NoteOn { note: 60, velocity: 100 }, &mut pending);
        an.accumulate_sticky_with_release(0, &PatternEventKind::NoteOff { note: 60 }, &mut pending);
        assert!(pending.is_active(0, 60));
        assert!(!an.is_active(0, 60));
    }

    #[test]
    fn clip_playback_renders_events_in_window() {
        let mut p = Pattern::new("clip-p", 384);
        p.push_event(PatternEvent { time_ppqn: 0, channel: 0, kind: PatternEventKind::NoteOn { note: 60, velocity: 100 } });
        p.push_event(PatternEvent { time_ppqn: 96, channel: 0, kind: PatternEventKind::NoteOff { note: 60 } });
        let pb = p.compile();
        let mut clip = ClipPlayback::new(pb, 0, 384, 0, 0);
        let mut active = ActiveNotes::new();
        let mut dest = MidiBuffer::with_capacity(8);
        clip.render(0, 100, 0, &mut active, |ppqn| ppqn as u32 * 10, &mut dest);
        assert_eq!(dest.len(), 2);
        assert!(!active.is_active(0, 60));
    }
}
