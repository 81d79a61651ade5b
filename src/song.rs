// src/song.rs
//
// `SongPlayback` is the RT-rendered top of the playback hierarchy: tracks
// over a tempo map, with transport control (play/stop/seek/loop) and the
// stuck-note release protocol that runs whenever a seek or track swap could
// otherwise leave a note sounding forever.
//
// The per-callback render algorithm mirrors the old scheduler's
// slice-at-a-time compile loop, but windows are now split at tempo-map
// breakpoints and the loop boundary rather than at arbitrary event times:
// each sub-window renders at one fixed sample-per-ppqn ratio, so a tempo
// change or loop wrap never happens mid-window.

use crate::doc::DocId;
use crate::midi::MidiBuffer;
use crate::time::{ppqn_to_samples, samples_to_ppqn, Master, TransportState};
use crate::time_mapper::TempoPoint;
use crate::track::TrackPlayback;

pub struct Song {
    pub id: DocId,
    pub name: String,
    pub tracks: Vec<DocId>,
    pub tempo_map: Vec<TempoPoint>,
    pub loop_start_ppqn: u64,
    pub loop_end_ppqn: u64,
    pub looping: bool,
}

impl Song {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: DocId::new(),
            name: name.into(),
            tracks: Vec::new(),
            tempo_map: vec![TempoPoint { start_ppqn: 0, bpm: 120.0 }],
            loop_start_ppqn: 0,
            loop_end_ppqn: 0,
            looping: false,
        }
    }
}

/// RT-installed playback state for a song. `tempo_map_pos` is a
/// monotonically-advancing cursor into `tempo_map` kept across calls so a
/// normal forward-playing render doesn't re-scan from the start of the map
/// every block.
pub struct SongPlayback {
    pub tracks: Vec<TrackPlayback>,
    pub tempo_map: Vec<TempoPoint>,
    pub song_pos_samples: u64,
    pub song_pos_ppqn: u64,
    pub min_time_ppqn: u64,
    pub loop_start_ppqn: u64,
    pub loop_end_ppqn: u64,
    pub looping: bool,
    tempo_map_pos: usize,
    scratch: Vec<MidiBuffer>,
}

impl SongPlayback {
    pub fn new(tempo_map: Vec<TempoPoint>, sample_rate: f64, ppqn_factor: u32) -> Self {
        let _ = (sample_rate, ppqn_factor);
        Self {
            tracks: Vec::new(),
            tempo_map,
            song_pos_samples: 0,
            song_pos_ppqn: 0,
            min_time_ppqn: 0,
            loop_start_ppqn: 0,
            loop_end_ppqn: 0,
            looping: false,
            tempo_map_pos: 0,
            scratch: Vec::new(),
        }
    }

    fn tempo_at(&mut self, ppqn: u64) -> f64 {
        while self.tempo_map_pos + 1 < self.tempo_map.len()
            && self.tempo_map[self.tempo_map_pos + 1].start_ppqn <= ppqn
        {
            self.tempo_map_pos += 1;
        }
        while self.tempo_map_pos > 0 && self.tempo_map[self.tempo_map_pos].start_ppqn > ppqn {
            self.tempo_map_pos -= 1;
        }
        self.tempo_map.get(self.tempo_map_pos).map(|p| p.bpm).unwrap_or(120.0)
    }

    fn next_tempo_boundary(&self, ppqn: u64) -> Option<u64> {
        self.tempo_map
            .iter()
            .map(|p| p.start_ppqn)
            .find(|&t| t > ppqn)
    }

    /// Renders `n_frames` of output from all tracks into `dest_per_track`,
    /// advancing the song position. Returns `true` if the song is still
    /// rolling after this block (`false` once a `Stopping` flush completes
    /// and the transport has come to rest).
    pub fn render_block(
        &mut self,
        master: &mut Master,
        n_frames: u32,
        dest_per_track: &mut [MidiBuffer],
    ) -> bool {
        master.apply_pending_tempo();

        if master.state == TransportState::Stop {
            return false;
        }

        if self.scratch.len() < self.tracks.len() {
            self.scratch.resize_with(self.tracks.len(), || MidiBuffer::with_capacity(64));
        }

        if master.state == TransportState::Stopping {
            for (track, dest) in self.tracks.iter_mut().zip(dest_per_track.iter_mut()) {
                dest.clear();
                flush_note_offs(track, dest);
            }
            master.finish_stop();
            return false;
        }

        let mut remaining = n_frames;
        let mut block_offset = 0u32;

        for dest in dest_per_track.iter_mut() {
            dest.clear();
        }

        while remaining > 0 {
            let bpm = self.tempo_at(self.song_pos_ppqn);
            let sample_rate = master.sample_rate;
            let ppqn_factor = master.ppqn_factor;

            let ppqn_now = self.song_pos_ppqn;
            let window_start_samples = ppqn_to_samples(ppqn_now, bpm, sample_rate, ppqn_factor);

            // Bound this sub-window by: the remaining frames, the next
            // tempo breakpoint, and the loop end (if looping). Each bound
            // is expressed in samples at the current tempo, then the
            // smallest one wins and gets converted back to a PPQN end.
            let mut window_end_samples = window_start_samples + remaining as u64;

            if let Some(boundary) = self.next_tempo_boundary(ppqn_now) {
                window_end_samples = window_end_samples.min(ppqn_to_samples(boundary, bpm, sample_rate, ppqn_factor));
            }
            if self.looping && self.loop_end_ppqn > ppqn_now {
                window_end_samples =
                    window_end_samples.min(ppqn_to_samples(self.loop_end_ppqn, bpm, sample_rate, ppqn_factor));
            }
            window_end_samples = window_end_samples.max(window_start_samples + 1);

            let window_frames = (window_end_samples - window_start_samples).min(remaining as u64) as u32;
            let window_end_ppqn =
                samples_to_ppqn(window_start_samples + window_frames as u64, bpm, sample_rate, ppqn_factor)
                    .max(ppqn_now + 1);

            let channel = 0u8;
            for (idx, track) in self.tracks.iter_mut().enumerate() {
                self.scratch[idx].clear();
                let base_samples = block_offset;
                track.render(
                    ppqn_now,
                    window_end_ppqn,
                    channel,
                    move |ppqn| {
                        let s = ppqn_to_samples(ppqn, bpm, sample_rate, ppqn_factor);
                        (s.saturating_sub(window_start_samples) as u32 + base_samples).min(u32::MAX)
                    },
                    &mut self.scratch[idx],
                );
                for ev in self.scratch[idx].as_slice() {
                    let _ = dest_per_track[idx].push(*ev);
                }
            }

            self.song_pos_ppqn = window_end_ppqn;
            self.song_pos_samples += window_frames as u64;
            block_offset += window_frames;
            remaining = remaining.saturating_sub(window_frames);

            if self.looping && self.song_pos_ppqn >= self.loop_end_ppqn {
                self.song_pos_ppqn = self.loop_start_ppqn;
                self.song_pos_samples = ppqn_to_samples(self.loop_start_ppqn, bpm, sample_rate, ppqn_factor);
                for (track, dest) in self.tracks.iter_mut().zip(dest_per_track.iter_mut()) {
                    let _ = track.seek(self.loop_start_ppqn, channel, block_offset, dest);
                }
            } else if !self.looping && self.song_pos_ppqn >= self.loop_end_ppqn && self.loop_end_ppqn > 0 {
                master.request_stop();
                break;
            }
        }

        master.song_pos_samples = self.song_pos_samples;
        master.song_pos_ppqn = self.song_pos_ppqn;
        true
    }

    /// Control-side seek: jumps every track straight to `target_ppqn`,
    /// running the stuck-note release protocol on each (`TrackPlayback::
    /// seek`) so anything left ringing from the old position gets an
    /// explicit note-off before the position actually moves. Returns
    /// `false` without moving anything if any destination buffer lacked
    /// room for a release --- the caller should retry next callback once
    /// the buffers have drained, per the RT command queue's "call again
    /// later" convention: `TrackPlayback::seek` is idempotent against the
    /// same `target_ppqn` (a track already migrated on a prior, partially
    /// failed attempt re-derives the same state and emits no further
    /// releases), so a caller can simply retry the whole call.
    #[must_use]
    pub fn seek(&mut self, target_ppqn: u64, master: &mut Master, dest_per_track: &mut [MidiBuffer]) -> bool {
        if self.tracks.len() > dest_per_track.len() {
            return false;
        }

        let channel = 0u8;
        for (track, dest) in self.tracks.iter_mut().zip(dest_per_track.iter_mut()) {
            if !track.seek(target_ppqn, channel, 0, dest) {
                return false;
            }
        }

        self.tempo_map_pos = 0;
        let bpm = self.tempo_at(target_ppqn);
        self.song_pos_ppqn = target_ppqn;
        self.song_pos_samples = ppqn_to_samples(target_ppqn, bpm, master.sample_rate, master.ppqn_factor);
        master.song_pos_samples = self.song_pos_samples;
        master.song_pos_ppqn = self.song_pos_ppqn;
        true
    }
}

fn flush_note_offs(track: &mut TrackPlayback, dest: &mut MidiBuffer) {
    for (channel, note) in track.active_notes.iter_active() {
        let _ = dest.push(crate::midi::MidiEvent::note_off(0, channel, note));
    }
    track.active_notes.clear_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_state_renders_nothing() {
        let mut master = Master::new(48_000.0, 96);
        let mut song = SongPlayback::new(vec![TempoPoint { start_ppqn: 0, bpm: 120.0 }], 48_000.0, 96);
        let mut dest = vec![MidiBuffer::with_capacity(8)];
        let rolling = song.render_block(&mut master, 512, &mut dest);
        assert!(!rolling);
    }

    #[test]
    fn stopping_flushes_and_clears_active_notes() {
        let mut master = Master::new(48_000.0, 96);
        master.play();
        master.request_stop();
        let mut song = SongPlayback::new(vec![TempoPoint { start_ppqn: 0, bpm: 120.0 }], 48_000.0, 96);
        let mut track = crate::track::Track::new("t").compile(|_| None);
        track.active_notes.set(0, 60);
        song.tracks.push(track);

        let mut dest = vec![MidiBuffer::with_capacity(8)];
        let rolling = song.render_block(&mut master, 512, &mut dest);
        assert!(!rolling);
        assert!(!song.tracks[0].active_notes.is_active(0, 60));
        assert_eq!(dest[0].len(), 1);
        assert_eq!(master.state, TransportState::Stop);
    }

    #[test]
    fn seek_emits_note_off_for_note_not_sustained_at_target() {
        use crate::pattern::{Pattern, PatternEvent, PatternEventKind};
        use crate::track::{Track, TrackItem};

        let mut master = Master::new(48_000.0, 96);
        master.play();
        let mut song = SongPlayback::new(vec![TempoPoint { start_ppqn: 0, bpm: 120.0 }], 48_000.0, 96);

        let mut pattern = Pattern::new("p", 384);
        pattern.push_event(PatternEvent { time_ppqn: 0, channel: 0, kind: PatternEventKind::NoteOn { note: 60, velocity: 100 } });
        pattern.push_event(PatternEvent { time_ppqn: 96, channel: 0, kind: PatternEventKind::NoteOff { note: 60 } });
        let compiled = pattern.compile();

        let mut track = Track::new("t");
        track.add_item(TrackItem { pattern_id: compiled.id, start_ppqn: 0, end_ppqn: 384, offset_ppqn: 0 });
        let playback = track.compile(|_| Some(compiled.clone()));
        song.tracks.push(playback);

        let mut dest = vec![MidiBuffer::with_capacity(8)];
        let rolling = song.render_block(&mut master, 50, &mut dest);
        assert!(rolling);
        assert!(song.tracks[0].active_notes.is_active(0, 60));

        let mut seek_dest = vec![MidiBuffer::with_capacity(8)];
        let ok = song.seek(200, &mut master, &mut seek_dest);
        assert!(ok);
        assert!(!song.tracks[0].active_notes.is_active(0, 60));
        assert_eq!(seek_dest[0].len(), 1);
        assert!(seek_dest[0].as_slice()[0].is_note_off());
        assert_eq!(song.song_pos_ppqn, 200);
    }
}
