// src/time_mapper.rs
//
// Maps between a song's sample-domain transport position and PPQN ticks
// across a tempo map, the way the original engine's song time mapper did:
// walk the sorted tempo breakpoints to find the segment containing the
// query position, then apply that segment's fixed sample-per-ppqn ratio.
//
// Sentinel handling: a tempo breakpoint's `ppqn` field uses `u32::MAX` to
// mark "open ended" (no further breakpoints), so a song with a single
// constant tempo doesn't need a second entry just to bound the first.

use crate::time::{ppqn_to_samples, samples_to_ppqn, Master, TransportState};

pub const OPEN_ENDED: u32 = u32::MAX;

/// High bit of a late-scheduled time value: set means the low 31 bits are a
/// PPQN tick, clear means they're a sample offset.
pub const MUSICAL_TIME_FLAG: u32 = 0x8000_0000;
/// Returned when the query is too far ahead of the free-running counter to
/// be scheduled sample-accurately --- the caller should fall back to
/// quantizing the event to the next block instead.
pub const LATE_SENTINEL: u32 = u32::MAX;
const MAX_LOOKAHEAD_SAMPLES: i64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoPoint {
    pub start_ppqn: u64,
    pub bpm: f64,
}

pub trait TimeMapper {
    fn ppqn_at_sample(&self, sample_pos: u64) -> u64;
    fn sample_at_ppqn(&self, ppqn: u64) -> u64;
}

/// Tempo-map-aware mapper for a song. Breakpoints must be sorted by
/// `start_ppqn` ascending; the last breakpoint is open-ended.
pub struct SongTimeMapper<'a> {
    pub tempo_map: &'a [TempoPoint],
    pub sample_rate: f64,
    pub ppqn_factor: u32,
}

impl<'a> SongTimeMapper<'a> {
    fn segment_for_ppqn(&self, ppqn: u64) -> usize {
        match self.tempo_map.binary_search_by(|p| p.start_ppqn.cmp(&ppqn)) {
            Ok(idx) => idx,
            Err(0) => 0,
            Err(idx) => idx - 1,
        }
    }

    fn segment_for_sample(&self, sample_pos: u64) -> usize {
        // Walk forward converting each breakpoint's start to a sample
        // position; the tempo map is short (a handful of entries per
        // song), so a linear scan beats maintaining a second index.
        let mut seg = 0;
        let mut seg_start_samples = 0u64;
        for (i, window) in self.tempo_map.windows(2).enumerate() {
            let span_ppqn = window[1].start_ppqn - window[0].start_ppqn;
            let span_samples = ppqn_to_samples(span_ppqn, window[0].bpm, self.sample_rate, self.ppqn_factor);
            if sample_pos < seg_start_samples + span_samples {
                return i;
            }
            seg_start_samples += span_samples;
            seg = i + 1;
        }
        seg
    }
}

impl<'a> TimeMapper for SongTimeMapper<'a> {
    fn ppqn_at_sample(&self, sample_pos: u64) -> u64 {
        if self.tempo_map.is_empty() {
            return 0;
        }
        let seg = self.segment_for_sample(sample_pos);
        let mut seg_start_samples = 0u64;
        for window in self.tempo_map[..=seg.min(self.tempo_map.len() - 1)].windows(2) {
            let span_ppqn = window[1].start_ppqn - window[0].start_ppqn;
            seg_start_samples += ppqn_to_samples(span_ppqn, window[0].bpm, self.sample_rate, self.ppqn_factor);
        }
        let point = &self.tempo_map[seg];
        let seg_start_for_point = if seg == 0 {
            0
        } else {
            let mut acc = 0u64;
            for window in self.tempo_map[..=seg - 1].windows(2) {
                let span_ppqn = window[1].start_ppqn - window[0].start_ppqn;
                acc += ppqn_to_samples(span_ppqn, window[0].bpm, self.sample_rate, self.ppqn_factor);
            }
            acc
        };
        let rel_samples = sample_pos.saturating_sub(seg_start_for_point);
        point.start_ppqn + samples_to_ppqn(rel_samples, point.bpm, self.sample_rate, self.ppqn_factor)
    }

    fn sample_at_ppqn(&self, ppqn: u64) -> u64 {
        if self.tempo_map.is_empty() {
            return 0;
        }
        let seg = self.segment_for_ppqn(ppqn);
        let mut acc_samples = 0u64;
        for window in self.tempo_map[..=seg.min(self.tempo_map.len().saturating_sub(1)).max(0)].windows(2) {
            if window[1].start_ppqn > ppqn {
                break;
            }
            let span_ppqn = window[1].start_ppqn - window[0].start_ppqn;
            acc_samples += ppqn_to_samples(span_ppqn, window[0].bpm, self.sample_rate, self.ppqn_factor);
        }
        let point = &self.tempo_map[seg];
        let rel_ppqn = ppqn.saturating_sub(point.start_ppqn);
        acc_samples + ppqn_to_samples(rel_ppqn, point.bpm, self.sample_rate, self.ppqn_factor)
    }
}

/// Maps a free-running sample counter (e.g. a timestamp attached to a
/// host MIDI event) to the time value a late-scheduled RT command should
/// carry, per the engine's late-scheduling convention: a stopped transport
/// reports plain sample time, a rolling one reports musical (PPQN) time
/// tagged with [`MUSICAL_TIME_FLAG`] in the high bit, and a query too far
/// ahead of `free_running_frame_counter` to resolve sample-accurately
/// returns [`LATE_SENTINEL`].
///
/// `free_running_frame_counter` is the engine's own notion of "now" in the
/// free-running domain (distinct from `master.song_pos_samples`, which is
/// musical position and resets on loop wrap); `counter` is the query. Both
/// advance in samples regardless of transport state.
pub fn map_late_time(
    counter: u64,
    free_running_frame_counter: u64,
    master: &Master,
    loop_start_ppqn: Option<u64>,
    loop_end_ppqn: Option<u64>,
    tempo_map: &[TempoPoint],
) -> u32 {
    // Anything other than a steadily rolling transport reports plain sample
    // time: a stopped transport has no musical position to tag, and a
    // stopping one is mid-flush and about to report `Stop` next block, so
    // neither should have late-scheduled commands resolved against a PPQN
    // position that's about to go stale.
    if master.state != TransportState::Rolling {
        return (counter & 0x7FFF_FFFF) as u32;
    }

    let rel = counter as i64 - free_running_frame_counter as i64;
    if rel < 0 || rel >= MAX_LOOKAHEAD_SAMPLES {
        return LATE_SENTINEL;
    }

    let mut abs_samples = master.song_pos_samples + rel as u64;
    let mapper = SongTimeMapper { tempo_map, sample_rate: master.sample_rate, ppqn_factor: master.ppqn_factor };

    // Loop wrap happens in the sample domain, mirroring seq.c: the loop
    // bounds are converted to samples once, the query is folded into
    // `[start, end)` there, and only the wrapped sample position is mapped
    // back to PPQN. Wrapping after `ppqn_at_sample` would apply the new
    // segment's (post-wrap) tempo to a pre-wrap sample position whenever the
    // loop crosses a tempo breakpoint, shifting the reported tick.
    if let (Some(start), Some(end)) = (loop_start_ppqn, loop_end_ppqn) {
        if end > start {
            let start_samples = mapper.sample_at_ppqn(start);
            let end_samples = mapper.sample_at_ppqn(end);
            if end_samples > start_samples && abs_samples >= end_samples {
                let span = end_samples - start_samples;
                abs_samples = start_samples + (abs_samples - start_samples) % span;
            }
        }
    }

    let ppqn = mapper.ppqn_at_sample(abs_samples);
    (ppqn as u32 & 0x7FFF_FFFF) | MUSICAL_TIME_FLAG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_tempo_roundtrip() {
        let map = [TempoPoint { start_ppqn: 0, bpm: 120.0 }];
        let mapper = SongTimeMapper { tempo_map: &map, sample_rate: 48_000.0, ppqn_factor: 96 };
        let samples = mapper.sample_at_ppqn(480);
        assert_eq!(samples, ppqn_to_samples(480, 120.0, 48_000.0, 96));
        let back = mapper.ppqn_at_sample(samples);
        assert_eq!(back, 480);
    }

    #[test]
    fn tempo_change_segment_offsets_correctly() {
        let map = [
            TempoPoint { start_ppqn: 0, bpm: 120.0 },
            TempoPoint { start_ppqn: 960, bpm: 60.0 },
        ];
        let mapper = SongTimeMapper { tempo_map: &map, sample_rate: 48_000.0, ppqn_factor: 96 };
        let boundary_samples = mapper.sample_at_ppqn(960);
        let expected = ppqn_to_samples(960, 120.0, 48_000.0, 96);
        assert_eq!(boundary_samples, expected);

        let after = mapper.sample_at_ppqn(960 + 96);
        let expected_after = expected + ppqn_to_samples(96, 60.0, 48_000.0, 96);
        assert_eq!(after, expected_after);
    }

    #[test]
    fn stopped_transport_returns_sample_time_untagged() {
        let master = Master::new(48_000.0, 96);
        let v = map_late_time(1000, 0, &master, None, None, &[]);
        assert_eq!(v, 1000);
        assert_eq!(v & MUSICAL_TIME_FLAG, 0);
    }

    #[test]
    fn rolling_transport_tags_musical_time() {
        let mut master = Master::new(48_000.0, 96);
        master.play();
        master.song_pos_samples = 0;
        let map = [TempoPoint { start_ppqn: 0, bpm: 120.0 }];
        let v = map_late_time(24_000, 0, &master, None, None, &map);
        assert_ne!(v & MUSICAL_TIME_FLAG, 0);
        assert_eq!(v & 0x7FFF_FFFF, 96);
    }

    #[test]
    fn query_before_now_or_too_far_ahead_is_sentinel() {
        let mut master = Master::new(48_000.0, 96);
        master.play();
        let map = [TempoPoint { start_ppqn: 0, bpm: 120.0 }];
        assert_eq!(map_late_time(100, 200, &master, None, None, &map), LATE_SENTINEL);
        assert_eq!(map_late_time(200 + (1 << 20), 200, &master, None, None, &map), LATE_SENTINEL);
    }

    #[test]
    fn musical_time_wraps_at_loop_end() {
        let mut master = Master::new(48_000.0, 96);
        master.play();
        master.song_pos_samples = 0;
        let map = [TempoPoint { start_ppqn: 0, bpm: 120.0 }];
        let loop_end_samples = ppqn_to_samples(192, 120.0, 48_000.0, 96);
        let v = map_late_time(loop_end_samples, 0, &master, Some(0), Some(192), &map);
        assert_eq!(v & 0x7FFF_FFFF, 0);
    }
}
