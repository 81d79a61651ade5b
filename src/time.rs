// src/time.rs
//
// Master transport and sample<->PPQN conversion. Mirrors the teacher's
// split between a plain-data RT-safe transport snapshot (`Transport` in the
// old tree) and a control-side position tracker that advances it — here
// folded into one `Master` since the spec doesn't separate the two the way
// the old scheduler did.

pub const PPQN_DEFAULT: u32 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stop,
    Rolling,
    /// Rolling has been asked to stop; the current block must still flush
    /// note-offs for anything left sounding before the next block reports
    /// `Stop`.
    Stopping,
}

#[derive(Debug, Clone, Copy)]
pub struct Master {
    pub sample_rate: f64,
    pub ppqn_factor: u32,
    pub tempo_bpm: f64,
    pub timesig_num: u8,
    pub timesig_denom: u8,
    pub state: TransportState,
    pub song_pos_samples: u64,
    pub song_pos_ppqn: u64,
    /// A tempo change requested mid-block takes effect at the next block
    /// boundary so one render call never straddles two sample-per-ppqn
    /// ratios.
    pub pending_new_tempo: Option<f64>,
}

impl Master {
    pub fn new(sample_rate: f64, ppqn_factor: u32) -> Self {
        Self {
            sample_rate,
            ppqn_factor,
            tempo_bpm: 120.0,
            timesig_num: 4,
            timesig_denom: 4,
            state: TransportState::Stop,
            song_pos_samples: 0,
            song_pos_ppqn: 0,
            pending_new_tempo: None,
        }
    }

    pub fn samples_per_ppqn(&self) -> f64 {
        let ppqn_per_minute = self.tempo_bpm * self.ppqn_factor as f64;
        (self.sample_rate * 60.0) / ppqn_per_minute
    }

    pub fn request_tempo(&mut self, bpm: f64) {
        self.pending_new_tempo = Some(bpm);
    }

    /// Applies a pending tempo change. Call at a block boundary, never
    /// mid-block.
    pub fn apply_pending_tempo(&mut self) {
        if let Some(bpm) = self.pending_new_tempo.take() {
            self.tempo_bpm = bpm;
        }
    }

    pub fn play(&mut self) {
        self.state = TransportState::Rolling;
    }

    pub fn request_stop(&mut self) {
        if self.state == TransportState::Rolling {
            self.state = TransportState::Stopping;
        }
    }

    pub fn finish_stop(&mut self) {
        self.state = TransportState::Stop;
    }

    pub fn seek_ppqn(&mut self, ppqn: u64) {
        self.song_pos_ppqn = ppqn;
        self.song_pos_samples = ppqn_to_samples(ppqn, self.tempo_bpm, self.sample_rate, self.ppqn_factor);
    }
}

/// Converts an absolute PPQN tick position to an absolute sample position
/// at a fixed tempo. Truncates rather than rounds, matching the original
/// engine's sample-counter semantics (a PPQN tick always maps to the
/// sample at or before its exact real-valued position).
pub fn ppqn_to_samples(ppqn: u64, tempo_bpm: f64, sample_rate: f64, ppqn_factor: u32) -> u64 {
    let ppqn_per_minute = tempo_bpm * ppqn_factor as f64;
    let samples_per_ppqn = (sample_rate * 60.0) / ppqn_per_minute;
    (ppqn as f64 * samples_per_ppqn) as u64
}

/// Inverse of [`ppqn_to_samples`]. Also truncates.
pub fn samples_to_ppqn(samples: u64, tempo_bpm: f64, sample_rate: f64, ppqn_factor: u32) -> u64 {
    let ppqn_per_minute = tempo_bpm * ppqn_factor as f64;
    let samples_per_ppqn = (sample_rate * 60.0) / ppqn_per_minute;
    (samples as f64 / samples_per_ppqn) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_quarter_note_at_120bpm_48k() {
        // 120 bpm => 0.5s per quarter note => 24000 samples per quarter,
        // ppqn_factor 96 ticks per quarter => 250 samples per tick.
        let samples = ppqn_to_samples(96, 120.0, 48_000.0, 96);
        assert_eq!(samples, 24_000);
    }

    #[test]
    fn roundtrip_ppqn_samples() {
        let ppqn = 480u64;
        let samples = ppqn_to_samples(ppqn, 120.0, 48_000.0, 96);
        let back = samples_to_ppqn(samples, 120.0, 48_000.0, 96);
        assert_eq!(back, ppqn);
    }

    #[test]
    fn pending_tempo_applies_only_on_request() {
        let mut m = Master::new(48_000.0, 96);
        m.request_tempo(140.0);
        assert_eq!(m.tempo_bpm, 120.0);
        m.apply_pending_tempo();
        assert_eq!(m.tempo_bpm, 140.0);
    }

    #[test]
    fn stop_transitions_through_stopping() {
        let mut m = Master::new(48_000.0, 96);
        m.play();
        assert_eq!(m.state, TransportState::Rolling);
        m.request_stop();
        assert_eq!(m.state, TransportState::Stopping);
        m.finish_stop();
        assert_eq!(m.state, TransportState::Stop);
    }
}
