// src/voice.rs
//
// A voice represents one active note / execution context. Voices do not
// own DSP state; DSP state lives in per-voice module instances indexed by
// `VoiceId`. `VoiceContext` is the read-only snapshot handed to a module's
// `ProcessContext` each block.

pub type VoiceId = usize;

#[derive(Debug, Clone)]
pub struct Voice {
    pub id: VoiceId,
    pub active: bool,
    pub note: u8,
    pub velocity: f32,
    /// True for the entire time the note is held down.
    pub gate: bool,
    /// True once a note-off has been received; envelopes use this to enter
    /// their release stage while `active` stays true until deactivation.
    pub release: bool,
    /// One-shot flag set on note-on, cleared at the start of the next
    /// block by `VoiceAllocator::clear_triggers`. Oscillators read this to
    /// decide whether to reset phase.
    pub trigger: bool,
}

impl Voice {
    #[inline]
    pub fn new(id: VoiceId) -> Self {
        Self {
            id,
            active: false,
            note: 0,
            velocity: 0.0,
            gate: false,
            release: false,
            trigger: false,
        }
    }

    pub fn note_on(&mut self, note: u8, velocity: f32) {
        self.active = true;
        self.note = note;
        self.velocity = velocity;
        self.gate = true;
        self.release = false;
        self.trigger = true;
    }

    pub fn note_off(&mut self) {
        self.gate = false;
        self.release = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
        self.gate = false;
        self.release = false;
        self.trigger = false;
    }

    pub fn clear_triggers(&mut self) {
        self.trigger = false;
    }
}

/// Read-only per-voice snapshot passed into `ProcessContext`.
#[derive(Debug, Clone, Copy)]
pub struct VoiceContext {
    pub id: VoiceId,
    pub note: u8,
    pub velocity: f32,
    pub gate: bool,
    pub release: bool,
    pub trigger: bool,
}

impl From<&Voice> for VoiceContext {
    fn from(v: &Voice) -> Self {
        Self {
            id: v.id,
            note: v.note,
            velocity: v.velocity,
            gate: v.gate,
            release: v.release,
            trigger: v.trigger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_on_sets_trigger_and_gate() {
        let mut v = Voice::new(0);
        v.note_on(60, 0.8);
        assert!(v.active);
        assert!(v.gate);
        assert!(v.trigger);
        assert!(!v.release);
    }

    #[test]
    fn note_off_enters_release_without_clearing_active() {
        let mut v = Voice::new(0);
        v.note_on(60, 0.8);
        v.clear_triggers();
        v.note_off();
        assert!(v.active);
        assert!(!v.gate);
        assert!(v.release);
        assert!(!v.trigger);
    }

    #[test]
    fn deactivate_resets_all_flags() {
        let mut v = Voice::new(0);
        v.note_on(60, 1.0);
        v.deactivate();
        assert!(!v.active);
        assert!(!v.gate);
        assert!(!v.release);
    }
}
