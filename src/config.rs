// src/config.rs
//
// Engine-lifetime configuration. Fixed at construction; nothing on the RT
// path reads a mutable config, so this is plain data with no locking.

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub sample_rate: f64,
    pub ppqn_factor: u32,
    pub max_block_size: usize,
    pub max_voices_per_instrument: usize,
    pub rt_command_capacity: usize,
    pub prefetch_pipe_count: usize,
    pub prefetch_buffer_frames: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            ppqn_factor: 96,
            max_block_size: 4096,
            max_voices_per_instrument: 32,
            rt_command_capacity: 256,
            prefetch_pipe_count: 4,
            prefetch_buffer_frames: 2048 * 4,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sample_rate <= 0.0 {
            return Err(EngineError::InvalidArgument("sample_rate must be positive".into()));
        }
        if self.ppqn_factor == 0 {
            return Err(EngineError::InvalidArgument("ppqn_factor must be nonzero".into()));
        }
        if self.max_block_size == 0 {
            return Err(EngineError::InvalidArgument("max_block_size must be nonzero".into()));
        }
        if self.max_voices_per_instrument == 0 {
            return Err(EngineError::InvalidArgument("max_voices_per_instrument must be nonzero".into()));
        }
        if self.prefetch_buffer_frames < crate::prefetch::PIPE_MIN_PREFETCH_SIZE_FRAMES {
            return Err(EngineError::InvalidArgument("prefetch_buffer_frames below minimum".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_sample_rate_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.sample_rate = 0.0;
        assert!(cfg.validate().is_err());
    }
}
