//! Local audio routing.
//!
//! One capture path (microphone -> capture gain -> every peer connection) and
//! one playback path per remote peer (remote track -> spatial node -> master
//! gain -> output). Mute drives the capture gain, deafen drives the master
//! gain.

pub mod graph;
pub mod local;

pub use graph::*;
pub use local::*;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Gain value shared between the session and audio threads (lock-free).
#[derive(Clone, Debug)]
pub struct GainParam(Arc<AtomicU32>);

impl GainParam {
    pub fn new(value: f32) -> Self {
        Self(Arc::new(AtomicU32::new(value.to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Takes effect on the next processed block.
    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Scale `samples` in place by the current value.
    pub fn apply(&self, samples: &mut [f32]) {
        let gain = self.get();
        if gain == 1.0 {
            return;
        }
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
}

/// Gain for an on/off switch: 0 when silenced, 1 otherwise.
pub fn switch_gain(silenced: bool) -> f32 {
    if silenced {
        0.0
    } else {
        1.0
    }
}

/// Local mute/deafen flags, changed only by UI actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioOptions {
    pub mute: bool,
    pub deaf: bool,
}

impl AudioOptions {
    pub fn new(mute_on_connect: bool) -> Self {
        Self {
            mute: mute_on_connect,
            deaf: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_param_shared() {
        let gain = GainParam::new(1.0);
        let audio_side = gain.clone();
        gain.set(0.0);
        assert_eq!(audio_side.get(), 0.0);

        let mut block = [0.5f32, -0.5];
        audio_side.apply(&mut block);
        assert_eq!(block, [0.0, -0.0]);
    }

    #[test]
    fn test_options_default_to_muted_on_connect() {
        let opts = AudioOptions::new(true);
        assert!(opts.mute);
        assert!(!opts.deaf);
        assert_eq!(switch_gain(opts.mute), 0.0);
        assert_eq!(switch_gain(opts.deaf), 1.0);
    }
}
