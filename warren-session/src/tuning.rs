//! Tuning negotiation.
//!
//! During the handshake both peers declare the limits they want for
//! channel-max, frame-max and heartbeat. Zero means "no preference" from that
//! side; otherwise the more restrictive value wins.

use warren_wire::{CHANNEL_MAX_FALLBACK, DEFAULT_FRAME_MAX, FRAME_OVERHEAD};

/// Combine a locally requested limit with a peer-offered one.
///
/// If either side is zero the other side's value wins; if both are non-zero
/// the smaller wins. Commutative and infallible.
pub fn combine<T>(ours: T, theirs: T) -> T
where
    T: Copy + Ord + Default,
{
    let zero = T::default();
    if ours == zero {
        theirs
    } else if theirs == zero {
        ours
    } else {
        ours.min(theirs)
    }
}

/// The three tunable connection limits.
///
/// Holds either the locally requested values (before the handshake) or the
/// agreed values (after [`TuningParams::negotiate`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningParams {
    /// Highest usable channel number; 0 means unlimited.
    pub channel_max: u16,
    /// Largest frame size in bytes, including header and footer.
    pub frame_max: u32,
    /// Heartbeat interval in seconds; 0 disables heartbeats.
    pub heartbeat: u16,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            channel_max: 0,
            frame_max: DEFAULT_FRAME_MAX,
            heartbeat: 0,
        }
    }
}

impl TuningParams {
    /// Combine these (locally requested) limits with the peer's offer,
    /// field by field.
    pub fn negotiate(&self, offered: &TuningParams) -> TuningParams {
        TuningParams {
            channel_max: combine(self.channel_max, offered.channel_max),
            frame_max: combine(self.frame_max, offered.frame_max),
            heartbeat: combine(self.heartbeat, offered.heartbeat),
        }
    }

    /// The channel-number ceiling used for allocation: the negotiated
    /// channel-max, or the protocol fallback when unlimited.
    pub fn channel_limit(&self) -> u16 {
        if self.channel_max == 0 {
            CHANNEL_MAX_FALLBACK
        } else {
            self.channel_max
        }
    }

    /// Largest content-body payload that fits in one frame.
    pub fn max_body_piece(&self) -> usize {
        self.frame_max as usize - FRAME_OVERHEAD
    }
}
