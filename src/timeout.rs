//! Software timeouts
//!
//! USB frames arrive once per millisecond while the bus is running, so the
//! frame number doubles as a millisecond clock. A [`SoftwareTimeout`] counts
//! frame changes observed by a poll loop.

/// The timeout expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Expired;

/// A millisecond countdown bound to one pending transfer.
///
/// Start one when a poll loop begins waiting on the hardware, and poll it
/// with the current frame number on every iteration. Each observed change
/// of the frame number counts as one millisecond, so the countdown works
/// with 11-bit hardware frame counters that wrap at 2048.
///
/// A timeout of `T` expires on the first poll that observes the
/// `T + 1`th frame change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SoftwareTimeout {
    remaining_ms: u16,
    last_frame: u16,
}

impl SoftwareTimeout {
    /// Start a countdown of `timeout_ms`, beginning at frame `frame`.
    pub const fn start(timeout_ms: u16, frame: u16) -> Self {
        SoftwareTimeout {
            remaining_ms: timeout_ms,
            last_frame: frame,
        }
    }

    /// Account for a frame change since the previous poll.
    pub fn poll(&mut self, frame: u16) -> Result<(), Expired> {
        if frame == self.last_frame {
            return Ok(());
        }
        self.last_frame = frame;
        match self.remaining_ms.checked_sub(1) {
            Some(remaining_ms) => {
                self.remaining_ms = remaining_ms;
                Ok(())
            }
            None => Err(Expired),
        }
    }

    /// Returns the milliseconds left before the countdown expires.
    pub fn remaining_ms(&self) -> u16 {
        self.remaining_ms
    }
}
