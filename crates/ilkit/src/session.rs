use std::time::Duration;

use ilkit_component::{
    CodecKind, Result,
    session::{ComponentSession, OutputUnit, SessionState, SessionStats},
};
use ilkit_core::prelude::{BufferFlags, EsFormat};
use tracing::debug;

use crate::SampleClock;

/// An open codec component, ready for data.
///
/// Dropping the session closes it.
///
/// # Example
/// ```rust,ignore
/// use ilkit::prelude::*;
///
/// let mut session = OpenRequest::decoder(format).open(&registry)?;
/// session.submit_input(&unit, pts, BufferFlags::empty())?;
/// if let Some(picture) = session.poll_output()? {
///     println!("{} bytes at {}", picture.data.len(), picture.timestamp);
/// }
/// session.close();
/// ```
#[derive(Debug)]
pub struct Session {
    inner: ComponentSession,
    clock: Option<SampleClock>,
}

impl Session {
    pub(crate) fn new(inner: ComponentSession) -> Self {
        let clock = match (inner.kind(), inner.output_format().as_audio()) {
            (CodecKind::Decoder, Some(audio)) => Some(SampleClock::new(audio.rate)),
            _ => None,
        };
        Self { inner, clock }
    }

    /// Name of the native component serving this session.
    pub fn component(&self) -> &str {
        self.inner.name()
    }

    pub fn kind(&self) -> CodecKind {
        self.inner.kind()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.stats()
    }

    /// Format of the units [`Session::poll_output`] returns.
    pub fn output_format(&self) -> &EsFormat {
        self.inner.output_format()
    }

    /// Borrow the underlying component session.
    pub fn inner(&self) -> &ComponentSession {
        &self.inner
    }

    /// Feed one unit; may block while the component holds every input buffer.
    pub fn submit_input(&mut self, data: &[u8], timestamp: i64, flags: BufferFlags) -> Result<()> {
        if flags.intersects(BufferFlags::DISCONTINUITY | BufferFlags::DATA_CORRUPT)
            && let Some(clock) = &mut self.clock
        {
            clock.reset();
        }
        self.inner.submit_input(data, timestamp, flags)
    }

    /// Next output unit, if one is ready.
    pub fn poll_output(&mut self) -> Result<Option<OutputUnit>> {
        let unit = self.inner.poll_output()?;
        Ok(unit.map(|unit| self.restamp(unit)))
    }

    /// Next output unit, waiting up to `timeout`.
    pub fn poll_output_timeout(&mut self, timeout: Duration) -> Result<Option<OutputUnit>> {
        let unit = self.inner.poll_output_timeout(timeout)?;
        Ok(unit.map(|unit| self.restamp(unit)))
    }

    /// Discard queued input; a no-op when nothing was submitted since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(clock) = &mut self.clock {
            clock.reset();
        }
        self.inner.flush()
    }

    /// Tear the component down. Never fails from the caller's view.
    pub fn close(self) {
        self.inner.close();
    }

    fn restamp(&mut self, mut unit: OutputUnit) -> OutputUnit {
        let Some(clock) = &mut self.clock else {
            return unit;
        };
        let format = self.inner.output_format();
        let Some(audio) = format.as_audio() else {
            return unit;
        };
        // The rate may change with a reconfiguration.
        if audio.rate.max(1) != clock.rate() {
            *clock = SampleClock::new(audio.rate);
        }
        let bits = match audio.bits_per_sample {
            0 => 16,
            bits => bits.max(8),
        };
        let frame_bytes = usize::from(audio.channels.max(1)) * usize::from(bits / 8);
        let samples = (unit.data.len() / frame_bytes) as u64;
        let native = unit.timestamp;
        unit.timestamp = clock.stamp(native, samples);
        debug!(native, pts = unit.timestamp, samples, "audio output stamped");
        unit
    }
}
