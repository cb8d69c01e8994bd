#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod event;
pub mod format;
pub mod metrics;
pub mod queue;

pub mod prelude {
    pub use crate::{
        buffer::{BufferFlags, BufferHeader, BufferId, BufferLedger, LedgerError, Owner},
        event::{EventQueue, WaitOutcome},
        format::{
            AudioParams, Crop, EsFormat, FormatParams, FourCc, FrameRate, MediaKind, VideoParams,
            codes,
        },
        metrics::Metrics,
        queue::{BufferFifo, FifoError, FifoItem, Peeked},
    };
}
