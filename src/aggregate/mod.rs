//! Ingestion routing (SPEC_FULL.md §4.2/§4.3): trades below
//! `notionalThresholdMicros` go to the small-trade buffer, everything else
//! goes straight to the window aggregator.

pub mod buffer;
pub mod window;

use crate::config::SmallTradeBufferingConfig;
use crate::model::{PendingTradeEvent, TradeEventGroup};
use buffer::{BufferFlush, BufferParams, SmallTradeBuffer};
use std::sync::Arc;
use tokio::sync::mpsc;
use window::Aggregator;

pub struct IngestRouter {
    aggregator: Arc<Aggregator>,
    buffer: Option<Arc<SmallTradeBuffer>>,
    notional_threshold_micros: i64,
}

impl IngestRouter {
    pub fn new(
        buffering: &SmallTradeBufferingConfig,
        group_emit: mpsc::UnboundedSender<TradeEventGroup>,
        buffer_flush_emit: mpsc::UnboundedSender<BufferFlush>,
    ) -> Self {
        let aggregator = Aggregator::new(group_emit);
        let buffer = if buffering.enabled {
            Some(SmallTradeBuffer::new(
                BufferParams {
                    flush_min_notional_micros: buffering.flush_min_notional_micros,
                    min_exec_notional_micros: buffering.min_exec_notional_micros,
                    max_buffer_ms: buffering.max_buffer_ms,
                    quiet_flush_ms: buffering.quiet_flush_ms,
                    netting_mode: buffering.netting_mode,
                },
                buffer_flush_emit,
            ))
        } else {
            None
        };
        IngestRouter { aggregator, buffer, notional_threshold_micros: buffering.notional_threshold_micros }
    }

    pub fn ingest(&self, event: PendingTradeEvent) {
        let below_threshold = event.notional_micros.to_i64_saturating() < self.notional_threshold_micros;
        match (&self.buffer, below_threshold) {
            (Some(buffer), true) => buffer.ingest(event),
            _ => self.aggregator.ingest(event),
        }
    }

    pub fn shutdown(&self) {
        self.aggregator.force_flush_all();
        if let Some(buffer) = &self.buffer {
            buffer.force_flush_all();
        }
    }
}
