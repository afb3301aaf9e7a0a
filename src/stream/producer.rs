// Producer worker: read one layer per consumer request, convert it, hand it over

use crossbeam_channel::Sender;
use layerstream_shared::{GeometrySource, StyleTable};
use std::sync::Arc;
use uuid::Uuid;

use crate::converter::LayerConverter;
use crate::error::StreamError;
use crate::queue::LayerQueue;
use crate::stream::StreamEvent;
use crate::stream::control::RunControl;

pub(crate) struct Producer {
    pub run_id: Uuid,
    pub source: Box<dyn GeometrySource>,
    pub styles: Arc<dyn StyleTable>,
    pub converter: LayerConverter,
    pub queue: Arc<LayerQueue>,
    pub control: Arc<RunControl>,
    pub events: Sender<StreamEvent>,
}

impl Producer {
    pub fn run(mut self) {
        let span = tracing::info_span!("producer", run = %self.run_id);
        let _enter = span.enter();
        tracing::debug!("Producer started, {} layers in source", self.source.total_count());

        let result = self.produce();
        let produced = match result {
            Ok(produced) => produced,
            Err((produced, error)) => {
                tracing::error!("Producer failed: {}", error);
                let _ = self.events.send(StreamEvent::Failed { worker: "producer", error });
                produced
            }
        };
        // Always release a consumer waiting on an empty queue
        self.queue.finish();
        let _ = self.events.send(StreamEvent::ProducerFinished { layers: produced });
        tracing::debug!("Producer finished after {} layers", produced);
    }

    fn produce(&mut self) -> Result<u32, (u32, StreamError)> {
        let mut produced = 0;
        while self.source.has_next() {
            if self.control.is_cancelled() || self.queue.wait_for_request().is_err() {
                return Ok(produced);
            }

            let layer = self.source.read_next().map_err(|source| {
                (produced, StreamError::Source { layer: produced, source })
            })?;
            let number = layer.index;
            let block = self
                .converter
                .convert(layer, self.styles.as_ref())
                .map_err(|source| (produced, StreamError::Conversion { layer: number, source }))?;

            if self.queue.push(block).is_err() {
                return Ok(produced);
            }
            produced += 1;
            let _ = self.events.send(StreamEvent::LayerProduced { layer: number });
        }
        Ok(produced)
    }
}
