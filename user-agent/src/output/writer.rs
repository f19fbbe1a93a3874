// src/output/writer.rs

use crate::output::{
    format::{render_record, LogFormat},
    names::NameResolver,
    sink::LogSink,
    EventCode, LogEvent,
};
use crate::pipeline::stats::Counter;
use log::Level;
use serde::{ser::SerializeMap, Serialize, Serializer};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// Records written per event code, plus failures.
#[derive(Debug, Default)]
pub struct WriterStats {
    events:      [Counter; EventCode::COUNT],
    pub errors:  Counter,
    pub batches: Counter,
}

impl WriterStats {
    pub fn count(&self, code: EventCode) -> u64 {
        self.events[code as usize].get()
    }

    fn record(&self, code: EventCode) {
        self.events[code as usize].incr();
    }
}

impl Serialize for WriterStats {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        struct Events<'a>(&'a WriterStats);
        impl Serialize for Events<'_> {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                let mut m = s.serialize_map(Some(EventCode::COUNT))?;
                for code in EventCode::ALL {
                    m.serialize_entry(code.name(), &self.0.count(code))?;
                }
                m.end()
            }
        }
        let mut m = s.serialize_map(Some(3))?;
        m.serialize_entry("events", &Events(self))?;
        m.serialize_entry("errors", &self.errors)?;
        m.serialize_entry("batches", &self.batches)?;
        m.end()
    }
}

/// Batched serializer in front of a sink. Serialization happens here, off the
/// pipeline threads; a record that fails to serialize is counted and skipped.
pub struct LogWriter {
    pub rx:             mpsc::Receiver<LogEvent>,
    pub sink:           Box<dyn LogSink>,
    pub format:         Box<dyn LogFormat>,
    pub names:          Option<Arc<dyn NameResolver>>,
    pub flush_interval: Duration,
    pub batch_size:     usize,
    pub stats:          Arc<WriterStats>,
}

impl LogWriter {
    /// Start the writer loop; call inside tokio::spawn. Returns once every
    /// sender is gone and the tail has been flushed.
    pub async fn run(mut self) {
        let mut buffer = Vec::new();
        let mut pending = 0usize;
        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(ev) => {
                        if self.serialize(&ev, &mut buffer) {
                            pending += 1;
                        }
                        if pending >= self.batch_size {
                            self.flush(&mut buffer).await;
                            pending = 0;
                        }
                    }
                    None => {
                        self.flush(&mut buffer).await;
                        break;
                    }
                },
                _ = interval.tick() => {
                    self.flush(&mut buffer).await;
                    pending = 0;
                }
            }
        }
    }

    fn serialize(&mut self, ev: &LogEvent, buffer: &mut Vec<u8>) -> bool {
        let names = self.names.as_deref();
        match render_record(&ev.tree, self.format.as_mut(), names) {
            Ok(()) => {
                buffer.extend_from_slice(&self.format.take());
                self.stats.record(ev.code);
                true
            }
            Err(e) => {
                self.format.reset();
                self.stats.errors.incr();
                hostmon_log!(Level::Warn, "output", "dropping {} record: {}", ev.code.name(), e);
                false
            }
        }
    }

    async fn flush(&mut self, buffer: &mut Vec<u8>) {
        if buffer.is_empty() {
            return;
        }
        let res = match self.sink.write_batch(buffer).await {
            Ok(()) => self.sink.flush().await,
            Err(e) => Err(e),
        };
        buffer.clear();
        match res {
            Ok(()) => self.stats.batches.incr(),
            Err(e) => {
                self.stats.errors.incr();
                hostmon_log!(Level::Error, "output", "log sink write failed: {}", e);
            }
        }
    }
}
