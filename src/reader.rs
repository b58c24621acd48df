//! Reading and decoding an instance's trace buffer.
//!
//! The reader drains whatever the per-CPU `trace_pipe_raw` files currently
//! hold, decodes every record against the format database, and delivers
//! the result as one stream ordered by non-decreasing timestamp, ties
//! broken by CPU index ascending. Delivery is single-threaded and
//! cooperative: a callback runs to completion before the next record is
//! handed out.

use crate::decode::CpuRecords;
use crate::decode::DecodedEvent;
use crate::decode::decode_record;
use crate::error::Error;
use crate::error::Result;
use crate::format::FormatDatabase;
use crate::instance::Instance;
use crate::tracefs::TraceFs;
use std::iter::Peekable;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

/// Decodes the ring buffer of an instance.
pub struct TraceReader<F: TraceFs> {
    fs: Arc<F>,
    db: Arc<FormatDatabase>,
}

impl<F: TraceFs> TraceReader<F> {
    pub fn new(fs: Arc<F>, db: Arc<FormatDatabase>) -> Self {
        Self { fs, db }
    }

    /// Drain the buffer and return every decoded event, merged across
    /// CPUs in timestamp order.
    pub fn read_trace(&self, instance: &Instance) -> Result<Vec<DecodedEvent>> {
        Ok(self.events(instance)?.collect())
    }

    /// Streaming form of [`read_trace`]: the callback is invoked
    /// synchronously per event and decides whether to continue. Returns
    /// once the currently available data is drained or the callback
    /// breaks.
    ///
    /// [`read_trace`]: TraceReader::read_trace
    pub fn iterate_trace<C>(&self, instance: &Instance, mut callback: C) -> Result<()>
    where
        C: FnMut(DecodedEvent) -> ControlFlow<()>,
    {
        for event in self.events(instance)? {
            if callback(event).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Continuous-poll form: keeps draining, sleeping `poll` between empty
    /// rounds, until the callback breaks.
    pub fn follow_trace<C>(&self, instance: &Instance, poll: Duration, mut callback: C) -> Result<()>
    where
        C: FnMut(DecodedEvent) -> ControlFlow<()>,
    {
        loop {
            for event in self.events(instance)? {
                if callback(event).is_break() {
                    return Ok(());
                }
            }
            std::thread::sleep(poll);
        }
    }

    /// A lazy, forward-only iterator over the currently available records.
    pub fn events(&self, instance: &Instance) -> Result<EventIter> {
        let mut streams = Vec::new();
        for cpu in self.cpu_ids(instance)? {
            let file = format!("per_cpu/cpu{cpu}/trace_pipe_raw");
            let raw = match self.fs.read_bytes(instance.name(), &file) {
                Ok(raw) => raw,
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            let decoded: Vec<DecodedEvent> = CpuRecords::new(&raw)
                .map(|record| decode_record(&self.db, cpu, record))
                .collect();
            log::debug!("cpu{cpu}: {} records decoded", decoded.len());
            streams.push(decoded.into_iter().peekable());
        }
        Ok(EventIter { streams })
    }

    fn cpu_ids(&self, instance: &Instance) -> Result<Vec<u32>> {
        let entries = match self.fs.list_dir(instance.name(), "per_cpu") {
            Ok(entries) => entries,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        let mut cpus: Vec<u32> = entries
            .iter()
            .filter_map(|name| name.strip_prefix("cpu")?.parse().ok())
            .collect();
        cpus.sort_unstable();
        Ok(cpus)
    }
}

/// Merges per-CPU record streams by `(timestamp, cpu)` ascending.
///
/// Each per-CPU stream is already in timestamp order, so picking the
/// smallest head at every step yields a globally ordered stream.
pub struct EventIter {
    streams: Vec<Peekable<std::vec::IntoIter<DecodedEvent>>>,
}

impl Iterator for EventIter {
    type Item = DecodedEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let mut best: Option<(u64, u32, usize)> = None;
        for (idx, stream) in self.streams.iter_mut().enumerate() {
            if let Some(head) = stream.peek() {
                let key = (head.timestamp, head.cpu, idx);
                if best.is_none_or(|current| key < current) {
                    best = Some(key);
                }
            }
        }
        let (_, _, idx) = best?;
        self.streams[idx].next()
    }
}
