//! Output fan-out: the ring buffer plus the set of live subscribers.
//!
//! One `Fanout` per session. The session's read loop publishes chunks;
//! client connections register sinks that forward chunks onto their
//! outbound queues.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::ring::RingBuffer;

/// Token identifying a registered sink, used for removal.
pub type SinkId = u64;

/// Capability receiving one session's output stream.
///
/// Implementations must not block: they are invoked from the session's
/// read loop.
pub trait OutputSink: Send + Sync {
    /// Deliver one chunk of PTY output.
    fn data(&self, chunk: Bytes);

    /// The session's child exited with `code`. No more data will follow.
    fn exited(&self, code: u32);
}

struct Inner {
    ring: RingBuffer,
    sinks: Vec<(SinkId, Arc<dyn OutputSink>)>,
    next_id: SinkId,
}

#[derive(Clone)]
pub struct Fanout {
    inner: Arc<Mutex<Inner>>,
}

impl Fanout {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ring: RingBuffer::new(ring_capacity),
                sinks: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Publish a chunk: append it to the replay ring and deliver it to
    /// every registered sink. The ring append and the sink snapshot happen
    /// in one critical section so a concurrent `add_sink` either sees the
    /// chunk in its replay tail or receives it live, never both.
    pub fn publish(&self, chunk: Bytes) {
        let sinks = {
            let mut inner = self.inner.lock();
            inner.ring.append(&chunk);
            inner.sinks.clone()
        };
        for (_, sink) in sinks {
            let payload = chunk.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.data(payload)))
                .is_err()
            {
                tracing::warn!("output sink panicked");
            }
        }
    }

    /// Register a sink and return its removal token.
    ///
    /// If the ring holds replay data the sink receives a copy of the
    /// current tail before this call returns. The lock is held across the
    /// replay, so no chunk published after the add point can overtake it.
    pub fn add_sink(&self, sink: Arc<dyn OutputSink>) -> SinkId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sinks.push((id, Arc::clone(&sink)));
        if !inner.ring.is_empty() {
            let tail = Bytes::from(inner.ring.tail());
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.data(tail))).is_err()
            {
                tracing::warn!("output sink panicked during replay");
            }
        }
        id
    }

    /// Remove a sink by token. Unknown tokens are ignored.
    pub fn remove_sink(&self, id: SinkId) {
        self.inner.lock().sinks.retain(|(sid, _)| *sid != id);
    }

    /// Notify every sink that the session's child exited.
    pub fn notify_exit(&self, code: u32) {
        let sinks = {
            let inner = self.inner.lock();
            inner.sinks.clone()
        };
        for (_, sink) in sinks {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.exited(code)))
                .is_err()
            {
                tracing::warn!("output sink panicked on exit notification");
            }
        }
    }

    /// Drop every registered sink, releasing their connection references.
    pub fn clear_sinks(&self) {
        self.inner.lock().sinks.clear();
    }

    pub fn sink_count(&self) -> usize {
        self.inner.lock().sinks.len()
    }

    /// Copy of the current ring tail.
    pub fn tail(&self) -> Vec<u8> {
        self.inner.lock().ring.tail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// Test sink recording everything it receives.
    #[derive(Default)]
    struct Recorder {
        chunks: PlMutex<Vec<Vec<u8>>>,
        exit: PlMutex<Option<u32>>,
    }

    impl OutputSink for Recorder {
        fn data(&self, chunk: Bytes) {
            self.chunks.lock().push(chunk.to_vec());
        }
        fn exited(&self, code: u32) {
            *self.exit.lock() = Some(code);
        }
    }

    #[test]
    fn publish_reaches_all_sinks() {
        let fanout = Fanout::new(64);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        fanout.add_sink(a.clone());
        fanout.add_sink(b.clone());

        fanout.publish(Bytes::from_static(b"one"));
        fanout.publish(Bytes::from_static(b"two"));

        assert_eq!(a.chunks.lock().as_slice(), &[b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(b.chunks.lock().as_slice(), &[b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn late_sink_gets_replay_first() {
        let fanout = Fanout::new(64);
        fanout.publish(Bytes::from_static(b"early "));
        fanout.publish(Bytes::from_static(b"output"));

        let late = Arc::new(Recorder::default());
        fanout.add_sink(late.clone());
        fanout.publish(Bytes::from_static(b"!live"));

        let chunks = late.chunks.lock();
        assert_eq!(chunks[0], b"early output", "replay tail must come first");
        assert_eq!(chunks[1], b"!live");
    }

    #[test]
    fn sink_on_empty_ring_gets_no_replay() {
        let fanout = Fanout::new(64);
        let sink = Arc::new(Recorder::default());
        fanout.add_sink(sink.clone());
        assert!(sink.chunks.lock().is_empty());
    }

    #[test]
    fn removed_sink_stops_receiving() {
        let fanout = Fanout::new(64);
        let sink = Arc::new(Recorder::default());
        let id = fanout.add_sink(sink.clone());
        fanout.publish(Bytes::from_static(b"before"));
        fanout.remove_sink(id);
        fanout.publish(Bytes::from_static(b"after"));

        assert_eq!(sink.chunks.lock().as_slice(), &[b"before".to_vec()]);
        assert_eq!(fanout.sink_count(), 0);
    }

    #[test]
    fn panicking_sink_does_not_affect_siblings() {
        struct Exploder;
        impl OutputSink for Exploder {
            fn data(&self, _chunk: Bytes) {
                panic!("boom");
            }
            fn exited(&self, _code: u32) {}
        }

        let fanout = Fanout::new(64);
        fanout.add_sink(Arc::new(Exploder));
        let ok = Arc::new(Recorder::default());
        fanout.add_sink(ok.clone());

        fanout.publish(Bytes::from_static(b"survives"));
        assert_eq!(ok.chunks.lock().as_slice(), &[b"survives".to_vec()]);
    }

    #[test]
    fn exit_notification_reaches_sinks() {
        let fanout = Fanout::new(64);
        let sink = Arc::new(Recorder::default());
        fanout.add_sink(sink.clone());
        fanout.notify_exit(7);
        assert_eq!(*sink.exit.lock(), Some(7));
    }

    #[test]
    fn ring_respects_capacity_through_fanout() {
        let fanout = Fanout::new(4);
        fanout.publish(Bytes::from_static(b"0123456789"));
        assert_eq!(fanout.tail(), b"6789");
    }
}
