//! Fan-out of job output streams and progress reports.
//!
//! Stream items for one job form a lazy, finite, non-restartable sequence
//! terminated by an `is_end` item or by subscriber cancellation. The relay
//! enforces contiguous sequences, buffers the head for late subscribers,
//! and broadcasts the live tail.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

use mesh_primitives::{JobId, JobProgress, StreamItem};

const LIVE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct JobStream {
    buffer: Vec<StreamItem>,
    live: broadcast::Sender<StreamItem>,
    next_sequence: u64,
    ended: bool,
}

impl Default for JobStream {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            live: broadcast::channel(LIVE_CHANNEL_CAPACITY).0,
            next_sequence: 0,
            ended: false,
        }
    }
}

#[derive(Debug)]
struct JobProgressSlot {
    latest: JobProgress,
    live: broadcast::Sender<JobProgress>,
}

/// A subscription to one job's output stream.
///
/// `replay` holds every item published before the subscription was taken;
/// `live` yields the tail in publish order. Together they form the full
/// prefix of the publisher's sequence.
#[derive(Debug)]
pub struct StreamSubscription {
    /// Items published before the subscription.
    pub replay: Vec<StreamItem>,
    /// Live tail of the stream.
    pub live: broadcast::Receiver<StreamItem>,
}

/// Relays stream items and progress reports to subscribers.
#[derive(Debug, Default)]
pub struct StreamRelay {
    streams: DashMap<JobId, JobStream>,
    progress: DashMap<JobId, JobProgressSlot>,
}

impl StreamRelay {
    /// Creates an empty relay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes one stream item.
    ///
    /// Returns `true` when the item was accepted. Items after the `is_end`
    /// terminator and items that break the contiguous sequence are dropped
    /// with a warning so no subscriber can ever observe a gap.
    pub fn publish(&self, item: StreamItem) -> bool {
        let mut stream = self.streams.entry(item.job_id).or_default();

        if stream.ended {
            warn!(job_id = %item.job_id, sequence = item.sequence, "stream item after end; dropped");
            return false;
        }
        if item.sequence != stream.next_sequence {
            warn!(
                job_id = %item.job_id,
                expected = stream.next_sequence,
                got = item.sequence,
                "out-of-order stream item; dropped"
            );
            return false;
        }

        stream.next_sequence += 1;
        stream.ended = item.is_end;
        stream.buffer.push(item.clone());
        // A send error only means no live subscriber; the buffer serves them.
        let _ = stream.live.send(item);
        true
    }

    /// Subscribes to a job's stream, replaying the persisted head.
    #[must_use]
    pub fn subscribe(&self, job_id: JobId) -> StreamSubscription {
        let stream = self.streams.entry(job_id).or_default();
        StreamSubscription {
            replay: stream.buffer.clone(),
            live: stream.live.subscribe(),
        }
    }

    /// Records a progress report and forwards it to live subscribers.
    pub fn publish_progress(&self, progress: JobProgress) {
        match self.progress.entry(progress.job_id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.latest = progress.clone();
                let _ = slot.live.send(progress);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
                let _ = live.send(progress.clone());
                vacant.insert(JobProgressSlot {
                    latest: progress,
                    live,
                });
            }
        }
    }

    /// Returns the latest progress for a job, if any was reported.
    #[must_use]
    pub fn latest_progress(&self, job_id: JobId) -> Option<JobProgress> {
        self.progress.get(&job_id).map(|slot| slot.latest.clone())
    }

    /// Subscribes to a job's live progress reports.
    #[must_use]
    pub fn subscribe_progress(&self, job_id: JobId) -> broadcast::Receiver<JobProgress> {
        match self.progress.entry(job_id) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().live.subscribe(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (live, rx) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
                vacant.insert(JobProgressSlot {
                    latest: JobProgress {
                        job_id,
                        percent: 0,
                        message: None,
                        reported_at: chrono::Utc::now(),
                    },
                    live,
                });
                rx
            }
        }
    }

    /// Drops a job's stream and progress state once it is fully consumed.
    pub fn evict(&self, job_id: JobId) {
        self.streams.remove(&job_id);
        self.progress.remove(&job_id);
    }
}
