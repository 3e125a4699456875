//! A single multiplexed deadline queue.
//!
//! Every externally observable timeout (acknowledgement, execution, retry)
//! is keyed into one priority queue drained by one task, instead of one
//! sleeping task per timer.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use mesh_primitives::JobId;

/// What a deadline means when it fires.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TimerKey {
    /// The agent did not acknowledge the assignment in time.
    Ack(JobId),
    /// The job's execution timeout elapsed.
    Execution(JobId),
    /// The retry backoff elapsed and the job may run again.
    Retry(JobId),
}

enum Command {
    Schedule(TimerKey, Instant),
    Cancel(TimerKey),
}

/// Handle to the deadline queue task.
///
/// Scheduling the same key again supersedes the earlier deadline; cancelled
/// or superseded entries never fire.
#[derive(Clone, Debug)]
pub struct TimerWheel {
    commands: mpsc::UnboundedSender<Command>,
}

impl TimerWheel {
    /// Spawns the queue task, returning the handle, the receiver of fired
    /// keys, and the task handle for shutdown.
    #[must_use]
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<TimerKey>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(command_rx, fired_tx));
        (Self { commands: command_tx }, fired_rx, task)
    }

    /// Schedules a key to fire after the delay.
    pub fn schedule(&self, key: TimerKey, after: Duration) {
        // Send fails only when the queue task is gone during shutdown.
        let _ = self
            .commands
            .send(Command::Schedule(key, Instant::now() + after));
    }

    /// Cancels a pending key.
    pub fn cancel(&self, key: TimerKey) {
        let _ = self.commands.send(Command::Cancel(key));
    }
}

async fn run(
    mut commands: mpsc::UnboundedReceiver<Command>,
    fired: mpsc::UnboundedSender<TimerKey>,
) {
    let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut entries: HashMap<u64, TimerKey> = HashMap::new();
    let mut generations: HashMap<TimerKey, u64> = HashMap::new();
    let mut next_id: u64 = 0;

    loop {
        let sleep_until = heap.peek().map(|Reverse((at, _))| *at);

        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Schedule(key, at)) => {
                        next_id += 1;
                        entries.insert(next_id, key);
                        generations.insert(key, next_id);
                        heap.push(Reverse((at, next_id)));
                        trace!(?key, "deadline scheduled");
                    }
                    Some(Command::Cancel(key)) => {
                        if let Some(id) = generations.remove(&key) {
                            entries.remove(&id);
                        }
                    }
                    None => return,
                }
            }
            () = async {
                match sleep_until {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                let now = Instant::now();
                while let Some(Reverse((at, id))) = heap.peek().copied() {
                    if at > now {
                        break;
                    }
                    heap.pop();
                    let Some(key) = entries.remove(&id) else {
                        continue;
                    };
                    // Only the latest generation for a key may fire.
                    if generations.get(&key) == Some(&id) {
                        generations.remove(&key);
                        trace!(?key, "deadline fired");
                        if fired.send(key).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
