use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;
use tracing::{debug, warn};

use crate::core::types::{KeywordId, RecordId};
use crate::index::forward::ForwardIndex;
use crate::index::inverted::InvertedList;
use crate::index::store::{rebuild_list, IndexStore, RebuiltList};

pub type RebuildTask = (KeywordId, Option<Arc<InvertedList>>, Vec<RecordId>);

/// Rebuild the dirty lists, fanning out to a worker pool when it pays off.
/// Workers claim tasks through a shared fetch-and-increment cursor and ship
/// results back over a channel; the dispatcher blocks until every list is in.
pub(crate) fn run_rebuild(
    tasks: Vec<RebuildTask>,
    forward: &ForwardIndex,
    total_records: usize,
    workers: usize,
) -> Vec<RebuiltList> {
    if tasks.len() < 2 || workers < 2 {
        return tasks
            .iter()
            .map(|(keyword, old, appended)| {
                rebuild_list(*keyword, old.as_deref(), appended, forward, total_records)
            })
            .collect();
    }

    let cursor = AtomicUsize::new(0);
    let (sender, receiver) = channel::bounded(tasks.len());
    let worker_count = workers.min(tasks.len());

    crossbeam::scope(|scope| {
        for _ in 0..worker_count {
            let sender = sender.clone();
            let cursor = &cursor;
            let tasks = &tasks;
            scope.spawn(move |_| loop {
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                let Some((keyword, old, appended)) = tasks.get(i) else {
                    break;
                };
                let rebuilt =
                    rebuild_list(*keyword, old.as_deref(), appended, forward, total_records);
                if sender.send(rebuilt).is_err() {
                    break;
                }
            });
        }
        drop(sender);
    })
    .expect("merge worker panicked");

    receiver.into_iter().collect()
}

/// Background driver of the two merge thresholds: every N seconds or every M
/// writes, whichever fires first.
pub struct MergeScheduler {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl MergeScheduler {
    pub fn start(store: Arc<IndexStore>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("merge-scheduler".to_string())
            .spawn(move || {
                let interval = Duration::from_secs(1);
                loop {
                    if stop_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    let due_by_writes =
                        store.pending_writes() >= store.config().merge_every_m_writes;
                    let due_by_time = store.seconds_since_last_merge()
                        >= store.config().merge_every_n_seconds;
                    if due_by_writes || due_by_time {
                        let view = store.merge();
                        debug!(version = view.version, "scheduled merge");
                    }
                    std::thread::park_timeout(interval);
                }
            })
            .expect("spawn merge scheduler");
        MergeScheduler {
            stop,
            handle: Some(handle),
        }
    }

    pub fn shutdown(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("merge scheduler thread panicked");
            }
        }
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
