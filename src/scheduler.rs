//! The download scheduler.
//!
//! A single task owns the priority queues, the in-flight tracker and the pool of fetch workers.
//! Each iteration it takes the most urgent request, trims it to one chunk, cuts away whatever
//! the range store or a running fetch already covers and hands the rest to a fetch worker.
//! Fragments it cannot dispatch yet go back to the front of the lane they came from.

use std::{collections::HashMap, sync::Arc};

use futures::FutureExt;
use tokio::{
    sync::mpsc::{error::TryRecvError, UnboundedReceiver},
    task::{Id as TaskId, JoinError, JoinSet},
};

use crate::{
    catalog::MediaCatalog,
    error::{CacheError, CacheResult, ProviderError},
    inflight::{FlightId, InFlightTracker},
    interval::{self, ByteRange},
    provider::ProviderRegistry,
    queue::{Priority, PriorityQueues, QueueItem},
    store::{CachedChunk, RangeStore},
    MediaId,
};

/// Requests the scheduler accepts from client handles.
#[derive(Debug)]
pub(crate) enum Command {
    Enqueue { priority: Priority, item: QueueItem },
    Stop,
}

/// Worker pool bounds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerLimits {
    /// Hard cap on running fetch workers.
    pub max_downloaders: usize,
    /// Slots only `top` requests may take.
    pub priority_downloaders: usize,
}

impl WorkerLimits {
    fn background_cap(self) -> usize {
        self.max_downloaders.saturating_sub(self.priority_downloaders)
    }
}

pub(crate) struct Scheduler {
    commands: UnboundedReceiver<Command>,
    queues: PriorityQueues,
    in_flight: InFlightTracker,
    workers: JoinSet<CacheResult<()>>,
    /// Flight each running worker is responsible for.
    worker_flights: HashMap<TaskId, FlightId>,
    /// Running fetch workers.
    active: usize,
    limits: WorkerLimits,
    running: bool,
    store: RangeStore,
    catalog: Arc<MediaCatalog>,
    providers: Arc<ProviderRegistry>,
}

impl Scheduler {
    pub(crate) fn new(
        commands: UnboundedReceiver<Command>,
        limits: WorkerLimits,
        store: RangeStore,
        catalog: Arc<MediaCatalog>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            commands,
            queues: PriorityQueues::default(),
            in_flight: InFlightTracker::default(),
            workers: JoinSet::new(),
            worker_flights: HashMap::new(),
            active: 0,
            limits,
            running: true,
            store,
            catalog,
            providers,
        }
    }

    #[tracing::instrument(name = "scheduler", skip_all)]
    pub(crate) async fn run(mut self) {
        tracing::info!(limits = ?self.limits, "download scheduler started");

        loop {
            // Apply everything already pending, so that fresh `top` requests win this round.
            self.drain_ready();

            if !self.running {
                break;
            }

            if self.must_wait() {
                tokio::select! {
                    command = self.commands.recv() => match command {
                        Some(command) => self.handle(command),
                        None => self.running = false,
                    },
                    Some(res) = self.workers.join_next_with_id() => self.finish(res),
                }

                continue;
            }

            if let Some((priority, item)) = self.queues.pop() {
                self.process(priority, item);
            }
        }

        self.shutdown().await;
    }

    /// Whether the loop has to suspend until something changes.
    ///
    /// Once the background cap is reached the remaining slots are kept for `top` requests.
    fn must_wait(&self) -> bool {
        self.queues.is_empty()
            || self.active >= self.limits.max_downloaders
            || (self.active >= self.limits.background_cap()
                && self.queues.lane_is_empty(Priority::Top))
    }

    fn drain_ready(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running = false;
                    break;
                }
            }
        }

        while let Some(res) = self.workers.join_next_with_id().now_or_never().flatten() {
            self.finish(res);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { priority, item } => {
                tracing::trace!(?priority, media_id = %item.media_id, range = ?item.range, "request queued");
                self.queues.push_back(priority, item);
            }
            Command::Stop => {
                tracing::info!("stop requested");
                self.running = false;
            }
        }
    }

    /// Runs one queue item through splitting, cache and in-flight checks and dispatches what is
    /// left of it.
    fn process(&mut self, priority: Priority, item: QueueItem) {
        let (head, tail) = interval::split_at_chunk(item.range.clone(), item.chunk_size);

        if let Some(tail) = tail {
            self.queues.push_front_all(priority, [item.fragment(tail)]);
        }

        let item = QueueItem { range: head, ..item };

        let cached = self.store.query_overlapping(&item.media_id, &item.range);

        if !cached.is_empty() {
            let gaps = interval::subtract(&item.range, cached.iter().map(CachedChunk::range));

            if gaps.is_empty() {
                tracing::trace!(media_id = %item.media_id, range = ?item.range, "satisfied from cache");
            } else {
                self.requeue(priority, &item, gaps);
            }

            return;
        }

        let colliding = self.in_flight.colliding(&item.media_id, &item.range);

        if !colliding.is_empty() {
            // Whoever waits on this item also waits on the fetches covering part of it.
            if let Some(completion) = &item.completion {
                for (flight, _) in &colliding {
                    self.in_flight.park(*flight, completion.clone());
                }
            }

            let gaps = interval::subtract(&item.range, colliding.iter().map(|(_, r)| r));

            if gaps.is_empty() {
                tracing::trace!(media_id = %item.media_id, range = ?item.range, "already being fetched");
            } else {
                self.requeue(priority, &item, gaps);
            }

            return;
        }

        self.dispatch(item);
    }

    fn requeue(&mut self, priority: Priority, item: &QueueItem, gaps: Vec<ByteRange>) {
        tracing::trace!(media_id = %item.media_id, range = ?item.range, ?gaps, "cut into gaps");

        let fragments: Vec<_> = gaps.into_iter().map(|gap| item.fragment(gap)).collect();
        self.queues.push_front_all(priority, fragments);
    }

    fn dispatch(&mut self, item: QueueItem) {
        let QueueItem {
            media_id,
            range,
            completion,
            ..
        } = item;

        let flight = self.in_flight.register(media_id.clone(), range.clone());

        // Released once the worker is done, whatever the outcome.
        if let Some(completion) = completion {
            self.in_flight.park(flight, completion);
        }

        let job = FetchJob {
            media_id,
            range,
            store: self.store.clone(),
            catalog: self.catalog.clone(),
            providers: self.providers.clone(),
        };

        let handle = self.workers.spawn(job.run());
        self.worker_flights.insert(handle.id(), flight);
        self.active += 1;

        tracing::debug!(active = self.active, "fetch dispatched");
    }

    fn finish(&mut self, res: Result<(TaskId, CacheResult<()>), JoinError>) {
        self.active = self.active.saturating_sub(1);

        let (task_id, res) = match res {
            Ok((task_id, res)) => (task_id, res),
            Err(e) => (e.id(), Err(e.into())),
        };

        let Some(flight) = self.worker_flights.remove(&task_id) else {
            tracing::warn!(%task_id, "finished worker had no flight");
            return;
        };

        let Some((media_id, range)) = self.in_flight.complete(flight) else {
            return;
        };

        match res {
            Ok(()) => tracing::debug!(%media_id, ?range, active = self.active, "fetch finished"),
            // Should never happen, the scheduler only dispatches ranges that are not cached.
            Err(e @ CacheError::DuplicateRange { .. }) => {
                tracing::error!(%media_id, ?range, "range store invariant violated: {e}");
            }
            Err(e) => tracing::error!(%media_id, ?range, "fetch failed: {e}"),
        }
    }

    async fn shutdown(&mut self) {
        // Senders observe the closed channel from now on.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            drop(command);
        }

        let dropped = self.queues.clear();
        tracing::info!(dropped, in_flight = self.in_flight.len(), "stopping download scheduler");

        while let Some(res) = self.workers.join_next_with_id().await {
            self.finish(res);
        }

        debug_assert!(self.in_flight.is_empty(), "flights outlived their workers");

        tracing::info!("download scheduler stopped");
    }
}

/// Everything a fetch worker needs to fetch one gap and cache it.
struct FetchJob {
    media_id: MediaId,
    range: ByteRange,
    store: RangeStore,
    catalog: Arc<MediaCatalog>,
    providers: Arc<ProviderRegistry>,
}

impl FetchJob {
    #[tracing::instrument(name = "fetch", skip_all, fields(media_id = %self.media_id, range = ?self.range), err(Debug))]
    async fn run(self) -> CacheResult<()> {
        let record = self
            .catalog
            .get(&self.media_id)
            .ok_or_else(|| CacheError::MediaNotFound(self.media_id.clone()))?;

        let provider = self.providers.resolve(&record.source)?;
        let mut data = provider.download(&record, self.range.clone()).await?;

        let expected = self.range.end - self.range.start;
        let received = data.len() as u64;

        if received < expected {
            return Err(ProviderError::ShortBody { expected, received }.into());
        }

        if received > expected {
            tracing::warn!(expected, received, "provider returned extra bytes");
            #[allow(clippy::cast_possible_truncation)]
            data.truncate(expected as usize);
        }

        self.store.insert(&self.media_id, self.range, data).await?;

        Ok(())
    }
}
