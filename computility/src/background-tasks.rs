// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of computility.
//
// computility is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// computility is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with computility.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Background Task Processing
//!
//! [axum] makes no provision for compute outside the context of handling HTTP requests. This
//! module provides an async, persistent background task queue for [computility].
//!
//! [computility]: crate
//!
//! # Design
//!
//! Request handlers "send" tasks that should happen off the hot path of serving a request. The
//! motivating example is the recall notification: when a member leaves an org owing quota, the
//! removal itself must succeed whether or not the message bus is reachable at that moment, but the
//! notification should still get out *eventually*.
//!
//! [tokio::spawn] would lose the task should the process halt before it completes, so tasks are
//! instead serialized (as [MessagePack]) into a table in the same datastore that holds the quota
//! tables. A single processor (per process) leases tasks from that table & executes them:
//!
//! - a lease marks a task as checked-out until it expires; if the process holding the lease dies,
//!   the lease lapses & someone else picks the task up
//! - each lease counts as an attempt
//! - a task that succeeds is closed
//! - a task that fails (or times out, or panics) is rescheduled with exponential backoff, unless
//!   it has exhausted its attempts, in which case it is dead-lettered: it stays in the table, but
//!   will never be leased again
//!
//! [MessagePack]: https://msgpack.org/

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use pin_project::pin_project;
use rmp_serde::to_vec;
use scylla::DeserializeRow;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use tokio::{
    sync::Notify,
    task::{Id, JoinError, JoinHandle, JoinSet},
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    counter_add, gauge_setu,
    metrics::{self, Instruments, Sort},
    publisher::Publisher,
    recall::Topics,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    // Generic error variant trait implementations can use
    #[snafu(display("{source}"))]
    Background {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to mark a task complete: {source}"))]
    Completion {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Failed to deserialize a task: {source}"))]
    De {
        source: rmp_serde::decode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to record a task failure: {source}"))]
    Failure {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("{uuid} is not a recognized task"))]
    Id { uuid: Uuid },
    #[snafu(display("Task processing failed to run to completion: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timemout shutting-down the task processor: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to pick-up a new task: {source}"))]
    Take {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Tried to remove an unknown TaskId"))]
    TaskId { backtrace: Backtrace },
    #[snafu(display("Failed to serialize a task to messagepack: {source}"))]
    TaskSer {
        source: rmp_serde::encode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to wait for in-flight tasks: {source}"))]
    Timeout { source: tokio::time::error::Elapsed },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Background {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             tasks                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Trait defining a "task" for our purposes.
///
/// This system can handle any task that is [Send], and that can convert itself into an async
/// function yielding a `Result<()>`. Note especially that the `exec()` method consumes the task!
// Must be object-safe so that `process()` can handle tasks generically; hence the generic
// parameter lives on the trait rather than on `exec()`.
#[async_trait]
pub trait Task<C>: Send {
    /// Consume this task by converting it into a `Future` yielding a `Result<()>`.
    async fn exec(self: Box<Self>, context: C) -> Result<()>;
    fn timeout(&self) -> Option<Duration>;
}

/// A [Task] that can return a per-type "tag"; this is useful for deserialization.
pub trait TaggedTask<C>: Task<C> {
    type Tag;
    fn get_tag() -> Self::Tag;
}

/// Trait defining the ability to collect, or "send" [Task]s.
///
/// Generic over the [Task] type (rather than making `send()` generic) so that implementors can
/// express additional constraints on the types of [Task]s they can send.
#[async_trait]
pub trait Sender<C, T: Task<C>> {
    async fn send(&self, task: T) -> Result<()>;
}

/// What became of a failed task
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// It will be leased again no earlier than this
    Retry(DateTime<Utc>),
    /// It will never be leased again
    DeadLetter,
}

/// Trait defining the ability to harvest, or "receive" [Task]s generically.
///
/// A [Receiver] needs to be able to move [Task] trait objects out of the collection or backend,
/// along with a "cookie" identifying that task, and then, at a later time, mark them as complete or
/// failed.
#[async_trait]
pub trait Receiver<C> {
    type TaskId: Send + 'static;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()>;
    async fn mark_failed(&self, cookie: Self::TaskId) -> Result<Disposition>;
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>>;
}

/// Blanket implementation for [Arc]s; if `T` is a [Receiver], then so is `Arc<T>`.
#[async_trait]
impl<C, T: Receiver<C> + Send + Sync> Receiver<C> for Arc<T> {
    type TaskId = T::TaskId;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
        self.as_ref().mark_complete(cookie).await
    }
    async fn mark_failed(&self, cookie: Self::TaskId) -> Result<Disposition> {
        self.as_ref().mark_failed(cookie).await
    }
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>> {
        self.as_ref().take_task().await
    }
}

/// [Processor] manages the ongoing processing of background tasks. `shutdown()` will consume the
/// instance & resolve to the result of the processing loop (`Result<()>`).
#[pin_project]
pub struct Processor {
    // This               👇 must match the return type of `process()`
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Consume the instance & return the result of processing background tasks
    ///
    /// Signals the processing task to shutdown, and waits for time `timeout` for it to exit.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into it's parts
    ///
    /// Convenient when waiting on the processor along with other futures (in a `tokio::select!`
    /// invocation, e.g.)
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

/// Configuration parameters for processing background tasks
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Timeout that will be used for any task that doesn't define its own
    #[serde(rename = "default-timeout")]
    pub default_timeout: Duration,
    /// The maximum number of tasks to drive concurrently
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,
    /// Amount of time to sleep when we have no tasks in process
    #[serde(rename = "sleep-duration")]
    pub sleep_duration: Duration,
    /// Amount of time to wait for in-flight tasks on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
    /// Maximum amount of time to drive in-flight tasks without attempting to pick-up new tasks
    #[serde(rename = "pickup-timeout")]
    pub pickup_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            max_concurrent_tasks: 16,
            sleep_duration: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(500),
            pickup_timeout: Duration::from_millis(1000),
        }
    }
}

inventory::submit! { metrics::Registration::new("background.processor.tasks.completed", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("background.processor.tasks.failed", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("background.processor.tasks.dead_lettered", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("background.processor.tasks.inflight", Sort::IntegralGauge) }

/// Record a task failure with `receiver`, counting the outcome
async fn fail<C, R: Receiver<C>>(
    receiver: &R,
    cookie: R::TaskId,
    instruments: &Instruments,
) -> Result<()> {
    counter_add!(instruments, "background.processor.tasks.failed", 1, &[]);
    if let Disposition::DeadLetter = receiver.mark_failed(cookie).await.context(FailureSnafu)? {
        counter_add!(instruments, "background.processor.tasks.dead_lettered", 1, &[]);
    }
    Ok(())
}

/// Process background tasks. `receiver` is a [Receiver] from which we can draw tasks. `config`
/// holds configuration parameters for the algorithm. `shutdown` is a [Notify] instance the caller
/// can use to signal this function to exit.
async fn process<C: Clone + Send + 'static, R: Receiver<C> + Sync>(
    receiver: R,
    context: C,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    // The tokio task ID for each task we're driving, mapped to its cookie...
    let mut tasks: HashMap<Id, R::TaskId> = HashMap::new();
    // & the tasks themselves:
    let mut futures = JoinSet::new();
    let mut done = false;
    while !done {
        // so long as we don't have too much on our plate, try 'n grab another task:
        if futures.len() < config.max_concurrent_tasks {
            if let Some((task, cookie)) = receiver.take_task().await.context(TakeSnafu)? {
                let id = futures
                    .spawn(tokio::time::timeout(
                        task.timeout().unwrap_or(config.default_timeout),
                        task.exec(context.clone()),
                    ))
                    .id();
                tasks.insert(id, cookie);
            }
        }

        gauge_setu!(
            instruments,
            "background.processor.tasks.inflight",
            futures.len() as u64,
            &[]
        );

        if !futures.is_empty() {
            // We've got at least one task; drive 'em all forward, while waiting on our shutdown
            // notification:
            tokio::select! {
                result = futures.join_next_with_id() => {
                    match result {
                        Some(Ok((id, Ok(Ok(()))))) => {
                            let cookie = tasks.remove(&id).context(TaskIdSnafu)?;
                            receiver.mark_complete(cookie).await.context(CompletionSnafu)?;
                            counter_add!(instruments, "background.processor.tasks.completed", 1, &[]);
                        },
                        Some(Ok((id, Ok(Err(err))))) => {
                            warn!("Background task failed: {}", err);
                            let cookie = tasks.remove(&id).context(TaskIdSnafu)?;
                            fail::<C, R>(&receiver, cookie, &instruments).await?;
                        },
                        Some(Ok((id, Err(elapsed)))) => {
                            warn!("Background task timed-out: {}", elapsed);
                            let cookie = tasks.remove(&id).context(TaskIdSnafu)?;
                            fail::<C, R>(&receiver, cookie, &instruments).await?;
                        },
                        Some(Err(err)) => {
                            // The task panicked (or was cancelled); that's a failure of the task,
                            // not of the processor.
                            error!("Background task failed to run to completion: {}", err);
                            let cookie = tasks.remove(&err.id()).context(TaskIdSnafu)?;
                            fail::<C, R>(&receiver, cookie, &instruments).await?;
                        },
                        None => unimplemented!(), // Precluded by `.is_empty()`, above.
                    }
                },
                // A single long-running task could otherwise keep us here while others pile-up
                // in the queue; stop periodically to pick-up new tasks.
                _ = tokio::time::sleep(config.pickup_timeout) => (),
                _ = shutdown.notified()=> {
                    done = true;
                }
            }
        } else {
            // We have no tasks; hang out a bit before attempting to pick-up a task, while remaining
            // mindful of our shutdown notification:
            tokio::select! {
                _ = tokio::time::sleep(config.sleep_duration) => (),
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        }
    } // End processing loop.

    // Give any in-flight tasks a chance to complete; those that don't will be re-leased once their
    // leases lapse.
    tokio::time::timeout(config.shutdown_timeout, futures.join_all())
        .await
        .context(TimeoutSnafu)?;

    Ok(())
}

/// Create a new [Processor] given a [Receiver].
pub fn new<C: Clone + Send + 'static, R: Receiver<C> + Send + Sync + 'static>(
    receiver: R,
    context: C,
    config: Option<Config>,
    instruments: Arc<Instruments>,
) -> std::result::Result<Processor, Error> {
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(
        receiver,
        context,
        config.unwrap_or_default(),
        shutdown.clone(),
        instruments,
    ));
    Ok(Processor {
        processor,
        shutdown,
    })
}

// Pressure-test the processing loop with mock implementations of the traits defined so far
#[cfg(test)]
mod mock {

    use std::{
        collections::HashSet,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;

    #[derive(Clone, Debug, Serialize)]
    struct SleepTask {
        pub duration: Duration,
    }

    #[async_trait]
    impl Task<()> for SleepTask {
        async fn exec(self: Box<Self>, _: ()) -> Result<()> {
            Ok(tokio::time::sleep(self.duration).await)
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(10))
        }
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("nope"))]
    struct Nope;

    struct FailingTask;

    #[async_trait]
    impl Task<()> for FailingTask {
        async fn exec(self: Box<Self>, _: ()) -> Result<()> {
            Err(Error::new(Nope))
        }
        fn timeout(&self) -> Option<Duration> {
            None
        }
    }

    #[derive(Default)]
    struct InMemory {
        pub tasks: Mutex<HashMap<Uuid, Box<dyn Task<()>>>>,
        pub checkouts: Mutex<HashSet<Uuid>>,
        pub completed: AtomicUsize,
        pub failed: AtomicUsize,
    }

    #[async_trait]
    impl Receiver<()> for InMemory {
        type TaskId = Uuid;
        async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
            assert!(self.checkouts.lock().unwrap().remove(&cookie));
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn mark_failed(&self, cookie: Self::TaskId) -> Result<Disposition> {
            assert!(self.checkouts.lock().unwrap().remove(&cookie));
            self.failed.fetch_add(1, Ordering::SeqCst);
            Ok(Disposition::DeadLetter)
        }
        async fn take_task(&self) -> Result<Option<(Box<dyn Task<()>>, Self::TaskId)>> {
            let mut m = self.tasks.lock().unwrap();
            let key = { m.keys().next().cloned() };
            match key {
                Some(key) => {
                    let task = m.remove(&key).unwrap();
                    self.checkouts.lock().unwrap().insert(key);
                    Ok(Some((task, key)))
                }
                None => Ok(None),
            }
        }
    }

    #[async_trait]
    impl<T: Task<()> + 'static> Sender<(), T> for InMemory {
        async fn send(&self, task: T) -> Result<()> {
            self.tasks
                .lock()
                .unwrap()
                .insert(Uuid::new_v4(), Box::new(task));
            Ok(())
        }
    }

    // Exercise the bare bones of the system
    #[tokio::test]
    async fn bare_bones() {
        let backend = InMemory::default();
        backend
            .send(SleepTask {
                duration: Duration::from_millis(250),
            })
            .await
            .unwrap();
        let shutdown = Arc::new(Notify::new());

        let backend = Arc::new(backend);
        let handle = tokio::task::spawn(process(
            backend.clone(),
            (),
            Config::default(),
            shutdown.clone(),
            Arc::new(Instruments::new("computility")),
        ));
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(backend.completed.load(Ordering::SeqCst), 1);
    }

    // Exercise Sender & Receiver, with a failure mixed in
    #[tokio::test]
    async fn send_and_receive() {
        let sender = Arc::new(InMemory::default());
        let receiver = sender.clone();
        let processor = new(
            receiver,
            (),
            Some(Config {
                // Slightly longer than the longest task, below, in case that task has just gotten
                // started when the shutdown signal arrives.
                shutdown_timeout: Duration::from_millis(800),
                sleep_duration: Duration::from_millis(100),
                ..Default::default()
            }),
            Arc::new(Instruments::new("computility")),
        )
        .unwrap();

        for millis in [250, 500, 350] {
            sender
                .send(SleepTask {
                    duration: Duration::from_millis(millis),
                })
                .await
                .unwrap();
        }
        sender.send(FailingTask).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let result = processor.shutdown(Duration::from_secs(5)).await;
        assert!(result.is_ok());
        assert_eq!(sender.completed.load(Ordering::SeqCst), 3);
        assert_eq!(sender.failed.load(Ordering::SeqCst), 1);
    }
}

/// Everything a background task might need
#[derive(Clone)]
pub struct Context {
    pub publisher: Arc<dyn Publisher + Send + Sync>,
    pub topics: Topics,
}

/// In order to "register" a background task type, you need to assign a tag (a [Uuid]), and a
/// function that "knows" how to deserialize a [MessagePack] serialization of a task of this type.
///
/// [MessagePack]: https://msgpack.org/
// No centralized registry of task types; Tolnay's [inventory] crate collects them.
pub struct BackgroundTask {
    pub id: Uuid,
    #[allow(clippy::type_complexity)]
    pub de: fn(&[u8]) -> Result<Box<dyn Task<Context>>>,
}

inventory::collect!(BackgroundTask);

/// A task checked-out of a [Backend]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeasedTask {
    pub tag: Uuid,
    pub id: Uuid,
    pub buf: Vec<u8>,
    /// Attempts to date, including this one
    pub attempts: i32,
}

/// Object-safe trait abstracting over datastores for the operations required by
/// [BackgroundTasks]
#[async_trait]
pub trait Backend {
    async fn write_task(&self, tag: &Uuid, buf: &[u8]) -> Result<()>;
    /// Check-out the oldest task that is neither done nor dead-lettered & whose lease has lapsed,
    /// leasing it for `lease` & counting an attempt
    async fn lease_task(&self, lease: Duration) -> Result<Option<LeasedTask>>;
    async fn close_task(&self, uuid: &Uuid) -> Result<()>;
    /// Release a failed task so that it may be leased again after `retry_at`; `None` means it
    /// should be dead-lettered.
    async fn fail_task(&self, uuid: &Uuid, retry_at: Option<DateTime<Utc>>) -> Result<()>;
    /// Tasks that have been dead-lettered
    async fn dead_letters(&self) -> Result<Vec<FlatTask>>;
}

/// How hard to try
#[derive(Clone, Debug, Deserialize)]
pub struct RetryPolicy {
    /// A task that has failed this many times is dead-lettered
    #[serde(rename = "max-attempts")]
    pub max_attempts: i32,
    /// Delay before the first retry; doubled on each subsequent retry
    #[serde(rename = "initial-backoff")]
    pub initial_backoff: Duration,
    #[serde(rename = "max-backoff")]
    pub max_backoff: Duration,
    /// Must comfortably exceed the longest task timeout
    #[serde(rename = "lease-duration")]
    pub lease_duration: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 8,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            lease_duration: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// How long to wait after the `attempts`th failure
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exp = attempts.saturating_sub(1).clamp(0, 30) as u32;
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_backoff)
    }
}

/// The [computility] background task queue.
///
/// [computility]: crate
pub struct BackgroundTasks {
    storage: Arc<dyn Backend + Send + Sync>,
    policy: RetryPolicy,
}

impl BackgroundTasks {
    pub fn new(storage: Arc<dyn Backend + Send + Sync>, policy: RetryPolicy) -> BackgroundTasks {
        BackgroundTasks { storage, policy }
    }
}

#[async_trait]
impl<T> Sender<Context, T> for BackgroundTasks
where
    T: TaggedTask<Context, Tag = Uuid> + Serialize + 'static,
{
    /// Task can be serialized; serialize to MessagePack, then write to a dedicated table
    async fn send(&self, task: T) -> Result<()> {
        let tag = T::get_tag();
        let buf = to_vec(&task).context(TaskSerSnafu)?;
        self.storage.write_task(&tag, &buf).await
    }
}

#[async_trait]
impl Receiver<Context> for BackgroundTasks {
    /// Task ID & the number of attempts made so far
    type TaskId = (Uuid, i32);
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
        self.storage.close_task(&cookie.0).await
    }
    async fn mark_failed(&self, cookie: Self::TaskId) -> Result<Disposition> {
        let (id, attempts) = cookie;
        if attempts >= self.policy.max_attempts {
            error!(
                "Background task {} has failed {} times; dead-lettering it",
                id, attempts
            );
            self.storage.fail_task(&id, None).await?;
            Ok(Disposition::DeadLetter)
        } else {
            let retry_at = Utc::now()
                + TimeDelta::from_std(self.policy.backoff(attempts))
                    .unwrap_or(TimeDelta::seconds(1));
            self.storage.fail_task(&id, Some(retry_at)).await?;
            Ok(Disposition::Retry(retry_at))
        }
    }
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<Context>>, Self::TaskId)>> {
        let Some(leased) = self.storage.lease_task(self.policy.lease_duration).await? else {
            return Ok(None);
        };
        let task = inventory::iter::<BackgroundTask>()
            .find(|t| t.id == leased.tag)
            .context(IdSnafu { uuid: leased.tag })
            .and_then(|t| (t.de)(&leased.buf));
        match task {
            Ok(task) => Ok(Some((task, (leased.id, leased.attempts)))),
            Err(err) => {
                // Retrying won't help a task we can't even read.
                error!(
                    "Failed to materialize background task {}: {}; dead-lettering it",
                    leased.id, err
                );
                self.storage.fail_task(&leased.id, None).await?;
                Ok(None)
            }
        }
    }
}

/// A task as represented in the computility backends
#[derive(Clone, Debug, Deserialize, DeserializeRow, Eq, PartialEq, Serialize, sqlx::FromRow)]
pub struct FlatTask {
    pub id: Uuid,
    pub created: DateTime<Utc>,
    pub task: Vec<u8>,
    pub tag: Uuid,
    pub lease_expires: DateTime<Utc>,
    pub attempts: i32,
    pub done: bool,
    pub dead: bool,
}

impl FlatTask {
    pub fn new(tag: &Uuid, buf: &[u8]) -> FlatTask {
        let now = Utc::now();
        FlatTask {
            id: Uuid::new_v4(),
            created: now,
            task: buf.to_vec(),
            tag: *tag,
            lease_expires: now,
            attempts: 0,
            done: false,
            dead: false,
        }
    }
    /// When will a lease of length `lease`, taken at `now`, expire?
    pub fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
        TimeDelta::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
    /// May this task be leased at time `now`?
    pub fn is_available(&self, now: &DateTime<Utc>) -> bool {
        !self.done && !self.dead && self.lease_expires <= *now
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{memory::Memory, publisher::MemoryPublisher};

    use std::sync::atomic::{AtomicUsize, Ordering};

    static RUNS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Debug, Deserialize, Serialize)]
    struct FlakyTask {
        pub failures: usize,
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("flaky"))]
    struct Flaky;

    #[async_trait]
    impl Task<Context> for FlakyTask {
        async fn exec(self: Box<Self>, _context: Context) -> Result<()> {
            if RUNS.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(Error::new(Flaky))
            } else {
                Ok(())
            }
        }
        fn timeout(&self) -> Option<Duration> {
            None
        }
    }

    const FLAKY_TASK: Uuid = Uuid::from_fields(
        0xaa27434b,
        0x838b,
        0x43f3,
        &[0xb6, 0xca, 0x43, 0xe6, 0x63, 0x0f, 0xf8, 0x6a],
    );

    impl TaggedTask<Context> for FlakyTask {
        type Tag = Uuid;
        fn get_tag() -> Self::Tag {
            FLAKY_TASK
        }
    }

    inventory::submit! {
        BackgroundTask {
            id: FLAKY_TASK,
            de: |buf| { Ok(Box::new(rmp_serde::from_slice::<FlakyTask>(buf).context(DeSnafu)?)) }
        }
    }

    #[test]
    fn registered() {
        assert!(
            inventory::iter::<BackgroundTask>()
                .find(|t| t.id == FLAKY_TASK)
                .is_some()
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            lease_duration: Duration::from_secs(60),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
        assert_eq!(policy.backoff(40), Duration::from_secs(5));
    }

    // Drive one flaky task through the receiver by hand: it fails twice (& is rescheduled each
    // time), then succeeds on the third attempt.
    #[tokio::test]
    async fn retried_until_success() {
        let storage = Arc::new(Memory::new());
        let tasks = BackgroundTasks::new(
            storage.clone(),
            RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
                lease_duration: Duration::from_secs(60),
            },
        );
        let context = Context {
            publisher: Arc::new(MemoryPublisher::new()),
            topics: Topics::default(),
        };
        RUNS.store(0, Ordering::SeqCst);
        tasks.send(FlakyTask { failures: 2 }).await.unwrap();

        for expected_attempts in 1..=2 {
            let (task, cookie) = tasks.take_task().await.unwrap().unwrap();
            assert_eq!(cookie.1, expected_attempts);
            assert!(task.exec(context.clone()).await.is_err());
            assert!(matches!(
                tasks.mark_failed(cookie).await.unwrap(),
                Disposition::Retry(_)
            ));
        }
        let (task, cookie) = tasks.take_task().await.unwrap().unwrap();
        assert_eq!(cookie.1, 3);
        assert!(task.exec(context.clone()).await.is_ok());
        tasks.mark_complete(cookie).await.unwrap();

        assert!(tasks.take_task().await.unwrap().is_none());
        assert!(storage.dead_letters().await.unwrap().is_empty());
    }

    // A task that never succeeds is dead-lettered after `max_attempts`
    #[tokio::test]
    async fn dead_lettered() {
        let storage = Arc::new(Memory::new());
        let tasks = BackgroundTasks::new(
            storage.clone(),
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
                lease_duration: Duration::from_secs(60),
            },
        );
        tasks.send(FlakyTask { failures: usize::MAX }).await.unwrap();

        for _ in 0..2 {
            let (_, cookie) = tasks.take_task().await.unwrap().unwrap();
            assert!(matches!(
                tasks.mark_failed(cookie).await.unwrap(),
                Disposition::Retry(_)
            ));
        }
        let (_, cookie) = tasks.take_task().await.unwrap().unwrap();
        assert_eq!(
            tasks.mark_failed(cookie).await.unwrap(),
            Disposition::DeadLetter
        );

        assert!(tasks.take_task().await.unwrap().is_none());
        let dead = storage.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].tag, FLAKY_TASK);
        assert_eq!(dead[0].attempts, 3);
    }

    // Tasks whose tag nobody registered go straight to the dead-letter pile
    #[tokio::test]
    async fn unknown_tags_are_dead_lettered() {
        let storage = Arc::new(Memory::new());
        let tasks = BackgroundTasks::new(storage.clone(), RetryPolicy::default());
        storage
            .write_task(&Uuid::new_v4(), b"garbage")
            .await
            .unwrap();
        assert!(tasks.take_task().await.unwrap().is_none());
        assert_eq!(storage.dead_letters().await.unwrap().len(), 1);
    }
}
