//! Single-flight background recomputation of a published value
//!
//! [`Refreshable::refresh`] records the latest desired computation. At most
//! one computation runs at a time; a computation superseded by a newer
//! `refresh` call still runs to completion, but its result is discarded. Only
//! the result of the most recently requested computation is ever published,
//! and publishing always happens on the [`DeliveryContext`].
//!
//! Values that are computed but never published, and published values that
//! are replaced or dropped on close, are handed to the unpublish callback so
//! their owner can release them.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;

use crate::delivery::{invoke_guarded, DeliveryContext};
use devwatch_core::prelude::*;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
type Computation<T> = Box<dyn FnOnce(Request<T>) -> BoxFuture<Result<Option<T>>> + Send>;
type PublishListener<T> = Box<dyn FnOnce(Option<T>) + Send>;

/// Releases a value that is no longer (or never was) published
pub type Unpublish<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Called on every state transition and every publish
pub type StateListener = Arc<dyn Fn() + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    Busy,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Tells a computation whether its result is still wanted
#[derive(Clone)]
pub struct CancellationToken {
    id: u64,
    latest: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl CancellationToken {
    /// True once a newer request was made or the cache was closed
    pub fn is_cancelled(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.latest.load(Ordering::SeqCst) != self.id
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// What a computation gets to work with
pub struct Request<T> {
    token: CancellationToken,
    previous: Option<T>,
}

impl<T> Request<T> {
    pub fn id(&self) -> u64 {
        self.token.id
    }

    /// The value published when this computation started
    pub fn previous(&self) -> Option<&T> {
        self.previous.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

struct Scheduled<T> {
    id: u64,
    computation: Computation<T>,
}

struct Publisher<T> {
    published: Option<T>,
    /// Computed for request `.0`, waiting to be published
    scheduled: Option<(u64, Option<T>)>,
    /// Value released by `close`
    retired: Option<T>,
}

struct Shared<T> {
    delivery: DeliveryContext,
    unpublish: Option<Unpublish<T>>,
    pending: Mutex<Option<Scheduled<T>>>,
    publisher: Mutex<Publisher<T>>,
    busy: AtomicBool,
    latest: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    state_tx: watch::Sender<RefreshState>,
    initialized_tx: watch::Sender<bool>,
    listeners: Mutex<Vec<(ListenerId, StateListener)>>,
    publish_listeners: Mutex<Vec<PublishListener<T>>>,
    next_listener: AtomicU64,
}

/// A value recomputed in the background and published on the delivery context
pub struct Refreshable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Refreshable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Refreshable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(delivery: DeliveryContext) -> Self {
        Self::build(delivery, None)
    }

    /// A cache whose dropped values are passed to `unpublish`
    pub fn with_unpublish<F>(delivery: DeliveryContext, unpublish: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::build(delivery, Some(Arc::new(unpublish)))
    }

    fn build(delivery: DeliveryContext, unpublish: Option<Unpublish<T>>) -> Self {
        let (state_tx, _) = watch::channel(RefreshState::Idle);
        let (initialized_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                delivery,
                unpublish,
                pending: Mutex::new(None),
                publisher: Mutex::new(Publisher {
                    published: None,
                    scheduled: None,
                    retired: None,
                }),
                busy: AtomicBool::new(false),
                latest: Arc::new(AtomicU64::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
                state_tx,
                initialized_tx,
                listeners: Mutex::new(Vec::new()),
                publish_listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// Request a recomputation.
    ///
    /// `Ok(Some(v))` publishes `v`, `Ok(None)` publishes "no value", and an
    /// error leaves the published value alone. [`Error::Cancelled`] is dropped
    /// silently; other errors are logged.
    pub fn refresh<F, Fut>(&self, compute: F)
    where
        F: FnOnce(Request<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        if self.is_closed() {
            debug!("refresh() after close ignored");
            return;
        }

        {
            let mut pending = lock(&self.shared.pending);
            let id = self.shared.latest.fetch_add(1, Ordering::SeqCst) + 1;
            *pending = Some(Scheduled {
                id,
                computation: Box::new(move |request| Box::pin(compute(request))),
            });
        }

        if !self.shared.busy.swap(true, Ordering::SeqCst) {
            tokio::spawn(Shared::run_worker(Arc::clone(&self.shared)));
        }
    }

    /// Last published value, without waiting
    pub fn get_now(&self) -> Option<T> {
        lock(&self.shared.publisher).published.clone()
    }

    /// Wait for the first publish (or close), then return the latest value
    pub async fn get_when_ready(&self) -> Option<T> {
        let mut rx = self.shared.initialized_tx.subscribe();
        let _ = rx.wait_for(|initialized| *initialized).await;
        self.get_now()
    }

    pub fn state(&self) -> RefreshState {
        *self.shared.state_tx.borrow()
    }

    /// True while a worker is running or about to run
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<RefreshState> {
        self.shared.state_tx.subscribe()
    }

    /// Register a listener for state transitions and publishes
    pub fn subscribe<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.listeners).push((id, Arc::new(listener)));
        Ok(id)
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        lock(&self.shared.listeners).retain(|(existing, _)| *existing != id);
    }

    /// Call `listener` once, with the next value that gets published
    pub fn when_published<F>(&self, listener: F)
    where
        F: FnOnce(Option<T>) + Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        lock(&self.shared.publish_listeners).push(Box::new(listener));
    }

    /// Stop refreshing and release every value. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing refreshable");

        lock(&self.shared.pending).take();
        let (scheduled, published) = {
            let mut publisher = lock(&self.shared.publisher);
            let scheduled = publisher.scheduled.take().and_then(|(_, v)| v);
            let published = publisher.published.take();
            publisher.retired = published.clone();
            (scheduled, published)
        };

        if let Some(value) = scheduled {
            if published.as_ref() != Some(&value) {
                self.shared.release(value);
            }
        }
        if let Some(value) = published {
            self.shared.release(value);
        }

        self.shared.state_tx.send_replace(RefreshState::Closed);
        self.shared.initialized_tx.send_replace(true);

        let shared = Arc::clone(&self.shared);
        self.shared.delivery.invoke_later(move || {
            shared.notify_listeners();
            lock(&shared.listeners).clear();
            lock(&shared.publish_listeners).clear();
        });
    }
}

impl<T> Shared<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    async fn run_worker(shared: Arc<Self>) {
        loop {
            let next = lock(&shared.pending).take();
            let Some(scheduled) = next else {
                shared.publish_async(true);
                shared.set_state(RefreshState::Idle);
                shared.busy.store(false, Ordering::SeqCst);
                // A refresh() may have queued work after the take above
                if lock(&shared.pending).is_some() && !shared.busy.swap(true, Ordering::SeqCst) {
                    continue;
                }
                return;
            };

            shared.set_state(RefreshState::Busy);
            let request = Request {
                token: CancellationToken {
                    id: scheduled.id,
                    latest: Arc::clone(&shared.latest),
                    closed: Arc::clone(&shared.closed),
                },
                previous: lock(&shared.publisher).published.clone(),
            };

            match tokio::spawn((scheduled.computation)(request)).await {
                Ok(Ok(value)) => shared.offer(scheduled.id, value),
                Ok(Err(e)) if e.is_cancellation() => {
                    trace!("Refresh #{} cancelled", scheduled.id);
                }
                Ok(Err(e)) => warn!("Refresh #{} failed: {}", scheduled.id, e),
                Err(e) => warn!("Refresh #{} panicked: {}", scheduled.id, e),
            }
        }
    }

    /// Take a freshly computed value for request `id`
    fn offer(self: &Arc<Self>, id: u64, value: Option<T>) {
        if self.closed.load(Ordering::SeqCst) || self.latest.load(Ordering::SeqCst) != id {
            trace!("Discarding result of obsolete refresh #{}", id);
            self.discard(value);
            return;
        }

        let replaced = lock(&self.publisher).scheduled.replace((id, value));
        if let Some((_, old)) = replaced {
            self.discard(old);
        }
        self.publish_async(false);
    }

    /// Release `value` unless it is still in use
    fn discard(&self, value: Option<T>) {
        let Some(value) = value else {
            return;
        };
        let in_use = {
            let publisher = lock(&self.publisher);
            publisher.published.as_ref() == Some(&value)
                || publisher.retired.as_ref() == Some(&value)
                || matches!(&publisher.scheduled, Some((_, Some(v))) if *v == value)
        };
        if !in_use {
            self.release(value);
        }
    }

    fn release(&self, value: T) {
        if let Some(unpublish) = &self.unpublish {
            let unpublish = Arc::clone(unpublish);
            invoke_guarded("unpublish", move || unpublish(value));
        }
    }

    fn publish_async(self: &Arc<Self>, flush: bool) {
        let shared = Arc::clone(self);
        self.delivery.invoke_later(move || shared.publish_now(flush));
    }

    /// Runs on the delivery context.
    ///
    /// Publishes the scheduled value if no newer request exists. With `flush`,
    /// a scheduled value that lost to a newer request is released instead of
    /// being left waiting.
    fn publish_now(&self, flush: bool) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let latest = self.latest.load(Ordering::SeqCst);
        let (old, new) = {
            let mut publisher = lock(&self.publisher);
            match publisher.scheduled.take() {
                None => return,
                Some((id, value)) if id != latest => {
                    if flush {
                        drop(publisher);
                        self.discard(value);
                    } else {
                        publisher.scheduled = Some((id, value));
                    }
                    return;
                }
                Some((_, value)) => {
                    if publisher.published == value {
                        drop(publisher);
                        self.initialized_tx.send_replace(true);
                        return;
                    }
                    let old = std::mem::replace(&mut publisher.published, value.clone());
                    (old, value)
                }
            }
        };

        self.initialized_tx.send_replace(true);
        self.notify_listeners();

        let once: Vec<_> = lock(&self.publish_listeners).drain(..).collect();
        for listener in once {
            let value = new.clone();
            invoke_guarded("publish listener", move || listener(value));
        }

        if let Some(old) = old {
            self.release(old);
        }
    }

    fn set_state(self: &Arc<Self>, next: RefreshState) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            let shared = Arc::clone(self);
            self.delivery.invoke_later(move || shared.notify_listeners());
        }
    }

    fn notify_listeners(&self) {
        let listeners: Vec<StateListener> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            invoke_guarded("refreshable listener", || listener());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn settle<T>(cache: &Refreshable<T>, ctx: &DeliveryContext)
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        for _ in 0..2000 {
            if !cache.is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        ctx.flush().await;
    }

    fn recording_cache(
        ctx: &DeliveryContext,
    ) -> (Refreshable<String>, Arc<Mutex<Vec<String>>>) {
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        let cache = Refreshable::with_unpublish(ctx.clone(), move |v: String| {
            sink.lock().unwrap().push(v)
        });
        (cache, released)
    }

    #[tokio::test]
    async fn test_publishes_result() {
        let ctx = DeliveryContext::spawn();
        let cache: Refreshable<u32> = Refreshable::new(ctx.clone());
        assert_eq!(cache.get_now(), None);

        cache.refresh(|_| async { Ok(Some(7)) });
        assert_eq!(cache.get_when_ready().await, Some(7));
        settle(&cache, &ctx).await;
        assert_eq!(cache.state(), RefreshState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_computation_in_flight() {
        let ctx = DeliveryContext::spawn();
        let cache: Refreshable<usize> = Refreshable::new(ctx.clone());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut callers = Vec::new();
        for i in 0..20 {
            let cache = cache.clone();
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            callers.push(tokio::spawn(async move {
                cache.refresh(move |_| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Some(i))
                });
            }));
        }
        for caller in callers {
            caller.await.unwrap();
        }
        settle(&cache, &ctx).await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(cache.get_now().is_some());
    }

    #[tokio::test]
    async fn test_latest_request_wins() {
        let ctx = DeliveryContext::spawn();
        let (cache, released) = recording_cache(&ctx);
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let saw_cancel = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&saw_cancel);
        cache.refresh(move |request| async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            flag.store(request.is_cancelled(), Ordering::SeqCst);
            Ok(Some("A".to_string()))
        });
        started_rx.await.unwrap();

        cache.refresh(|_| async { Ok(Some("B".to_string())) });
        release_tx.send(()).unwrap();
        settle(&cache, &ctx).await;

        assert!(saw_cancel.load(Ordering::SeqCst));
        assert_eq!(cache.get_now().as_deref(), Some("B"));
        assert_eq!(*released.lock().unwrap(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_failures_keep_previous_value() {
        let ctx = DeliveryContext::spawn();
        let cache: Refreshable<u32> = Refreshable::new(ctx.clone());
        cache.refresh(|_| async { Ok(Some(1)) });
        settle(&cache, &ctx).await;

        cache.refresh(|_| async { Err(Error::protocol("bad line")) });
        settle(&cache, &ctx).await;
        assert_eq!(cache.get_now(), Some(1));

        cache.refresh(|_| async { Err(Error::Cancelled) });
        settle(&cache, &ctx).await;
        assert_eq!(cache.get_now(), Some(1));

        cache.refresh(|_| async {
            let missing: Option<u32> = None;
            let value = missing.expect("computation bug");
            Ok(Some(value))
        });
        settle(&cache, &ctx).await;
        assert_eq!(cache.get_now(), Some(1));
    }

    #[tokio::test]
    async fn test_previous_value_is_visible() {
        let ctx = DeliveryContext::spawn();
        let cache: Refreshable<u32> = Refreshable::new(ctx.clone());
        cache.refresh(|_| async { Ok(Some(1)) });
        settle(&cache, &ctx).await;

        let (tx, rx) = oneshot::channel();
        cache.refresh(move |request| {
            let previous = request.previous().copied();
            async move {
                let _ = tx.send(previous);
                Ok(previous.map(|p| p + 1))
            }
        });
        assert_eq!(rx.await.unwrap(), Some(1));
        settle(&cache, &ctx).await;
        assert_eq!(cache.get_now(), Some(2));
    }

    #[tokio::test]
    async fn test_equal_value_is_not_republished() {
        let ctx = DeliveryContext::spawn();
        let (cache, released) = recording_cache(&ctx);
        cache.refresh(|_| async { Ok(Some("same".to_string())) });
        settle(&cache, &ctx).await;

        let publishes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&publishes);
        cache.when_published(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.refresh(|_| async { Ok(Some("same".to_string())) });
        settle(&cache, &ctx).await;
        assert_eq!(publishes.load(Ordering::SeqCst), 0);
        assert!(released.lock().unwrap().is_empty());

        cache.refresh(|_| async { Ok(Some("new".to_string())) });
        settle(&cache, &ctx).await;
        assert_eq!(publishes.load(Ordering::SeqCst), 1);
        assert_eq!(*released.lock().unwrap(), vec!["same".to_string()]);
    }

    #[tokio::test]
    async fn test_publishing_none_releases_value() {
        let ctx = DeliveryContext::spawn();
        let (cache, released) = recording_cache(&ctx);
        cache.refresh(|_| async { Ok(Some("daemon".to_string())) });
        settle(&cache, &ctx).await;

        cache.refresh(|_| async { Ok(None) });
        settle(&cache, &ctx).await;
        assert_eq!(cache.get_now(), None);
        assert_eq!(*released.lock().unwrap(), vec!["daemon".to_string()]);
    }

    #[tokio::test]
    async fn test_listeners_see_transitions_and_publishes() {
        let ctx = DeliveryContext::spawn();
        let cache: Refreshable<u32> = Refreshable::new(ctx.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = cache
            .subscribe(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        cache.refresh(|_| async { Ok(Some(3)) });
        settle(&cache, &ctx).await;
        // Busy, publish, Idle
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        cache.unsubscribe(id);
        cache.refresh(|_| async { Ok(Some(4)) });
        settle(&cache, &ctx).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_block_others() {
        let ctx = DeliveryContext::spawn();
        let cache: Refreshable<u32> = Refreshable::new(ctx.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        cache.subscribe(|| panic!("bad listener")).unwrap();
        let counter = Arc::clone(&calls);
        cache
            .subscribe(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        cache.refresh(|_| async { Ok(Some(1)) });
        settle(&cache, &ctx).await;
        assert!(calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_close_releases_and_is_idempotent() {
        let ctx = DeliveryContext::spawn();
        let (cache, released) = recording_cache(&ctx);
        cache.refresh(|_| async { Ok(Some("current".to_string())) });
        settle(&cache, &ctx).await;

        let closed_seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed_seen);
        let observer = cache.clone();
        cache
            .subscribe(move || {
                if observer.state() == RefreshState::Closed {
                    flag.store(true, Ordering::SeqCst);
                }
            })
            .unwrap();

        cache.close();
        cache.close();
        ctx.flush().await;

        assert_eq!(cache.state(), RefreshState::Closed);
        assert_eq!(cache.get_now(), None);
        assert_eq!(*released.lock().unwrap(), vec!["current".to_string()]);
        assert!(closed_seen.load(Ordering::SeqCst));
        assert!(cache.subscribe(|| {}).is_err());

        cache.refresh(|_| async { Ok(Some("late".to_string())) });
        assert!(!cache.is_busy());
    }

    #[tokio::test]
    async fn test_get_when_ready_returns_on_close() {
        let ctx = DeliveryContext::spawn();
        let cache: Refreshable<u32> = Refreshable::new(ctx.clone());
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_when_ready().await })
        };
        tokio::task::yield_now().await;
        cache.close();
        let value = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_in_flight_result_after_close_is_released() {
        let ctx = DeliveryContext::spawn();
        let (cache, released) = recording_cache(&ctx);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel();
        cache.refresh(move |_| async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(Some("orphan".to_string()))
        });
        started_rx.await.unwrap();

        cache.close();
        release_tx.send(()).unwrap();
        settle(&cache, &ctx).await;

        assert_eq!(*released.lock().unwrap(), vec!["orphan".to_string()]);
        assert_eq!(cache.get_now(), None);
    }
}
