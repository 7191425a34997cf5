//! Fans Service watch events out to registered handlers.
//!
//! Handlers are registered by name before the watch is consumed. They are wired in a
//! single pass once the initial list of Services has been cached, at which point each
//! handler receives an `Add` for every cached Service, then the live deltas.

use std::{collections::BTreeMap, mem, pin::pin, sync::Arc};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::{ResourceExt, runtime::watcher};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

const EVENT_BUFFER: usize = 1024;

type ServiceKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Add(Arc<Service>),
    Update { old: Arc<Service>, new: Arc<Service> },
    Delete(Arc<Service>),
}

impl ServiceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServiceEvent::Add(_) => EventKind::Add,
            ServiceEvent::Update { .. } => EventKind::Update,
            ServiceEvent::Delete(_) => EventKind::Delete,
        }
    }
}

#[async_trait]
pub trait ServiceEventHandler: Send + Sync {
    async fn on_add(&self, service: Arc<Service>);
    async fn on_update(&self, old: Arc<Service>, new: Arc<Service>);
    async fn on_delete(&self, service: Arc<Service>);
}

async fn deliver(handler: &dyn ServiceEventHandler, event: ServiceEvent) {
    match event {
        ServiceEvent::Add(service) => handler.on_add(service).await,
        ServiceEvent::Update { old, new } => handler.on_update(old, new).await,
        ServiceEvent::Delete(service) => handler.on_delete(service).await,
    }
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: BTreeMap<String, Arc<dyn ServiceEventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. Names are unique; registering a taken name fails.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ServiceEventHandler>,
    ) -> Result<()> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(Error::HandlerConflict(name));
        }
        debug!("registered Service event handler {name}");
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Consumes the watch stream until it ends or `cancel` fires.
    ///
    /// `synced` is cancelled once the initial list has been cached and the handlers wired.
    pub async fn run<S>(
        self,
        events: S,
        synced: CancellationToken,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: Stream<Item = std::result::Result<watcher::Event<Service>, watcher::Error>> + Send,
    {
        let mut pending = Some(self.handlers);
        let mut listeners: Option<Listeners> = None;
        let mut cache = ServiceCache::default();
        let mut events = pin!(events);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(listeners) = listeners.take() {
                        listeners.abort().await;
                    }
                    return Ok(());
                }
                next = events.next() => next,
            };
            let Some(event) = next else {
                break;
            };
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!(%e, "Service watch failed");
                    continue;
                }
            };

            let mut deltas = cache.apply(event);
            let mut first_sync = false;
            if let Some(handlers) = pending.take_if(|_| cache.is_synced()) {
                info!(
                    "Service cache synced with {} object(s), enabling {} handler(s)",
                    cache.len(),
                    handlers.len()
                );
                listeners = Some(Listeners::spawn(handlers));
                let replay = cache.services().into_iter().map(ServiceEvent::Add);
                deltas = replay.chain(deltas).collect();
                first_sync = true;
            }
            let delivered = match &listeners {
                Some(wired) => wired.send_all(deltas, &cancel).await,
                None => true,
            };
            if !delivered {
                if let Some(listeners) = listeners.take() {
                    listeners.abort().await;
                }
                return Ok(());
            }
            if first_sync {
                synced.cancel();
            }
        }

        if let Some(listeners) = listeners {
            listeners.drain().await;
        }
        info!("Service watch ended");
        Ok(())
    }
}

/// Local copy of the watched Services, used to turn watch events into Add/Update/Delete.
#[derive(Default)]
struct ServiceCache {
    objects: BTreeMap<ServiceKey, Arc<Service>>,
    /// Objects of a list in progress.
    relist: Option<BTreeMap<ServiceKey, Arc<Service>>>,
    synced: bool,
}

impl ServiceCache {
    fn is_synced(&self) -> bool {
        self.synced
    }

    fn len(&self) -> usize {
        self.objects.len()
    }

    fn services(&self) -> Vec<Arc<Service>> {
        self.objects.values().cloned().collect()
    }

    /// Applies a watch event and returns the deltas it produced. Nothing is produced
    /// until the first list completes.
    fn apply(&mut self, event: watcher::Event<Service>) -> Vec<ServiceEvent> {
        match event {
            watcher::Event::Init => {
                self.relist = Some(BTreeMap::new());
                vec![]
            }
            watcher::Event::InitApply(service) => {
                let service = Arc::new(service);
                self.relist
                    .get_or_insert_with(BTreeMap::new)
                    .insert(key(&service), service);
                vec![]
            }
            watcher::Event::InitDone => {
                let listed = self.relist.take().unwrap_or_default();
                let previous = mem::replace(&mut self.objects, listed);
                if !self.synced {
                    self.synced = true;
                    return vec![];
                }
                diff(previous, &self.objects)
            }
            watcher::Event::Apply(service) => {
                let service = Arc::new(service);
                let old = self.objects.insert(key(&service), service.clone());
                if !self.synced {
                    return vec![];
                }
                match old {
                    Some(old) => vec![ServiceEvent::Update { old, new: service }],
                    None => vec![ServiceEvent::Add(service)],
                }
            }
            watcher::Event::Delete(service) => {
                let service = Arc::new(service);
                self.objects.remove(&key(&service));
                if !self.synced {
                    return vec![];
                }
                vec![ServiceEvent::Delete(service)]
            }
        }
    }
}

fn key(service: &Service) -> ServiceKey {
    (service.namespace().unwrap_or_default(), service.name_any())
}

/// Deltas between the cache before and after a relist.
fn diff(
    mut previous: BTreeMap<ServiceKey, Arc<Service>>,
    current: &BTreeMap<ServiceKey, Arc<Service>>,
) -> Vec<ServiceEvent> {
    let mut deltas = Vec::new();
    for (key, service) in current {
        match previous.remove(key) {
            Some(old) => deltas.push(ServiceEvent::Update {
                old,
                new: service.clone(),
            }),
            None => deltas.push(ServiceEvent::Add(service.clone())),
        }
    }
    deltas.extend(previous.into_values().map(ServiceEvent::Delete));
    deltas
}

/// One task per handler, each fed in order from its own channel.
struct Listeners {
    senders: Vec<(String, mpsc::Sender<ServiceEvent>)>,
    tasks: JoinSet<()>,
}

impl Listeners {
    fn spawn(handlers: BTreeMap<String, Arc<dyn ServiceEventHandler>>) -> Self {
        let mut senders = Vec::with_capacity(handlers.len());
        let mut tasks = JoinSet::new();
        for (name, handler) in handlers {
            info!("enabling Service event handler {name}");
            let (tx, mut rx) = mpsc::channel::<ServiceEvent>(EVENT_BUFFER);
            tasks.spawn(async move {
                while let Some(event) = rx.recv().await {
                    deliver(handler.as_ref(), event).await;
                }
            });
            senders.push((name, tx));
        }
        Self { senders, tasks }
    }

    /// Queues every event for every handler. Returns false when `cancel` fires first.
    async fn send_all(&self, events: Vec<ServiceEvent>, cancel: &CancellationToken) -> bool {
        for event in events {
            for (name, tx) in &self.senders {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return false,
                    sent = tx.send(event.clone()) => {
                        if sent.is_err() {
                            error!(
                                "handler {name} stopped receiving {} events",
                                event.kind().as_str()
                            );
                        }
                    }
                }
            }
        }
        true
    }

    /// Closes the channels and waits for queued events to be handled.
    async fn drain(self) {
        let Listeners { senders, mut tasks } = self;
        drop(senders);
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(%e, "Service event handler task failed");
            }
        }
    }

    /// Stops the handler tasks without handling queued events.
    async fn abort(self) {
        let Listeners { senders, mut tasks } = self;
        drop(senders);
        tasks.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex, time::Duration};

    use futures::stream;
    use kube::api::ObjectMeta;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, kind: &str, service: &Service) {
            let (ns, name) = key(service);
            let version = service
                .labels()
                .get("version")
                .cloned()
                .unwrap_or_default();
            self.seen
                .lock()
                .unwrap()
                .push(format!("{kind} {ns}/{name}{version}"));
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServiceEventHandler for Recorder {
        async fn on_add(&self, service: Arc<Service>) {
            self.push("add", &service);
        }

        async fn on_update(&self, old: Arc<Service>, new: Arc<Service>) {
            assert_eq!(key(&old), key(&new));
            self.push("update", &new);
        }

        async fn on_delete(&self, service: Arc<Service>) {
            self.push("delete", &service);
        }
    }

    fn svc(name: &str, version: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                labels: Some(BTreeMap::from([("version".to_string(), version.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    type Item = std::result::Result<watcher::Event<Service>, watcher::Error>;

    async fn run_with(
        dispatcher: Dispatcher,
        events: Vec<watcher::Event<Service>>,
    ) -> CancellationToken {
        let synced = CancellationToken::new();
        let items: Vec<Item> = events.into_iter().map(Ok).collect();
        dispatcher
            .run(stream::iter(items), synced.clone(), CancellationToken::new())
            .await
            .unwrap();
        synced
    }

    fn dispatcher_with(name: &str) -> (Dispatcher, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(name, recorder.clone()).unwrap();
        (dispatcher, recorder)
    }

    #[tokio::test]
    async fn test_nothing_delivered_before_initial_sync() {
        let (dispatcher, recorder) = dispatcher_with("recorder");
        let synced = run_with(
            dispatcher,
            vec![
                watcher::Event::Init,
                watcher::Event::InitApply(svc("a", "1")),
                watcher::Event::InitApply(svc("b", "1")),
            ],
        )
        .await;

        assert!(recorder.seen().is_empty());
        assert!(!synced.is_cancelled());
    }

    #[tokio::test]
    async fn test_sync_replays_cache_then_live_events() {
        let (dispatcher, recorder) = dispatcher_with("recorder");
        let synced = run_with(
            dispatcher,
            vec![
                watcher::Event::Init,
                watcher::Event::InitApply(svc("b", "1")),
                watcher::Event::InitApply(svc("a", "1")),
                watcher::Event::InitDone,
                watcher::Event::Apply(svc("a", "2")),
                watcher::Event::Apply(svc("c", "1")),
                watcher::Event::Delete(svc("b", "1")),
            ],
        )
        .await;

        assert!(synced.is_cancelled());
        assert_eq!(
            recorder.seen(),
            vec!["add ns/a1", "add ns/b1", "update ns/a2", "add ns/c1", "delete ns/b1"]
        );
    }

    #[tokio::test]
    async fn test_relist_is_diffed_against_cache() {
        let (dispatcher, recorder) = dispatcher_with("recorder");
        run_with(
            dispatcher,
            vec![
                watcher::Event::Init,
                watcher::Event::InitApply(svc("a", "1")),
                watcher::Event::InitApply(svc("b", "1")),
                watcher::Event::InitDone,
                watcher::Event::Init,
                watcher::Event::InitApply(svc("a", "2")),
                watcher::Event::InitApply(svc("c", "1")),
                watcher::Event::InitDone,
            ],
        )
        .await;

        assert_eq!(
            recorder.seen(),
            vec!["add ns/a1", "add ns/b1", "update ns/a2", "add ns/c1", "delete ns/b1"]
        );
    }

    #[tokio::test]
    async fn test_every_handler_receives_every_event() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("first", first.clone()).unwrap();
        dispatcher.register("second", second.clone()).unwrap();
        assert_eq!(
            dispatcher.handler_names().collect::<Vec<_>>(),
            vec!["first", "second"]
        );

        run_with(
            dispatcher,
            vec![
                watcher::Event::Init,
                watcher::Event::InitDone,
                watcher::Event::Apply(svc("a", "1")),
                watcher::Event::Delete(svc("a", "1")),
            ],
        )
        .await;

        let expected = vec!["add ns/a1", "delete ns/a1"];
        assert_eq!(first.seen(), expected);
        assert_eq!(second.seen(), expected);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let (mut dispatcher, _) = dispatcher_with("recorder");
        let err = dispatcher
            .register("recorder", Arc::new(Recorder::default()))
            .unwrap_err();
        assert!(matches!(err, Error::HandlerConflict(name) if name == "recorder"));
    }

    #[tokio::test]
    async fn test_watch_errors_are_skipped() {
        let (dispatcher, recorder) = dispatcher_with("recorder");
        let items: Vec<Item> = vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitDone),
            Err(watcher::Error::NoResourceVersion),
            Ok(watcher::Event::Apply(svc("a", "1"))),
        ];
        dispatcher
            .run(
                stream::iter(items),
                CancellationToken::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(recorder.seen(), vec!["add ns/a1"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_watch() {
        let (dispatcher, recorder) = dispatcher_with("recorder");
        let cancel = CancellationToken::new();
        cancel.cancel();
        dispatcher
            .run(
                stream::pending::<Item>(),
                CancellationToken::new(),
                cancel,
            )
            .await
            .unwrap();
        assert!(recorder.seen().is_empty());
    }

    /// Accepts one event, then never finishes handling it.
    #[derive(Default)]
    struct Stuck {
        started: tokio::sync::Notify,
    }

    #[async_trait]
    impl ServiceEventHandler for Stuck {
        async fn on_add(&self, _service: Arc<Service>) {
            self.started.notify_one();
            std::future::pending::<()>().await;
        }

        async fn on_update(&self, _old: Arc<Service>, _new: Arc<Service>) {}

        async fn on_delete(&self, _service: Arc<Service>) {}
    }

    #[tokio::test]
    async fn test_cancel_interrupts_replay_into_full_handler() {
        let stuck = Arc::new(Stuck::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("stuck", stuck.clone()).unwrap();

        // one event in the handler, a full channel, and one more waiting to be queued
        let mut items: Vec<Item> = vec![Ok(watcher::Event::Init)];
        items.extend(
            (0..EVENT_BUFFER + 2)
                .map(|i| Ok(watcher::Event::InitApply(svc(&format!("svc-{i:05}"), "1")))),
        );
        items.push(Ok(watcher::Event::InitDone));

        let synced = CancellationToken::new();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(dispatcher.run(
            stream::iter(items),
            synced.clone(),
            cancel.clone(),
        ));

        stuck.started.notified().await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("dispatcher did not stop on cancel")
            .unwrap()
            .unwrap();
        assert!(!synced.is_cancelled());
    }
}
