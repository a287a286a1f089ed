//! The store engine.
//!
//! A [`Store`] owns a local tree, a mount table binding namespaces to
//! remote handles, the outstanding-request table for in-flight `get`s, and
//! the subscription list. It is transport-agnostic: outgoing messages go
//! through the send hook given to [`Store::transmit`], and incoming ones
//! are delivered by the host calling [`Store::receive`].
//!
//! A `Store` is a cheap cloneable handle over shared state; each public
//! operation interlocks on a store-wide lock. The lock is never held
//! across an `.await` or while user callbacks and the send hook run, so
//! in-process loopback transports and cyclic mounts cannot deadlock.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::Error;
use crate::message::{Message, MessageKind};
use crate::path::Path;
use crate::subscription::{EventCallback, Origin, Subscription, SubscriptionInfo};
use crate::value::{Resolved, Value};

/// The send hook: called with an outgoing message and the remote handle it
/// is addressed to. The handle is whatever value was passed to `attach`;
/// the store never looks inside it.
pub type SendFn<H> = Arc<dyn Fn(Message, &H) + Send + Sync>;

/// Hook observing terminal subscription installs and removals.
type LifecycleHook = Arc<dyn Fn(&Path, Uuid) + Send + Sync>;

enum WriteKind {
    Set,
    Push,
}

/// Work computed under the lock, executed after it is released.
enum Action<H> {
    Invoke {
        callback: EventCallback,
        path: Path,
        value: Value,
    },
    Send {
        send: SendFn<H>,
        message: Message,
        to: H,
    },
    Notify {
        hook: LifecycleHook,
        path: Path,
        id: Uuid,
    },
}

fn run<H>(actions: Vec<Action<H>>) {
    for action in actions {
        match action {
            Action::Invoke {
                callback,
                path,
                value,
            } => callback(&path, &value),
            Action::Send { send, message, to } => send(message, &to),
            Action::Notify { hook, path, id } => hook(&path, id),
        }
    }
}

fn correlation(message: &Message) -> Result<Uuid, Error> {
    message.id.ok_or_else(|| {
        Error::invalid_argument(format!("{} message without a correlation id", message.kind))
    })
}

struct Inner<H> {
    tree: Value,
    /// namespace -> remote
    remotes: HashMap<Path, H>,
    /// remote -> namespace
    namespaces: HashMap<H, Path>,
    /// correlation id -> resolver for the awaiting `get`
    requests: HashMap<Uuid, oneshot::Sender<Option<Value>>>,
    subs: Vec<Subscription<H>>,
    send: Option<SendFn<H>>,
    deref_mode: bool,
    on_subscription: Option<LifecycleHook>,
    on_unsubscription: Option<LifecycleHook>,
}

impl<H: Clone + Eq + Hash> Inner<H> {
    /// Find the longest mount prefix of `path`, segment-wise.
    ///
    /// Returns the remote, its namespace, and the residual path. A
    /// namespace equal to the path matches with an empty residual, so a
    /// read at a mount root crosses the wire.
    fn route(&self, path: &Path) -> Option<(H, Path, Path)> {
        let mut best: Option<(&Path, Path)> = None;
        for namespace in self.remotes.keys() {
            if let Some(residual) = path.strip_prefix(namespace) {
                if best.as_ref().map_or(true, |(b, _)| namespace.len() > b.len()) {
                    best = Some((namespace, residual));
                }
            }
        }
        best.map(|(namespace, residual)| {
            (self.remotes[namespace].clone(), namespace.clone(), residual)
        })
    }

    fn send_hook(&self) -> Result<SendFn<H>, Error> {
        self.send
            .clone()
            .ok_or_else(|| Error::other("no send hook configured (call transmit first)"))
    }

    /// Install one chain link.
    ///
    /// Resolution decides the downstream: a mount prefix turns the link
    /// into a remote chain hop and emits a `subscribe` with the residual
    /// path; otherwise the link is terminal and the local install
    /// notification fires.
    fn install_link(
        &mut self,
        path: Path,
        origin: Origin<H>,
        id: Uuid,
        throttle: NonZeroU32,
    ) -> Result<Vec<Action<H>>, Error> {
        let (downstream, residual) = match self.route(&path) {
            Some((remote, _namespace, residual)) => (Some(remote), residual),
            None => (None, path.clone()),
        };
        let wire = match &downstream {
            Some(remote) => Some((self.send_hook()?, remote.clone())),
            None => None,
        };

        // One link per (id, path): prune a duplicate left over from an
        // attach re-home. Cyclic chains keep their multiple hops in one
        // store, which differ by path.
        self.subs.retain(|s| !(s.id == id && s.path == path));
        self.subs.push(Subscription::new(
            path.clone(),
            id,
            downstream,
            origin,
            throttle,
        ));

        Ok(match wire {
            Some((send, remote)) => vec![Action::Send {
                send,
                message: Message::subscribe(residual, id, throttle.get()),
                to: remote,
            }],
            None => match &self.on_subscription {
                Some(hook) => vec![Action::Notify {
                    hook: hook.clone(),
                    path,
                    id,
                }],
                None => Vec::new(),
            },
        })
    }

    /// Delete every link whose id is in `ids`; notify each removed link's
    /// downstream, and fire the local removal notification for links that
    /// had none.
    fn remove_links(&mut self, ids: &HashSet<Uuid>) -> (usize, Vec<Action<H>>) {
        let send = self.send.clone();
        let mut kept = Vec::with_capacity(self.subs.len());
        let mut removed = Vec::new();
        for sub in self.subs.drain(..) {
            if ids.contains(&sub.id) {
                removed.push(sub);
            } else {
                kept.push(sub);
            }
        }
        self.subs = kept;

        let count = removed.len();
        let mut actions = Vec::new();
        for sub in removed {
            match sub.downstream {
                Some(remote) => match &send {
                    Some(send) => actions.push(Action::Send {
                        send: send.clone(),
                        message: Message::unsubscribe(sub.id),
                        to: remote,
                    }),
                    None => tracing::warn!(
                        path = %sub.path,
                        "no send hook configured, downstream not told to unsubscribe"
                    ),
                },
                None => {
                    if let Some(hook) = &self.on_unsubscription {
                        actions.push(Action::Notify {
                            hook: hook.clone(),
                            path: sub.path,
                            id: sub.id,
                        });
                    }
                }
            }
        }
        (count, actions)
    }

    /// Deliver a change at `path` to every matching link.
    ///
    /// A link matches when its local path is at or above `path` (and, for
    /// events, when its chain id matches). Heads get their callback; pass-
    /// through links re-emit an `event` to their upstream. Returns whether
    /// anything matched (throttled-out deliveries still count as matches).
    fn dispatch(
        &mut self,
        path: &Path,
        value: &Value,
        chain: Option<Uuid>,
    ) -> (bool, Vec<Action<H>>) {
        let send = self.send.clone();
        let mut matched = false;
        let mut actions = Vec::new();
        for sub in self.subs.iter_mut() {
            if let Some(id) = chain {
                if sub.id != id {
                    continue;
                }
            }
            if !path.is_beneath(&sub.path) {
                continue;
            }
            matched = true;
            if !sub.should_deliver() {
                continue;
            }
            match &sub.origin {
                Origin::Local { callback } => actions.push(Action::Invoke {
                    callback: callback.clone(),
                    path: path.clone(),
                    value: value.clone(),
                }),
                Origin::Upstream { remote } => match &send {
                    Some(send) => actions.push(Action::Send {
                        send: send.clone(),
                        message: Message::event(path.clone(), sub.id, Some(value.clone())),
                        to: remote.clone(),
                    }),
                    None => tracing::warn!(
                        path = %sub.path,
                        "no send hook configured, dropping event for pass-through link"
                    ),
                },
            }
        }
        (matched, actions)
    }
}

/// One federated hierarchical key-value store.
///
/// Cloning a `Store` yields another handle to the same engine, which is
/// how the send hooks of peers and the reply tasks of `receive` keep it
/// reachable.
pub struct Store<H> {
    inner: Arc<Mutex<Inner<H>>>,
}

impl<H> Clone for Store<H> {
    fn clone(&self) -> Self {
        Store {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: Clone + Eq + Hash + Send + Sync + 'static> Store<H> {
    /// Create a store with an empty tree.
    pub fn new() -> Self {
        Self::from_tree(Value::map())
    }

    /// Create a store over an initial tree.
    ///
    /// Fails with a type mismatch unless the root is a mapping.
    pub fn with_tree(tree: Value) -> Result<Self, Error> {
        if !tree.is_map() {
            return Err(Error::type_mismatch("the root value must be a mapping"));
        }
        Ok(Self::from_tree(tree))
    }

    fn from_tree(tree: Value) -> Self {
        Store {
            inner: Arc::new(Mutex::new(Inner {
                tree,
                remotes: HashMap::new(),
                namespaces: HashMap::new(),
                requests: HashMap::new(),
                subs: Vec::new(),
                send: None,
                deref_mode: false,
                on_subscription: None,
                on_unsubscription: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<H>> {
        // A panicked user callback must not wedge the store.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the send hook used for every outgoing message.
    ///
    /// The hook is called with `(message, remote_handle)`; the caller is
    /// responsible for delivery and for driving the peer's `receive`.
    pub fn transmit<F>(&self, send: F)
    where
        F: Fn(Message, &H) + Send + Sync + 'static,
    {
        self.lock().send = Some(Arc::new(send));
    }

    /// Mount a remote at `namespace`.
    ///
    /// Registers both direction maps and installs an empty-mapping
    /// placeholder in the local tree, so full-tree reads reveal the mount.
    /// Existing subscriptions beneath the namespace are re-homed: removed
    /// and re-installed with the same path, origin, id and throttle, which
    /// re-runs resolution and starts a chain into the new remote.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty namespace; `AlreadyAttached` when
    /// the namespace is taken or the remote already occupies another one.
    pub fn attach(&self, namespace: &str, remote: H) -> Result<(), Error> {
        let namespace = Path::parse(namespace);
        if namespace.is_empty() {
            return Err(Error::invalid_argument("attach namespace must not be empty"));
        }
        let actions = {
            let mut inner = self.lock();
            if inner.remotes.contains_key(&namespace) {
                return Err(Error::AlreadyAttached { namespace });
            }
            if let Some(existing) = inner.namespaces.get(&remote) {
                return Err(Error::AlreadyAttached {
                    namespace: existing.clone(),
                });
            }
            inner.tree.set(&namespace, Value::map())?;
            inner.remotes.insert(namespace.clone(), remote.clone());
            inner.namespaces.insert(remote, namespace.clone());

            let mut kept = Vec::with_capacity(inner.subs.len());
            let mut rehome = Vec::new();
            for sub in inner.subs.drain(..) {
                if sub.path.is_beneath(&namespace) {
                    rehome.push(sub);
                } else {
                    kept.push(sub);
                }
            }
            inner.subs = kept;

            let mut actions = Vec::new();
            for sub in rehome {
                tracing::debug!(path = %sub.path, id = %sub.id, "re-homing subscription onto new mount");
                actions.extend(inner.install_link(sub.path, sub.origin, sub.id, sub.throttle)?);
            }
            actions
        };
        run(actions);
        Ok(())
    }

    /// Unmount by namespace, or by remote when no namespace is given.
    ///
    /// Removes both direction maps and the placeholder. Subscription
    /// chains running through the mount are left in place; the orphan
    /// cleanup reply on their next `event` converges them.
    pub fn detach(&self, namespace: Option<&str>, remote: Option<&H>) -> Result<(), Error> {
        let mut inner = self.lock();
        let namespace = match (namespace, remote) {
            (Some(ns), _) => Path::parse(ns),
            (None, Some(remote)) => inner
                .namespaces
                .get(remote)
                .cloned()
                .ok_or_else(|| Error::not_found("remote is not attached"))?,
            (None, None) => {
                return Err(Error::invalid_argument("detach needs a namespace or a remote"))
            }
        };
        let remote = inner
            .remotes
            .remove(&namespace)
            .ok_or_else(|| Error::not_found(format!("no mount at '{}'", namespace)))?;
        inner.namespaces.remove(&remote);
        inner.tree.remove(&namespace)?;
        Ok(())
    }

    /// Write `value` at `path`; `None` removes the leaf.
    ///
    /// A path under a mount emits a `set` message with the residual path.
    /// A local write rejects paths at or above a mount, applies the
    /// change, and dispatches `(written_path, value)` to every
    /// subscription at or above the written path before returning.
    pub fn set(&self, path: &str, value: impl Into<Option<Value>>) -> Result<(), Error> {
        self.apply_write(Path::parse(path), value.into(), WriteKind::Set, None)
    }

    /// Append `value` to the sequence leaf at `path`.
    ///
    /// Fails with a type mismatch if the leaf is not a sequence.
    pub fn push(&self, path: &str, value: impl Into<Value>) -> Result<(), Error> {
        self.apply_write(Path::parse(path), Some(value.into()), WriteKind::Push, None)
    }

    /// Append, then trim from the head of the sequence until its length is
    /// at most `limit` (a zero limit trims nothing).
    pub fn push_limit(&self, path: &str, value: impl Into<Value>, limit: usize) -> Result<(), Error> {
        self.apply_write(
            Path::parse(path),
            Some(value.into()),
            WriteKind::Push,
            Some(limit),
        )
    }

    fn apply_write(
        &self,
        path: Path,
        value: Option<Value>,
        kind: WriteKind,
        limit: Option<usize>,
    ) -> Result<(), Error> {
        let actions = {
            let mut inner = self.lock();
            // A write at a mount root is a conflict, not a remote write, so
            // only routes with a nonempty residual go over the wire.
            let routed = inner
                .route(&path)
                .filter(|(_, _, residual)| !residual.is_empty());
            if let Some((remote, _namespace, residual)) = routed {
                let send = inner.send_hook()?;
                let message = match kind {
                    WriteKind::Set => Message::set(residual, value, limit),
                    WriteKind::Push => Message::push(
                        residual,
                        value.ok_or_else(|| Error::invalid_argument("push requires a value"))?,
                        limit,
                    ),
                };
                vec![Action::Send {
                    send,
                    message,
                    to: remote,
                }]
            } else {
                if let Some(namespace) = inner.remotes.keys().find(|ns| ns.is_beneath(&path)) {
                    return Err(Error::ConflictingMount {
                        namespace: namespace.clone(),
                    });
                }
                let written = match kind {
                    WriteKind::Set => match value {
                        Some(v) => {
                            if path.is_empty() && !v.is_map() {
                                return Err(Error::type_mismatch(
                                    "the root value must be a mapping",
                                ));
                            }
                            inner.tree.set(&path, v.clone())?;
                            v
                        }
                        None => {
                            inner.tree.remove(&path)?;
                            Value::Null
                        }
                    },
                    WriteKind::Push => {
                        let v = value
                            .ok_or_else(|| Error::invalid_argument("push requires a value"))?;
                        match inner.tree.get_mut(&path) {
                            Some(Value::Array(items)) => {
                                items.push(v.clone());
                                if let Some(limit) = limit {
                                    if limit > 0 {
                                        while items.len() > limit {
                                            items.remove(0);
                                        }
                                    }
                                }
                            }
                            _ => {
                                return Err(Error::type_mismatch(format!(
                                    "cannot push to non-sequence leaf at '{}'",
                                    path
                                )))
                            }
                        }
                        v
                    }
                };
                let (_matched, actions) = inner.dispatch(&path, &written, None);
                actions
            }
        };
        run(actions);
        Ok(())
    }

    /// Read the value at `path`.
    ///
    /// Suspends when the path crosses a mount (awaiting the `value` reply)
    /// or when it lands on a callable leaf that returns a future. Returns
    /// `Ok(None)` when the path does not resolve.
    pub async fn get(&self, path: &str) -> Result<Option<Value>, Error> {
        self.get_with(path, None).await
    }

    /// Read with a parameter.
    ///
    /// A parameter that lands on a callable leaf is its RPC argument; the
    /// callable's result is resolved further with any path remaining after
    /// it. A nonnegative integer parameter that lands on plain data is a
    /// projection depth: primitive leaves are kept, containers below the
    /// depth come back empty.
    ///
    /// With `deref_mode` on, every callable left in the result is replaced
    /// by the value it produces before returning.
    pub async fn get_with(
        &self,
        path: &str,
        params: impl Into<Option<Value>>,
    ) -> Result<Option<Value>, Error> {
        let path = Path::parse(path);
        let params = params.into();

        enum Step {
            Data(Value),
            Call(crate::value::Callable, Path),
        }

        enum PreStep {
            Remote(oneshot::Receiver<Option<Value>>),
            Local(bool, Step),
        }

        let pre_step = {
            let mut inner = self.lock();
            let deref_mode = inner.deref_mode;
            if let Some((remote, _namespace, residual)) = inner.route(&path) {
                let send = inner.send_hook()?;
                let id = Uuid::new_v4();
                let (tx, rx) = oneshot::channel();
                inner.requests.insert(id, tx);
                let message = Message::get(residual, id, params.clone());
                drop(inner);
                send(message, &remote);
                PreStep::Remote(rx)
            } else {
                let step = match inner.tree.resolve(&path) {
                    Resolved::Absent => return Ok(None),
                    Resolved::Found(v) => Step::Data(v.clone()),
                    Resolved::Callable(c, rest) => Step::Call(c.clone(), rest),
                };
                PreStep::Local(deref_mode, step)
            }
        };

        let (deref_mode, step) = match pre_step {
            PreStep::Remote(rx) => {
                return match rx.await {
                    Ok(value) => Ok(value),
                    Err(_) => Err(Error::other("reply channel closed before a value arrived")),
                };
            }
            PreStep::Local(deref_mode, step) => (deref_mode, step),
        };

        let (mut result, invoked) = match step {
            Step::Data(v) => (v, false),
            Step::Call(callable, mut rest) => {
                let mut current = callable.invoke(params.clone()).await;
                // Continue resolution into whatever the callable produced.
                while !rest.is_empty() {
                    let next = match current.resolve(&rest) {
                        Resolved::Absent => return Ok(None),
                        Resolved::Found(v) => Step::Data(v.clone()),
                        Resolved::Callable(c, r) => Step::Call(c.clone(), r),
                    };
                    match next {
                        Step::Data(v) => {
                            current = v;
                            break;
                        }
                        Step::Call(c, r) => {
                            rest = r;
                            current = c.invoke(params.clone()).await;
                        }
                    }
                }
                (current, true)
            }
        };

        if !invoked {
            if let Some(Value::Integer(depth)) = &params {
                if *depth >= 0 {
                    result = result.project(*depth as usize);
                }
            }
        }

        if deref_mode {
            result = result.dereferenced().await;
        }

        Ok(Some(result))
    }

    /// Subscribe to changes at and beneath `path`. Returns the chain id.
    ///
    /// The callback fires for every write whose path is at or beneath the
    /// subscribed path, with the written path and value.
    pub fn subscribe<F>(&self, path: &str, callback: F) -> Result<Uuid, Error>
    where
        F: Fn(&Path, &Value) + Send + Sync + 'static,
    {
        self.subscribe_throttled(path, callback, 1)
    }

    /// Subscribe, delivering only every `throttle`-th event (the first
    /// always fires).
    pub fn subscribe_throttled<F>(&self, path: &str, callback: F, throttle: u32) -> Result<Uuid, Error>
    where
        F: Fn(&Path, &Value) + Send + Sync + 'static,
    {
        let throttle = NonZeroU32::new(throttle)
            .ok_or_else(|| Error::invalid_argument("throttle must be at least 1"))?;
        let id = Uuid::new_v4();
        let actions = {
            let mut inner = self.lock();
            inner.install_link(
                Path::parse(path),
                Origin::Local {
                    callback: Arc::new(callback),
                },
                id,
                throttle,
            )?
        };
        run(actions);
        Ok(id)
    }

    /// Remove subscriptions by chain id (canonical hyphenated UUID) or by
    /// exact path. Returns the number of removed links.
    ///
    /// Every link sharing an id with a matched head is deleted; removed
    /// links with a downstream get an `unsubscribe` sent after them.
    /// Fails with `NotFound` when nothing matches.
    pub fn unsubscribe(&self, path_or_id: &str) -> Result<usize, Error> {
        let (count, actions) = {
            let mut inner = self.lock();
            let ids: HashSet<Uuid> = match Uuid::parse_str(path_or_id) {
                Ok(id) => inner
                    .subs
                    .iter()
                    .filter(|s| s.id == id && s.is_head())
                    .map(|s| s.id)
                    .collect(),
                Err(_) => {
                    let path = Path::parse(path_or_id);
                    inner
                        .subs
                        .iter()
                        .filter(|s| s.path == path && s.is_head())
                        .map(|s| s.id)
                        .collect()
                }
            };
            if ids.is_empty() {
                return Err(Error::not_found(format!(
                    "no subscription matches '{}'",
                    path_or_id
                )));
            }
            inner.remove_links(&ids)
        };
        run(actions);
        Ok(count)
    }

    /// Remove every locally-owned subscription at or beneath `path`.
    ///
    /// Fails with `PartialFailure` when pass-through links owned by a
    /// remote survive beneath the path (their removals, if any, still
    /// happened).
    pub fn unsubscribe_tree(&self, path: &str) -> Result<usize, Error> {
        let path = Path::parse(path);
        let (count, actions, survivors) = {
            let mut inner = self.lock();
            let ids: HashSet<Uuid> = inner
                .subs
                .iter()
                .filter(|s| s.is_head() && s.path.is_beneath(&path))
                .map(|s| s.id)
                .collect();
            let (count, actions) = inner.remove_links(&ids);
            let survivors = inner
                .subs
                .iter()
                .filter(|s| s.path.is_beneath(&path))
                .count();
            (count, actions, survivors)
        };
        run(actions);
        if survivors > 0 {
            return Err(Error::PartialFailure {
                remaining: survivors,
            });
        }
        Ok(count)
    }

    /// Whether any link in this store has exactly this path.
    pub fn subscribed_to(&self, path: &str) -> bool {
        let path = Path::parse(path);
        self.lock().subs.iter().any(|s| s.path == path)
    }

    /// The attached namespaces, sorted.
    pub fn namespaces(&self) -> Vec<Path> {
        let inner = self.lock();
        let mut namespaces: Vec<Path> = inner.remotes.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    /// Static copies of the subscription list.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.lock().subs.iter().map(Subscription::info).collect()
    }

    /// Number of in-flight remote `get`s.
    pub fn outstanding_requests(&self) -> usize {
        self.lock().requests.len()
    }

    /// Whether `get` results have their callables replaced by produced
    /// values.
    pub fn deref_mode(&self) -> bool {
        self.lock().deref_mode
    }

    /// Switch dereference mode.
    pub fn set_deref_mode(&self, enabled: bool) {
        self.lock().deref_mode = enabled;
    }

    /// Observe terminal subscription installs: `(path, id)`.
    pub fn on_subscription<F>(&self, hook: F)
    where
        F: Fn(&Path, Uuid) + Send + Sync + 'static,
    {
        self.lock().on_subscription = Some(Arc::new(hook));
    }

    /// Observe terminal subscription removals: `(path, id)`.
    pub fn on_unsubscription<F>(&self, hook: F)
    where
        F: Fn(&Path, Uuid) + Send + Sync + 'static,
    {
        self.lock().on_unsubscription = Some(Arc::new(hook));
    }

    /// Demultiplex one incoming message from the remote it arrived from.
    ///
    /// `set`/`push` apply through the store's own write path (so they can
    /// hop onward through further mounts); `get` runs the local read on a
    /// task and replies with a `value` (this arm needs a Tokio runtime);
    /// `value` resolves the outstanding request; `event` is re-homed under
    /// the sender's namespace and dispatched by chain id; `subscribe`
    /// installs a pass-through link forwarding back to the sender;
    /// `unsubscribe` tears links down.
    ///
    /// Errors discovered here surface to the host that drove `receive`.
    pub fn receive(&self, message: Message, from: &H) -> Result<(), Error> {
        match message.kind {
            MessageKind::Set => self.apply_write(message.path, message.value, WriteKind::Set, None),
            MessageKind::Push => {
                let limit = message.limit();
                let value = message
                    .value
                    .ok_or_else(|| Error::invalid_argument("push message without a value"))?;
                self.apply_write(message.path, Some(value), WriteKind::Push, limit)
            }
            MessageKind::Get => {
                let id = correlation(&message)?;
                let store = self.clone();
                let from = from.clone();
                let path = message.path;
                let params = message.params;
                tokio::spawn(async move {
                    let value = match store.get_with(&path.to_string(), params).await {
                        Ok(v) => v,
                        Err(error) => {
                            tracing::warn!(%path, %error, "remote get failed, replying with an absent value");
                            None
                        }
                    };
                    let send = store.lock().send.clone();
                    match send {
                        Some(send) => send(Message::value(path, id, value), &from),
                        None => {
                            tracing::warn!(%path, "no send hook configured, dropping value reply")
                        }
                    }
                });
                Ok(())
            }
            MessageKind::Value => {
                let id = correlation(&message)?;
                let resolver = self.lock().requests.remove(&id);
                match resolver {
                    Some(tx) => {
                        if tx.send(message.value).is_err() {
                            tracing::debug!(%id, "value reply arrived after the caller went away");
                        }
                    }
                    None => tracing::warn!(%id, "value reply with no outstanding request"),
                }
                Ok(())
            }
            MessageKind::Event => {
                let id = correlation(&message)?;
                let value = message.value.unwrap_or(Value::Null);
                let actions = {
                    let mut inner = self.lock();
                    let namespace = match inner.namespaces.get(from) {
                        Some(ns) => ns.clone(),
                        None => {
                            // Converge the chain anyway, then report the
                            // missing context to the host.
                            let send = inner.send.clone();
                            drop(inner);
                            if let Some(send) = send {
                                send(Message::unsubscribe(id), from);
                            }
                            return Err(Error::MissingContext {
                                message: "event from a remote that is not attached".into(),
                            });
                        }
                    };
                    let full_path = namespace.join(&message.path);
                    let (matched, mut actions) = inner.dispatch(&full_path, &value, Some(id));
                    if !matched {
                        // Orphan cleanup: no link wants this chain here.
                        tracing::debug!(%id, path = %full_path, "event with no matching link, replying unsubscribe");
                        if let Some(send) = inner.send.clone() {
                            actions.push(Action::Send {
                                send,
                                message: Message::unsubscribe(id),
                                to: from.clone(),
                            });
                        }
                    }
                    actions
                };
                run(actions);
                Ok(())
            }
            MessageKind::Subscribe => {
                let id = correlation(&message)?;
                let throttle = NonZeroU32::new(message.throttle.unwrap_or(1))
                    .ok_or_else(|| Error::invalid_argument("subscribe throttle must be at least 1"))?;
                let actions = {
                    let mut inner = self.lock();
                    inner.install_link(
                        message.path,
                        Origin::Upstream {
                            remote: from.clone(),
                        },
                        id,
                        throttle,
                    )?
                };
                run(actions);
                Ok(())
            }
            MessageKind::Unsubscribe => {
                let id = correlation(&message)?;
                let actions = {
                    let mut inner = self.lock();
                    let (_removed, actions) = inner.remove_links(&HashSet::from([id]));
                    actions
                };
                run(actions);
                Ok(())
            }
            MessageKind::Unknown => Err(Error::Protocol {
                message: "unrecognized message kind".into(),
            }),
        }
    }
}

impl<H: Clone + Eq + Hash + Send + Sync + 'static> Default for Store<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;

    fn store() -> Store<&'static str> {
        Store::new()
    }

    #[tokio::test]
    async fn basic_set_get() {
        let s = store();
        s.set("number.six", Value::from(6)).unwrap();
        assert_eq!(s.get("number.six").await.unwrap(), Some(Value::from(6)));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let s = store();
        assert_eq!(s.get("nothing.here").await.unwrap(), None);
    }

    #[tokio::test]
    async fn root_get_returns_whole_tree() {
        let s = store();
        s.set("a.b", Value::from(1)).unwrap();
        let root = s.get("").await.unwrap().unwrap();
        assert_eq!(root.get(&path!("a.b")), Some(&Value::from(1)));
    }

    #[tokio::test]
    async fn rpc_leaf_doubles_its_argument() {
        let s = store();
        s.set(
            "double.me",
            Value::callable(|params| match params {
                Some(Value::Integer(n)) => Value::Integer(2 * n),
                _ => Value::Null,
            }),
        )
        .unwrap();

        let result = s.get_with("double.me", Value::from(2)).await.unwrap();
        assert_eq!(result, Some(Value::from(4)));
    }

    #[tokio::test]
    async fn callable_result_resolves_further() {
        let s = store();
        s.set(
            "api",
            Value::callable(|_| {
                let mut out = Value::map();
                out.set(&path!("inner.answer"), Value::from(42)).unwrap();
                out
            }),
        )
        .unwrap();

        assert_eq!(
            s.get("api.inner.answer").await.unwrap(),
            Some(Value::from(42))
        );
        assert_eq!(s.get("api.inner.missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn async_callable_is_awaited() {
        let s = store();
        s.set(
            "slow",
            Value::callable_async(|_| {
                Box::pin(async {
                    tokio::task::yield_now().await;
                    Value::from("done")
                })
            }),
        )
        .unwrap();

        assert_eq!(s.get("slow").await.unwrap(), Some(Value::from("done")));
    }

    #[tokio::test]
    async fn depth_projection() {
        let s = store();
        s.set("top.mid.deep.leaf", Value::from(1)).unwrap();
        s.set("top.flat", Value::from(2)).unwrap();

        let projected = s
            .get_with("top", Value::from(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(projected.get(&path!("flat")), Some(&Value::from(2)));
        assert_eq!(projected.get(&path!("mid")), Some(&Value::map()));

        let projected = s.get_with("top", Value::from(0)).await.unwrap().unwrap();
        assert_eq!(projected, Value::map());
    }

    #[tokio::test]
    async fn deref_mode_resolves_embedded_callables() {
        let s = store();
        s.set("data.plain", Value::from(1)).unwrap();
        s.set("data.gen", Value::callable(|_| Value::from(7)))
            .unwrap();

        let result = s.get("data").await.unwrap().unwrap();
        assert!(result.get(&path!("gen")).unwrap().is_callable());

        s.set_deref_mode(true);
        assert!(s.deref_mode());
        let result = s.get("data").await.unwrap().unwrap();
        assert_eq!(result.get(&path!("gen")), Some(&Value::from(7)));
    }

    #[tokio::test]
    async fn set_none_removes_leaf() {
        let s = store();
        s.set("a.b", Value::from(1)).unwrap();
        s.set("a.b", None).unwrap();
        assert_eq!(s.get("a.b").await.unwrap(), None);
        // Parent map survives
        assert_eq!(s.get("a").await.unwrap(), Some(Value::map()));
    }

    #[tokio::test]
    async fn set_root_requires_mapping() {
        let s = store();
        assert!(matches!(
            s.set("", Value::from(1)),
            Err(Error::TypeMismatch { .. })
        ));

        let mut tree = Value::map();
        tree.set(&path!("x"), Value::from(1)).unwrap();
        s.set("", tree).unwrap();
        assert_eq!(s.get("x").await.unwrap(), Some(Value::from(1)));
    }

    #[test]
    fn with_tree_requires_mapping() {
        assert!(Store::<&'static str>::with_tree(Value::from(1)).is_err());
        assert!(Store::<&'static str>::with_tree(Value::map()).is_ok());
    }

    #[tokio::test]
    async fn push_appends_and_limit_trims_from_head() {
        let s = store();
        s.set("log", Value::array()).unwrap();
        s.push("log", Value::from(1)).unwrap();
        s.push("log", Value::from(2)).unwrap();
        s.push_limit("log", Value::from(3), 2).unwrap();

        assert_eq!(
            s.get("log").await.unwrap(),
            Some(Value::from(vec![2i64, 3]))
        );
    }

    #[test]
    fn push_to_non_sequence_fails() {
        let s = store();
        s.set("scalar", Value::from(1)).unwrap();
        assert!(matches!(
            s.push("scalar", Value::from(2)),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            s.push("missing", Value::from(2)),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn attach_validations() {
        let s = store();
        assert!(matches!(
            s.attach("", "remote"),
            Err(Error::InvalidArgument { .. })
        ));

        s.attach("child", "remote").unwrap();
        assert!(matches!(
            s.attach("child", "other"),
            Err(Error::AlreadyAttached { .. })
        ));
        // The same remote may not occupy two namespaces
        assert!(matches!(
            s.attach("elsewhere", "remote"),
            Err(Error::AlreadyAttached { .. })
        ));
    }

    #[tokio::test]
    async fn attach_installs_placeholder_in_tree() {
        let s = store();
        s.attach("child.grand", "remote").unwrap();
        let root = s.get("").await.unwrap().unwrap();
        assert_eq!(root.get(&path!("child.grand")), Some(&Value::map()));
    }

    #[test]
    fn set_at_or_above_mount_is_rejected() {
        let s = store();
        s.attach("child.data", "remote").unwrap();

        assert!(matches!(
            s.set("child.data", Value::from(1)),
            Err(Error::ConflictingMount { .. })
        ));
        assert!(matches!(
            s.set("child", Value::from(1)),
            Err(Error::ConflictingMount { .. })
        ));
        assert!(matches!(
            s.set("", Value::map()),
            Err(Error::ConflictingMount { .. })
        ));
        // A sibling path is fine
        s.set("child2", Value::from(1)).unwrap();
    }

    #[test]
    fn detach_validations() {
        let s = store();
        assert!(matches!(
            s.detach(None, None),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            s.detach(Some("ghost"), None),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            s.detach(None, Some(&"ghost")),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn detach_by_remote_removes_placeholder() {
        let s = store();
        s.attach("child", "remote").unwrap();
        s.detach(None, Some(&"remote")).unwrap();

        assert!(s.namespaces().is_empty());
        assert_eq!(s.get("child").await.unwrap(), None);
        // Detached namespace is writable again
        s.set("child", Value::from(1)).unwrap();
    }

    #[test]
    fn namespaces_are_sorted() {
        let s = store();
        s.attach("zoo", "z").unwrap();
        s.attach("alpha", "a").unwrap();
        assert_eq!(s.namespaces(), vec![path!("alpha"), path!("zoo")]);
    }

    #[test]
    fn local_subscription_fires_on_descendant_writes() {
        let s = store();
        let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        s.subscribe("system", move |path, value| {
            sink.lock().unwrap().push((path.to_string(), value.clone()));
        })
        .unwrap();

        s.set("system.voltage", Value::from(33)).unwrap();
        s.set("system", Value::map()).unwrap();
        s.set("other.voltage", Value::from(1)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("system.voltage".to_string(), Value::from(33)),
                ("system".to_string(), Value::map()),
            ]
        );
    }

    #[test]
    fn ancestor_writes_do_not_fire_deeper_subscriptions() {
        let s = store();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        s.subscribe("a.b.c", move |_, _| {
            *sink.lock().unwrap() += 1;
        })
        .unwrap();

        s.set("a.b", Value::map()).unwrap();
        s.set("a", Value::map()).unwrap();
        assert_eq!(*seen.lock().unwrap(), 0);

        s.set("a.b.c.d", Value::from(1)).unwrap();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn throttled_subscription_fires_ceil_k_over_n_times() {
        let s = store();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        s.subscribe_throttled(
            "rapid.data",
            move |_, _| {
                *sink.lock().unwrap() += 1;
            },
            2,
        )
        .unwrap();

        for i in 0..5 {
            s.set("rapid.data", Value::from(i as i64)).unwrap();
        }
        // 5 sets, throttle 2: fires on the 1st, 3rd and 5th
        assert_eq!(*seen.lock().unwrap(), 3);
    }

    #[test]
    fn zero_throttle_is_invalid() {
        let s = store();
        assert!(matches!(
            s.subscribe_throttled("a", |_, _| {}, 0),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn unsubscribe_by_id_leaves_other_subscription() {
        let s = store();
        let first = Arc::new(Mutex::new(0usize));
        let second = Arc::new(Mutex::new(0usize));
        let sink = first.clone();
        let id = s
            .subscribe("shared.path", move |_, _| {
                *sink.lock().unwrap() += 1;
            })
            .unwrap();
        let sink = second.clone();
        s.subscribe("shared.path", move |_, _| {
            *sink.lock().unwrap() += 1;
        })
        .unwrap();

        let removed = s.unsubscribe(&id.to_string()).unwrap();
        assert_eq!(removed, 1);

        s.set("shared.path", Value::from(1)).unwrap();
        assert_eq!(*first.lock().unwrap(), 0);
        assert_eq!(*second.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_by_path_requires_exact_match() {
        let s = store();
        s.subscribe("a.b", |_, _| {}).unwrap();

        assert!(matches!(
            s.unsubscribe("a"),
            Err(Error::NotFound { .. })
        ));
        assert_eq!(s.unsubscribe("a.b").unwrap(), 1);
        assert!(s.subscriptions().is_empty());
    }

    #[test]
    fn unsubscribe_tree_removes_everything_beneath() {
        let s = store();
        s.subscribe("sensors.a", |_, _| {}).unwrap();
        s.subscribe("sensors.b", |_, _| {}).unwrap();
        s.subscribe("actuators", |_, _| {}).unwrap();

        assert_eq!(s.unsubscribe_tree("sensors").unwrap(), 2);
        let remaining = s.subscriptions();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].path, path!("actuators"));
    }

    #[test]
    fn subscribed_to_checks_exact_path() {
        let s = store();
        s.subscribe("a.b", |_, _| {}).unwrap();
        assert!(s.subscribed_to("a.b"));
        assert!(!s.subscribed_to("a"));
        assert!(!s.subscribed_to("a.b.c"));
    }

    #[test]
    fn subscription_listing_is_a_static_copy() {
        let s = store();
        let id = s.subscribe_throttled("a.b", |_, _| {}, 3).unwrap();

        let infos = s.subscriptions();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].path, path!("a.b"));
        assert_eq!(infos[0].id, id);
        assert_eq!(infos[0].throttle, 3);
        assert!(infos[0].is_head);
        assert!(infos[0].is_terminal);
    }

    #[test]
    fn subscription_hooks_fire_for_terminal_links() {
        let s = store();
        let installed = Arc::new(Mutex::new(Vec::new()));
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = installed.clone();
        s.on_subscription(move |path, _| sink.lock().unwrap().push(path.to_string()));
        let sink = removed.clone();
        s.on_unsubscription(move |path, _| sink.lock().unwrap().push(path.to_string()));

        s.subscribe("a.b", |_, _| {}).unwrap();
        s.unsubscribe("a.b").unwrap();

        assert_eq!(*installed.lock().unwrap(), vec!["a.b".to_string()]);
        assert_eq!(*removed.lock().unwrap(), vec!["a.b".to_string()]);
    }

    #[test]
    fn callback_may_reenter_the_store() {
        let s = store();
        let inner = s.clone();
        s.subscribe("trigger", move |_, _| {
            inner.set("echo", Value::from(1)).unwrap();
        })
        .unwrap();

        s.set("trigger", Value::from(1)).unwrap();
        let echoed = s.lock().tree.get(&path!("echo")).cloned();
        assert_eq!(echoed, Some(Value::from(1)));
    }

    #[test]
    fn receive_unknown_kind_is_a_protocol_error() {
        let s = store();
        let message: Message =
            serde_json::from_str("{\"type\": \"gossip\", \"path\": \"a\"}").unwrap();
        assert!(matches!(
            s.receive(message, &"peer"),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn receive_event_without_id_is_invalid() {
        let s = store();
        let mut message = Message::event(path!("a"), Uuid::new_v4(), None);
        message.id = None;
        assert!(matches!(
            s.receive(message, &"peer"),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn remote_write_without_send_hook_fails() {
        let s = store();
        s.attach("child", "remote").unwrap();
        assert!(s.set("child.x", Value::from(1)).is_err());
        assert!(s.get("child.x").await.is_err());
    }
}
