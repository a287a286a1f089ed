//! Subscription chain links.
//!
//! A logical subscription spanning several stores is a chain of links, one
//! per store, all sharing a single chain id. Each link records its local
//! path, where events go (a local callback at the head, or back upstream
//! over the wire), and whether resolution found a downstream remote to
//! continue the chain into.

use std::num::NonZeroU32;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::path::Path;
use crate::value::Value;

/// Callback invoked with the changed path and the written value.
pub type EventCallback = Arc<dyn Fn(&Path, &Value) + Send + Sync>;

/// Where a link came from, which decides where its events go.
pub(crate) enum Origin<H> {
    /// Installed by a local `subscribe` call; the head of its chain.
    Local { callback: EventCallback },
    /// Installed by a `subscribe` message; events are forwarded back to
    /// the sender as `event` messages (no user visibility).
    Upstream { remote: H },
}

impl<H: Clone> Clone for Origin<H> {
    fn clone(&self) -> Self {
        match self {
            Origin::Local { callback } => Origin::Local {
                callback: callback.clone(),
            },
            Origin::Upstream { remote } => Origin::Upstream {
                remote: remote.clone(),
            },
        }
    }
}

/// One store's record of its participation in a subscription chain.
pub(crate) struct Subscription<H> {
    /// Path in this store's view (mount prefix included).
    pub path: Path,
    /// Chain-wide identifier, shared by every hop.
    pub id: Uuid,
    /// Remote the chain continues into, when resolution found one.
    pub downstream: Option<H>,
    /// Head callback or upstream to forward to.
    pub origin: Origin<H>,
    /// Deliver every Nth eligible event.
    pub throttle: NonZeroU32,
    /// Dispatch counter for the throttle gate.
    pub counter: u32,
}

impl<H> Subscription<H> {
    pub fn new(path: Path, id: Uuid, downstream: Option<H>, origin: Origin<H>, throttle: NonZeroU32) -> Self {
        Subscription {
            path,
            id,
            downstream,
            origin,
            throttle,
            counter: 0,
        }
    }

    /// A head holds the user callback (no upstream).
    pub fn is_head(&self) -> bool {
        matches!(self.origin, Origin::Local { .. })
    }

    /// A pass-through forwards events to its upstream.
    pub fn is_pass_through(&self) -> bool {
        matches!(self.origin, Origin::Upstream { .. })
    }

    /// A terminal link has no downstream: the chain ends here.
    pub fn is_terminal(&self) -> bool {
        self.downstream.is_none()
    }

    /// Gate one eligible delivery through the throttle.
    ///
    /// Only the chain's most-downstream link counts; links with a
    /// downstream forward every delivery so that exactly one hop applies
    /// the throttle. The counter starts so the first delivery fires.
    pub fn should_deliver(&mut self) -> bool {
        if !self.is_terminal() {
            return true;
        }
        let fire = self.counter == 0;
        self.counter = (self.counter + 1) % self.throttle.get();
        fire
    }

    /// A static copy for the public listing.
    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            path: self.path.clone(),
            id: self.id,
            throttle: self.throttle.get(),
            is_head: self.is_head(),
            is_terminal: self.is_terminal(),
        }
    }
}

/// A static copy of one subscription list entry, without internal
/// references or callbacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    /// Path in the owning store's view.
    pub path: Path,
    /// Chain-wide identifier.
    pub id: Uuid,
    /// Delivery period.
    pub throttle: u32,
    /// Whether this link holds a user callback.
    pub is_head: bool,
    /// Whether the chain ends at this link.
    pub is_terminal: bool,
}
