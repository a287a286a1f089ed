//! Entangld: federated hierarchical key-value stores.
//!
//! Each [`Store`] exposes a tree-shaped namespace addressed by dotted
//! paths, with callable leaves that act as RPC-style getters and change
//! notifications delivered through chained subscriptions. Stores federate
//! by mounting one another at arbitrary namespaces, producing an overlay
//! tree in which a single path may traverse several stores:
//!
//! - `Path`: dotted path with segment-wise prefix semantics
//! - `Value`: the tree data model, including `Callable` leaves
//! - `Message`: the tagged record stores exchange over a user-supplied
//!   transport
//! - `Store`: the engine - local tree, mount table, request correlation,
//!   and the subscription graph
//!
//! The core is pure with respect to transport: give a store a send hook
//! with [`Store::transmit`], and drive it with incoming messages through
//! [`Store::receive`]. Byte serialization of messages is the transport's
//! business.
//!
//! # Example
//!
//! ```
//! use entangld::{Store, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), entangld::Error> {
//! let store: Store<&'static str> = Store::new();
//! store.set("system.voltage", Value::from(33))?;
//! assert_eq!(store.get("system.voltage").await?, Some(Value::from(33)));
//!
//! // A callable leaf answers a parameterized get
//! store.set(
//!     "double.me",
//!     Value::callable(|params| match params {
//!         Some(Value::Integer(n)) => Value::Integer(2 * n),
//!         _ => Value::Null,
//!     }),
//! )?;
//! assert_eq!(
//!     store.get_with("double.me", Value::from(2)).await?,
//!     Some(Value::from(4))
//! );
//! # Ok(())
//! # }
//! ```

mod error;
mod message;
mod path;
mod store;
mod subscription;
mod value;

pub use error::Error;
pub use message::{Message, MessageKind};
pub use path::Path;
pub use store::{SendFn, Store};
pub use subscription::{EventCallback, SubscriptionInfo};
pub use value::{Callable, Resolved, Value};
