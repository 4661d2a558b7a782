//! Client-side message store for WorkiT: conversations, messages and
//! notifications for the signed-in user, mirrored to local storage and
//! synchronised with the messaging API when it is reachable.

pub mod config;
pub mod error;
pub mod persistence;
pub mod remote;
pub mod scheduler;
pub mod seed;
pub mod store;

pub use config::{ReplySimulation, StoreConfig};
pub use error::StoreError;
pub use persistence::{Persistence, Snapshot};
pub use remote::{HttpRemote, NewMessage, OutgoingAttachment, RemoteError, RemoteService};
pub use store::{LOCAL_ID_PREFIX, MessageStore, Tier, is_local_id};
