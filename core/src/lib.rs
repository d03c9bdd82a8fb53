pub mod blobs;
pub mod channels;
pub mod chat;
pub mod clock;
pub mod db;
pub mod dms;
pub mod error;
pub mod friends;
pub mod guard;
pub mod invites;
pub mod messages;
pub mod model;
pub mod scheduler;
pub mod servers;
pub mod typing;
pub mod users;

pub use blobs::{BlobMeta, BlobStore, FsBlobStore};
pub use chat::{Change, ChangeScope, Chat};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ChatError, Result};
pub use model::*;
