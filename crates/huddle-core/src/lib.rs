//! # huddle-core
//!
//! Room membership and message lifecycle engine for Huddle.
//!
//! - **Store** - SQLite persistence of users, rooms and messages
//! - **Hub** - live connections, their users and room subscriptions
//! - **Engine** - the single actor that applies every state change
//! - **Services** - file storage and link preview collaborators
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  Action  ┌─────────────┐   tx    ┌─────────────┐
//! │  Gateway    │─────────▶│   Engine    │────────▶│   Store     │
//! └─────────────┘          └─────────────┘         └─────────────┘
//!        ▲                        │ outbox (after commit)
//!        │ Event           ┌─────────────┐
//!        └─────────────────│    Hub      │
//!                          └─────────────┘
//! ```

mod broadcast;
pub mod clock;
pub mod engine;
pub mod error;
pub mod hub;
mod lifecycle;
mod membership;
pub mod services;
pub mod store;

pub use broadcast::room_snapshot;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, EngineConfig, EngineHandle, FileArrival, SweepReport};
pub use error::{CoreError, CoreResult};
pub use hub::{ConnId, EventReceiver, Hub, HubStats};
pub use services::{FileStore, LinkPreviewer, MemoryFileStore, NoPreviews, StoredFile};
pub use store::{Store, StoreConfig};
