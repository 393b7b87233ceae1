//! # apiary-collab: WebSocket transport for the Apiary coordinator
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket    ┌──────────────────┐   mpsc   ┌────────────┐
//! │ participant │ ◄────────────► │ handle_connection│ ───────► │  hub task  │
//! │             │  bincode Frame │  (per socket)    │          │  Session   │
//! └─────────────┘                └────────▲─────────┘          └─────┬──────┘
//!                                         │                          │
//!                                         └──── BroadcastGroup ◄─────┘
//!                                              (Audience filter)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire frames: `Request`, `Event`
//! - [`broadcast`]: encoded fan-out with audiences
//! - [`roster`]: connected participants
//! - [`hub`]: the single task owning the coordinator
//! - [`server`]: WebSocket accept loop and connection tasks

pub mod broadcast;
pub mod hub;
pub mod protocol;
pub mod roster;
pub mod server;

pub use broadcast::{Audience, BroadcastGroup, BroadcastStats, Delivery};
pub use hub::{spawn_hub, CoordinatorHandle, HubConfig, HubError, Outbound, Session};
pub use protocol::{
    Body, CollectionSummary, Event, ExecutionSummary, Frame, ProtocolError, Request,
};
pub use roster::{OnlineUser, Roster};
pub use server::{ApiaryServer, ServerConfig, ServerStats};
