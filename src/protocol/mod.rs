//! Connection protocol types.
//!
//! # Data Flow
//! ```text
//! transport
//!     → ConnectionContext + Inbound + Outbound
//!     → App::call (engine → pipeline → dispatcher)
//!     → OutboundMessage* back to the transport
//! ```
//!
//! # Design Decisions
//! - Messages are closed enums, so a phase check is a `match`, not a string compare
//! - Channels are traits; interceptors wrap `&mut dyn Outbound` rather than
//!   owning it, so a wrapper can keep emitting after the inner stage returns
//! - Wrong-phase messages are `EngineError::Protocol`, fatal to one
//!   connection only

pub mod channel;
pub mod context;
pub mod guard;
pub mod message;

pub use channel::{connection_channels, ChannelInbound, ChannelOutbound, Peer};
pub use context::{AuthTags, ConnectionContext, ConnectionKind, HeaderList, QueryParams};
pub use guard::{ResponseGuard, ResponsePhase};
pub use message::{read_body, App, Frame, FrameKind, Inbound, InboundMessage, Outbound, OutboundMessage};
