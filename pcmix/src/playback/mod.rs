//! Players, the mixer and the process-wide context

pub mod context;
pub mod host;
pub mod mixer;
pub mod player;

pub use context::{Context, ContextConfig};
pub use host::{Hook, Host, ManualHost};
pub use mixer::{MixOutput, Mixer, MuxPlayer};
pub use player::{Player, PlayerId, PlayerState};
