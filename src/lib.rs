//! Record keyboard and mouse input with precise timing, sample the input
//! state at a fixed rate, and replay recordings through interchangeable
//! injection backends.

pub mod backend;
pub mod config;
pub mod event;
pub mod frame;
pub mod key;
pub mod log;
pub mod recorder;
pub mod replay;
pub mod sampler;
pub mod storage;

pub use backend::{Backend, BackendError, BackendMode};
pub use config::Config;
pub use event::{EventKind, InputEvent};
pub use key::{ButtonId, KeyIdentifier};
pub use log::EventLog;
pub use replay::{ReplayReport, ReplayState, Replayer, StopSignal, replay};
pub use sampler::{InteractionState, state_at};
