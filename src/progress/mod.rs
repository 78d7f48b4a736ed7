pub mod bus;
pub mod event;

pub use bus::{spawn_heartbeat, ProgressBus, Subscription};
pub use event::{EventKind, ProgressEvent, SessionId};
