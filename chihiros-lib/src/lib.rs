pub mod commands;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod dose;
pub mod engine;
pub mod error;
pub mod event;
pub mod frame;
pub mod message_id;
pub mod sequencer;
pub mod totals;
pub mod transport;
pub mod weekday;


// Re-export the types most callers need
pub use config::EngineConfig;
pub use dose::DoseQuantity;
pub use engine::{ConnectionEngine, DisconnectReason, ListenerId, SessionState};
pub use error::{ChihirosError, Result, TransportError};
pub use event::{DecodedEvent, decode_frame, parse_frame};
pub use frame::{Frame, build_frame};
pub use message_id::{MessageId, MessageIdCounter};
pub use sequencer::{CommandSequencer, WeeklySchedule};
pub use totals::parse_totals_frame;
pub use transport::Transport;
pub use weekday::{DaySelect, Weekday, WeekdaySet};
