pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod ntc;
pub mod peripherals;
pub mod presence;
pub mod schedule;
pub mod store;
pub mod topics;
pub mod types;

pub use api::FanControlApi;
pub use cache::{ConfigCache, ConfigSnapshot};
pub use config::{HardwareConfig, PresenceKind, RuntimeConfig};
pub use engine::{decide, Decision, DutyReason, FanEngine};
pub use error::{ActuatorError, ConfigError, StoreError};
pub use peripherals::{command_duty, FanActuator, PresenceSensor, TemperatureSensor};
pub use presence::{
    DigitalInput, MotionDebouncer, MotionSensor, Polarity, PresenceEdge, PresenceInput,
    ProximitySensor,
};
pub use schedule::{ProgramSlot, SlotTable, TimeOfDay, SLOT_COUNT};
pub use store::{KvStore, MemoryStore};
pub use topics::*;
pub use types::{ControllerStatus, FanConfig, FanMode, SlotPayload, SlotSummary};
