pub mod boost;
pub mod button;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod notifier;
pub mod persistence;
pub mod relay;
pub mod schedule;
pub mod types;

pub use clock::{CurrentTime, DateTimeParts, HardwareClock};
pub use config::{BoostConfig, HardwareConfig, RuntimeConfig, TimingConfig};
pub use controller::{BootReport, BootSource, BoostSource, ControllerEvent, HeatingController};
pub use error::{CommandError, RequestError, StoreError, ValidationError};
pub use persistence::{KeyValueStore, LoadedState, MemoryStore, PersistenceGateway, StoredValue};
pub use relay::{RelayActuator, RelayOutputs, RelayPins, RelayState};
pub use schedule::{DayMask, DayOfWeek, ScheduleSlot, ScheduleTable};
pub use types::{ApiReply, ApiRequest, ErrorBody, StatusPayload};
