//! Domain model (addresses, events, outcomes, states, ids, environment).

pub mod address;
pub mod environment;
pub mod event;
pub mod ids;
pub mod outcome;
pub mod state;

pub use address::{Address, AddressField};
pub use environment::{Environment, EnvironmentPolicy};
pub use event::{EmailEvent, SendParams, SendResponse};
pub use ids::{MessageId, ParseMessageIdError};
pub use outcome::DeliveryOutcome;
pub use state::DeliveryState;
