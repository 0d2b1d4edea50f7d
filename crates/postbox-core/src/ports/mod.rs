//! Ports: the seams to things outside the dispatch core.
//!
//! - [`DeliveryTransport`]: the email provider.
//! - [`Clock`] and [`IdGenerator`]: time and id sources, swappable in tests.

pub mod clock;
pub mod id_generator;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::transport::{DeliveryContext, DeliveryTransport, OutboundMessage, TransportError};
