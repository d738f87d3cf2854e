pub mod errors;
pub mod events;
pub mod identity;
pub mod ids;

pub use errors::{DeliveryError, PresenceError};
pub use identity::{Channel, Identity, IdentityKind, PresenceProjection, PresenceStatus};
pub use ids::{IdentityId, SessionId};
