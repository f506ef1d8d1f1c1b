pub mod invitation;
pub mod loopback;
pub mod registration;
pub mod transport;

pub use invitation::{IncomingCallGate, IncomingInvitation};
pub use loopback::{LoopbackOption, LoopbackTransport};
pub use registration::{RegisterOption, RegistrationStatus, UserCredential};
pub use transport::{SessionHandle, SignalingError, SignalingTransport};
