pub mod clock;
pub mod dial_buffer;
pub mod line;
pub mod session;
#[cfg(test)]
mod tests;

pub use clock::{format_duration, DurationClock};
pub use line::{LineSnapshot, PhoneLine, PhoneLineBuilder};
pub use session::{CallDirection, CallSnapshot, CallState};
