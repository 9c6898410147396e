pub mod envelope;
pub mod reseal;

pub use envelope::{EnvelopeError, EnvelopeKeyring};
pub use reseal::{KeystreamLimbCipher, LimbCipher, ResealKey, ResealedOutput};
