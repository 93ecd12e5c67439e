pub mod apdu;
pub mod cap;
pub mod dictionary;
pub mod error;
pub mod session;
pub mod tlv;
pub mod transport;
pub mod util;

pub use error::{Error, Result};
pub use session::Session;
