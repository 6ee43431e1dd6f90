pub mod ecies;
pub mod error;
pub mod keys;
pub mod recovery;
pub mod truthful;

pub use ecies::{decrypt, encrypt};
pub use error::{CryptoError, Result};
pub use keys::TaskKeypair;
pub use recovery::{address_of, keccak256, recover_public_key};
pub use truthful::{result_digest, sign_result, verify_truthful_node};
