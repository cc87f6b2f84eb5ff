//! Digest authentication (4.3): challenge issuance, response verification,
//! and the nonce table that backs replay/expiry rejection.

pub mod digest;
pub mod nonce;

pub use digest::{verify_response, Algorithm, Challenge, Credentials};
pub use nonce::NonceTable;
