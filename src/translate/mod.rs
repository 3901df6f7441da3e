//! Rate-limited, order-preserving sentence translation (§4.6, §4.7).

pub mod dispatcher;
pub mod ordered_sender;
pub mod provider;
pub mod token_bucket;
