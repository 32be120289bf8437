//! OAuth token broker for the GDP REST API
//!
//! - [`Token`]: opaque access token with absolute expiry
//! - [`TokenExchange`]: one grant exchange against the token endpoint
//! - [`TokenBroker`]: cache plus single-flight refresh shared by all callers

mod broker;
mod exchange;
mod token;

pub use broker::TokenBroker;
pub use exchange::{HttpTokenExchange, TokenExchange, parse_token_response};
pub use token::Token;
