mod helpers;
mod keys;
mod token;

pub use helpers::{
    TokenValidationError, ValidatedToken, extract_basic_auth_token, extract_token_from_header,
    validate_token,
};
pub use keys::{AuthorizedKey, find_matching_key, fingerprint, parse_authorized_key};
pub use token::{TokenGenerator, parse_token};
