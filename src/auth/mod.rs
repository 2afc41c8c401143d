//! Authentication: cookie sessions, API keys and one-time action tokens

mod action_tokens;
mod api_keys;
mod sessions;

pub use action_tokens::{
    generate_action_token, validate_action_token, TokenValidation, ACTION_TOKEN_PREFIX,
};
pub use api_keys::{authenticate_api_key, generate_api_key};
pub use sessions::{SessionAuth, SessionService};
