pub mod cache;
pub mod resolver;

pub use cache::{CacheRegistry, OnCallCache};
pub use resolver::{
    resolve_on_call_target, resolve_overwrite_target, sanitize_transfer_target, user_id_for_agent,
    user_transfer_target,
};
