pub mod rules;
pub mod service;

pub use rules::TestRules;
pub use service::{get, post_check};
