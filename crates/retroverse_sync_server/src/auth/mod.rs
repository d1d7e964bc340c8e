mod middleware;

pub use middleware::{OptionalUser, RequireUser, UserAuth, bearer_token};
