mod user;

pub use user::{cmd_user_add, cmd_user_list, cmd_user_reset_secret};
