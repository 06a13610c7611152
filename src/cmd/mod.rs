//! CLI command implementations.
//!
//! | Module   | Commands handled                        |
//! |----------|-----------------------------------------|
//! | `serve`  | `Serve`                                 |
//! | `users`  | `InitDb`, `CreateUser`, `RotateToken`   |
//! | `config` | `Config`                                |

pub mod config;
pub mod serve;
pub mod users;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use users::{cmd_create_user, cmd_init_db, cmd_rotate_token};
