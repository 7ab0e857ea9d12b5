//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `up`     | `Up`             |
//! | `tree`   | `Tree`           |
//! | `config` | `Config`         |

pub mod config;
pub mod tree;
pub mod up;

pub use config::cmd_config;
pub use tree::cmd_tree;
pub use up::cmd_up;
