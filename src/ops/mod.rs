//! Pipeline glue: contexts, the build operation, and exit-code mapping.

mod build;
mod context;
mod error;

pub use build::{build, load_root, resolve_graph, BuildRequest};
pub use context::Context;
pub use error::{exit_code, Error};
