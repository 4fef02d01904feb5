//! Job commands.
//!
//! Each command owns its side effects against the registry and the
//! supervisor and returns plain data; the CLI layer decides how to render it.

mod inspect;
mod launch;
mod manage;

pub(crate) use inspect::{list, status, ListFilter};
pub(crate) use launch::{launch_new, LaunchInput, LaunchRequest};
pub(crate) use manage::{parse_older_than, prune, remove, stop};
