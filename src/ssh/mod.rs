//! SSH front end of the gateway.
//!
//! Accepts SSH connections from Git clients without authenticating them,
//! parses `exec` requests naming one of the Git transport commands, and
//! bridges the channel to a local `git-upload-pack`, `git-receive-pack` or
//! `git-upload-archive` process serving a repository under the configured
//! root.  Everything else a client asks for is refused.

pub mod bridge;
pub mod channel;
pub mod command;
pub mod multiplexer;
pub mod router;
pub mod server;
pub mod session;

#[cfg(test)]
pub mod testing;

pub use server::start_ssh_server;
