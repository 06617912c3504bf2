//! Local mirror for the ClamAV signature feed.
//!
//! Full databases (`<db>.cvd`) and incremental diffs (`<db>-<version>.cdiff`)
//! are pulled from an upstream mirror on a timer and re-served over HTTP to
//! downstream `freshclam` clients.
//!
//! The updater tasks and the HTTP server never share in-memory state.  They
//! meet only in the data directory: the updater stages every file and
//! renames it into place before recording its version, and the server opens
//! whatever is published at the time of the request.

pub mod config;
pub mod cvd;
pub mod fetcher;
pub mod mirror;
pub mod oracle;
pub mod policy;
pub mod server;
pub mod store;
pub mod types;
pub mod updater;
