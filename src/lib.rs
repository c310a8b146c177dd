//! A reverse TCP tunnel that exposes ports behind NAT through a public
//! server.
//!
//! Two processes cooperate. The **server** runs on a publicly reachable
//! host: it accepts client control sessions on a single control port and
//! binds one public listener per registered tunnel. The **client** runs
//! next to the services being exposed: it keeps a persistent control
//! session open, registers its configured tunnels, and serves data
//! channels on demand.
//!
//! Every external connection to a public port goes through a rendezvous:
//! the server parks the accepted socket under a fresh connection id and
//! notifies the client; the client dials its local service, arms a
//! one-shot data listener, and reports the listener's port; the server
//! dials that port and splices the two sockets until either side closes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod client;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod server;
