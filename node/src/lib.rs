//! # Game Backend Node
//!
//! A node process hosts exactly one service role of the game backend. The
//! launcher spawns one node per role and talks to it over a control channel
//! on stdin/stdout; everything the node logs goes to stderr.
//!
//! ## Roles
//!
//! ### ConfigBootstrapper
//! Publishes its local configuration file as the cluster configuration.
//! Every other role merges that published document with its own local file
//! before it starts.
//!
//! ### Backend
//! Hosts the actor runtime: one [`game_session::GameSession`] actor per
//! running lobby and one [`dedicated_server::DedicatedServer`] actor per
//! physical dedicated server. Front-ends reach it over framed TCP; dedicated
//! servers enroll through a separate gateway listener.
//!
//! ### FrontEnd
//! Terminates player connections. Each accepted connection authenticates,
//! joins a session and forwards lobby state changes through the backend.
//!
//! ## Actor Model
//!
//! Actors run one turn at a time on their own mailbox task and are addressed
//! by a stable key through an [`actor::ActorDirectory`], which activates them
//! on first use and deactivates them when idle. Every message carries the
//! call chain that produced it:
//! - a non-reentrant actor refuses a call whose chain already contains it,
//!   since queueing that call would deadlock
//! - a reentrant actor runs such a call while its outer turn is suspended
//!
//! Dedicated servers are reentrant. Withdrawing one closes the session that
//! holds it, and that session releases the server again from inside the same
//! chain.
//!
//! ## Module Organization
//!
//! - [`bootstrap`]: configuration loading, module registry and the
//!   readiness/finalize handshake
//! - [`modules`]: the module of each role
//! - [`actor`]: mailbox actors, call chains and the directory
//! - [`dedicated_server`], [`game_session`], [`server_pool`], [`sink`]: the
//!   backend actors and their collaborators
//! - [`cluster`]: coordination storage, the service registry and backend
//!   access, in-process or remote
//! - [`edge`]: the front-end edge service and its collaborators
//! - [`config`], [`error`], [`trap`], [`drain`]: configuration, error types,
//!   the background failure trap and listener shutdown
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use node::bootstrap::{ModuleBootstrap, NodeArgs};
//! use node::modules::default_registry;
//! use shared::Role;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let args = NodeArgs {
//!         node_name: "node-1".to_string(),
//!         role: Role::Backend,
//!         config: "config/node.toml".into(),
//!         overrides: "backend.session_capacity=32".to_string(),
//!         signal: "node-1.Backend.manual".to_string(),
//!     };
//!
//!     // Runs until the launcher sends Finalize, stdin closes or Ctrl-C
//!     ModuleBootstrap::new(args, default_registry())
//!         .run(tokio::io::stdin(), tokio::io::stdout())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod dedicated_server;
pub mod drain;
pub mod edge;
pub mod error;
pub mod game_session;
pub mod modules;
pub mod server_pool;
pub mod sink;
pub mod trap;
