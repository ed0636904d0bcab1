//! VESTA - Verification Engine for Scan-Tested Automation
//!
//! Verifies the logic of a running controller by writing and reading tags over
//! EtherNet/IP and judging how values change within timing windows.
//!
//! All wire traffic funnels through one [`Scheduler`](scheduler::Scheduler)
//! worker, so at most one request is ever in flight. The [`Engine`] interprets
//! a project of action sets and units and streams an [`ActionResult`] for
//! every step.
//!
//! # Examples
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> vesta::Result<()> {
//! use std::sync::Arc;
//! use vesta::client::PlcClient;
//! use vesta::project::ProjectConfig;
//! use vesta::protocols::Simulator;
//! use vesta::scheduler::Scheduler;
//! use vesta::{Config, Engine, TagTable};
//!
//! let config = Config::default();
//! let project = ProjectConfig::from_yaml(r#"
//! id: 1
//! name: "Smoke"
//! tags:
//!   - { id: 1, name: "int0", data_type: INT }
//! action_sets:
//!   - id: 1
//!     name: "Basics"
//!     units:
//!       - { id: 1, name: "Write", type: set_values, values: [{ tag_id: 1, to_value: 123 }] }
//!       - { id: 2, name: "Verify", type: check_values, values: [{ tag_id: 1, to_value: 123 }] }
//! "#)?;
//!
//! let tags = TagTable::from_configs(&project.tags)?;
//! let client = PlcClient::new(Arc::new(Simulator::new()), Scheduler::new(&config.scheduler), tags);
//! client.open("127.0.0.1", 0, config.connection.timeout()).await?;
//!
//! let report = Engine::new(project, client, config.engine).run(None).await?;
//! assert_eq!(report.failed, 0);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// CORE MODULES
// ============================================================================

/// Error type shared by every module
pub mod error;
/// Tag values and native data types
pub mod value;
/// Tag name resolution into protocol paths
pub mod address;
/// Tags and the shared tag table
pub mod tag;
/// Runtime configuration
pub mod config;
/// Project descriptors
pub mod project;

// ============================================================================
// COMMUNICATION
// ============================================================================

/// Serialized priority job runner
pub mod scheduler;
/// Controller backends
pub mod protocols;
/// Polling loop
pub mod scan;
/// Scheduled tag operations
pub mod client;

// ============================================================================
// EXECUTION
// ============================================================================

/// Cancellable timers
pub mod timer;
/// Typed test steps
pub mod actions;
/// Step results and run report
pub mod result;
/// Project interpreter
pub mod engine;

pub use client::PlcClient;
pub use config::Config;
pub use engine::Engine;
pub use error::{PlcError, Result};
pub use result::{ActionResult, RunReport, RunStatus};
pub use tag::{Tag, TagTable};
pub use value::Value;

/// VESTA version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the tracing subscriber
///
/// Honours `RUST_LOG`; defaults to `vesta=info`. Calling it again is harmless.
pub fn init() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vesta=info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    if subscriber.try_init().is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
