//! Content Controller - state coordination core for a content cluster.
//!
//! The controller watches a fixed set of distributor and storage nodes,
//! derives one authoritative cluster state from what they report and what
//! operators want, versions it, and pushes it to every node while tracking
//! convergence. Redundant controller replicas elect a single master through
//! a shared coordination store.
//!
//! # Features
//!
//! - **Deterministic state generation**: node observations and policy in,
//!   annotated cluster state out.
//! - **Stability tracking**: grace periods, init timeouts and a premature
//!   crash circuit breaker.
//! - **Versioned publishing**: strictly increasing versions with bounded
//!   history and publish hysteresis.
//! - **Master election**: majority votes with a cooldown after master loss.
//! - **Two-phase broadcast**: optional deferred activation and convergence
//!   gated task completion.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Controller (control loop)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Inputs: Node lookup | State gatherer | Remote tasks         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  State: Node registry | State change handler | Stats         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Decisions: Generator | Version tracker | Master election    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Outputs: Coordination store | Broadcaster                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use content_controller::cluster::SharedNodeLookup;
//! use content_controller::config::ControllerConfig;
//! use content_controller::controller::ControllerServices;
//! use content_controller::database::MemoryDatabase;
//! # use content_controller::communicator::Communicator;
//! # fn communicator() -> std::sync::Arc<dyn Communicator> { unimplemented!() }
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> content_controller::Result<()> {
//!     let config = ControllerConfig::development(4);
//!     let services = ControllerServices::new(
//!         Arc::new(MemoryDatabase::new()),
//!         communicator(),
//!         Box::new(SharedNodeLookup::new()),
//!     );
//!     content_controller::run(config, services).await
//! }
//! ```

pub mod broadcast;
pub mod clock;
pub mod cluster;
pub mod communicator;
pub mod config;
pub mod controller;
pub mod database;
pub mod election;
pub mod error;
pub mod events;
pub mod gatherer;
pub mod generator;
pub mod observability;
pub mod state;
pub mod state_change;
pub mod stats;
pub mod tasks;
pub mod tracker;

// Re-exports
pub use controller::{Controller, ControllerEvent, ControllerServices};
pub use error::{ControllerError, Result};
pub use state::{ClusterState, ClusterStateBundle, Node, NodeState, NodeType, State};

use config::ControllerConfig;
use tokio::sync::watch;
use tracing::{info, warn};

/// Run a controller replica until SIGINT or a fatal error.
pub async fn run(config: ControllerConfig, services: ControllerServices) -> Result<()> {
    if let Err(e) = observability::init(&config.observability) {
        warn!(error = %e, "Logging already initialized");
    }
    info!(identity = %config.identity(), "Starting controller");

    let mut controller = Controller::new(config, services)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGINT");
                // Dropping the sender would stop the controller.
                std::future::pending::<()>().await;
            }
        }
    });

    controller.run(shutdown_rx).await
}
