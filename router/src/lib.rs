pub mod algo;
pub mod check;
pub mod graph;
pub mod grid;
pub mod path;
pub mod router;
pub mod session;
pub mod utils;

pub use session::{CancelToken, NetOutcome, RoutingReport, RoutingSession, SessionProgress};

use mep_common::db::core::Scene;
use mep_common::error::RoutingError;
use mep_common::util::config::Config;

/// Builds the space for `scene` and routes all of its nets.
pub fn route(scene: &Scene, config: &Config) -> Result<RoutingReport, RoutingError> {
    let mut session = RoutingSession::new(scene, config)?;
    session.run(&scene.nets)
}
