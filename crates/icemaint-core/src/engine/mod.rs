//! Engine facade owning the maintenance collaborators.

mod maintenance;

pub use maintenance::MaintenanceEngine;
