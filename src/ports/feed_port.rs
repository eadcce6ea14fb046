//! Input ports: exchange refresh cycles and operator assignment exports.

use crate::domain::error::ReconError;
use crate::domain::payload::CycleInput;
use crate::domain::strategy::AssignmentImport;

pub trait FeedPort {
    fn load_cycles(&self) -> Result<Vec<CycleInput>, ReconError>;
}

pub trait AssignmentSource {
    fn load_assignments(&self) -> Result<AssignmentImport, ReconError>;
}
