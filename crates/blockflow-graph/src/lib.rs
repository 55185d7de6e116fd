pub mod flat;
pub mod flatten;
pub mod node;
pub mod schedule;

pub use flat::{build, Edge, FlatGraph, FlatNode};
pub use flatten::flatten;
pub use node::{GraphDef, NodeDef, UpstreamRef};
pub use schedule::ScheduleHint;
