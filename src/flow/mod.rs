pub mod definition;
pub mod edge;
pub mod mapper;
pub mod router;

pub use definition::{default_edges, load_flow_specs, save_flow_specs, FlowSpec};
pub use edge::{EdgeTransform, FlowEdge, FlowInfo, FlowTarget, TransformFn, BROADCAST_TARGET};
pub use mapper::{CopyKey, CopyMapper, Mapper, MapperError, RenameMapper, ScriptMapper, SourceField};
pub use router::{FlowError, FlowOutcome, FlowRouter};
