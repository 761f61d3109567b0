pub mod descriptor;
pub mod resolver;

pub use descriptor::{FeatureModule, FnModule, ModuleContext, ModuleDescriptor, ModuleState, NoopModule};
pub use resolver::{DependencyResolver, LoadReport, Readiness, ResolverError, DEFAULT_CRITICAL_PRIORITY};
