pub mod app;
pub mod bus;
pub mod config;
pub mod event;
pub mod flow;
pub mod logger;
pub mod module;
pub mod orchestrator;
pub mod schema;
pub mod state;

pub use app::{standard_modules, App};
pub use bus::{EventBus, Subscription, Topic};
pub use config::{ConfigManager, CoreConfig};
pub use event::{Collection, ErrorKind, ErrorReport, Event, EventKind, RecoveryKind};
pub use flow::{FlowEdge, FlowRouter, FlowTarget, Mapper};
pub use module::{DependencyResolver, FeatureModule, ModuleContext, ModuleDescriptor};
pub use orchestrator::{Health, IntegrationStatus, Orchestrator, OrchestratorError};
pub use state::{AppState, Entry, StateStore};
