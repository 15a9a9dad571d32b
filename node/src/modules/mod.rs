//! Role modules hosted by node processes

pub mod backend;
pub mod config_bootstrapper;
pub mod front_end;
pub mod gateway;

use crate::bootstrap::ModuleRegistry;
use shared::Role;

pub use backend::BackendModule;
pub use config_bootstrapper::ConfigBootstrapperModule;
pub use front_end::FrontEndModule;
pub use gateway::DedicatedServerGateway;

/// Registry with the module of every role
pub fn default_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register(Role::ConfigBootstrapper, ConfigBootstrapperModule::create)
        .register(Role::Backend, BackendModule::create)
        .register(Role::FrontEnd, FrontEndModule::create);
    registry
}
