mod settings;

pub use settings::{
    AmqpConfig, BackendKind, DatabaseConfig, ManagementConfig, QueuesConfig, RoleBackends,
    Settings,
};
