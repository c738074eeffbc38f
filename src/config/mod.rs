// 运行时与后端配置

pub mod backend;
pub mod env;
pub mod runtime;

pub use backend::BackendConfig;
pub use env::EnvConfig;
pub use runtime::RuntimeConfig;
