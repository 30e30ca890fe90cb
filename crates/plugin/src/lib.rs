pub mod context;
pub mod executor;
pub mod hooks;
pub mod registry;
pub mod sse;
pub mod stream;
pub mod url;

pub use context::{PluginContext, PluginHttpResponse};
pub use executor::PluginChain;
pub use hooks::{Plugin, PluginError, StreamContext};
pub use registry::{AcquiredPlugins, PluginFactory, PluginInstance, PluginRegistry};
pub use url::PluginUrl;
