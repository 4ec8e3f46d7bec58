pub mod compute_engine;
pub mod templates;

pub use compute_engine::{CasaEngine, ComputeEngine, EngineOutput};
pub use templates::{Template, TemplateParams};
