// Pure processing helpers used by the stages: templating, JSON paths, excerpts, transforms

pub mod excerpt;
pub mod json_path;
pub mod summary;
pub mod template;
pub mod transforms;

pub use template::{Template, TemplateError};
pub use transforms::{NamedTransform, TransformContext, TransformRegistry, UrlResolver};
