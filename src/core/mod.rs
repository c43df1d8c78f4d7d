//! Core domain models: parameter spaces, task instances and the instance DAG.

pub mod dag;
pub mod expr;
pub mod instance;
pub mod param;
pub mod template;

pub use dag::{Dependency, InstanceDAG};
pub use instance::{ArtifactManifest, InstanceKey, InstanceStatus, TaskInstance};
pub use param::{enumerate, ParamValue, ParameterAxis, ParameterVector};
pub use template::TemplateContext;
