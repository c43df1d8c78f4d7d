use thiserror::Error;

/// Problems with the pipeline definition itself.
///
/// These are always detected while loading the pipeline or building the
/// instance graph, before any external process is spawned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Kind '{kind}': axis '{axis}' has no values")]
    EmptyAxis { kind: String, axis: String },

    #[error("Kind '{kind}': axis '{axis}' declared more than once")]
    DuplicateAxis { kind: String, axis: String },

    #[error("Kind '{0}' declared more than once")]
    DuplicateKind(String),

    #[error("Kind '{kind}' depends on unknown kind '{target}'")]
    UnknownKind { kind: String, target: String },

    #[error("Kind '{kind}' references unknown axis '{axis}' of kind '{owner}'")]
    UnknownAxis {
        kind: String,
        owner: String,
        axis: String,
    },

    #[error("Kind '{kind}': dependency alias '{alias}' used more than once")]
    DuplicateAlias { kind: String, alias: String },

    #[error("{instance}: no instance of '{target}' matches {predicate}")]
    NoMatch {
        instance: String,
        target: String,
        predicate: String,
    },

    #[error("{instance}: {count} instances of '{target}' match {predicate}, expected exactly one")]
    AmbiguousMatch {
        instance: String,
        target: String,
        predicate: String,
        count: usize,
    },

    #[error("Dependency cycle: {0}")]
    Cycle(String),

    #[error("Kind '{kind}': invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        kind: String,
        pattern: String,
        reason: String,
    },

    #[error("Kind '{kind}': invalid expression '{expr}': {reason}")]
    InvalidExpression {
        kind: String,
        expr: String,
        reason: String,
    },

    #[error("Kind '{kind}': unknown placeholder '{{{placeholder}}}'")]
    UnknownPlaceholder { kind: String, placeholder: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Fetch of {locator} failed: {reason}")]
    Fetch { locator: String, reason: String },

    #[error("Program not found on PATH: {0}")]
    ProgramNotFound(String),

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Worker pool is full (max {max})")]
    WorkerPoolFull { max: usize },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the error comes from a broken pipeline definition rather than
    /// from the environment.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
