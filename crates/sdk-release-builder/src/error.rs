use std::fmt;

/// Failure categories for a release run. Every category is fatal; the only
/// recovery path is re-invoking the pipeline, which resumes from on-disk
/// checkpoints.
#[derive(Debug)]
pub enum Error {
    /// Malformed or incomplete manifest; nothing has run yet.
    Config(String),
    /// Source retrieval failed; the fetch checkpoint is left unset.
    Fetch(String),
    /// An external tool exited nonzero (or a local filesystem step failed).
    Command(String),
    /// Profile resolution, setup, or teardown failed.
    Profile(String),
    /// Packing or indexing failed; the store is left as the packer left it.
    Packaging(String),
}

impl Error {
    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    pub fn fetch<M: Into<String>>(msg: M) -> Self {
        Self::Fetch(msg.into())
    }

    pub fn command<M: Into<String>>(msg: M) -> Self {
        Self::Command(msg.into())
    }

    pub fn profile<M: Into<String>>(msg: M) -> Self {
        Self::Profile(msg.into())
    }

    pub fn packaging<M: Into<String>>(msg: M) -> Self {
        Self::Packaging(msg.into())
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config error",
            Self::Fetch(_) => "fetch error",
            Self::Command(_) => "command error",
            Self::Profile(_) => "profile error",
            Self::Packaging(_) => "packaging error",
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Config(m)
            | Self::Fetch(m)
            | Self::Command(m)
            | Self::Profile(m)
            | Self::Packaging(m) => m,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::command(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
