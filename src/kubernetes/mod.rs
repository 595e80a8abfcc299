pub mod api;
pub mod circle;
pub mod controller;
pub mod discovery;
pub mod module;
pub mod watch;

pub use circle::{Circle, CircleStatus};
pub use module::Module;

/// Error type for controller operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Kube API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// App error
    #[error("App error: {0}")]
    App(#[from] crate::error::AppError),

    /// Other errors
    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
