pub mod renderer;

pub use renderer::frontend::{RenderFrontend, Status};
pub use renderer::{
    ErrorKind,
    PresentMode,
    PresentOutcome,
    RenderConfig,
    RenderError,
    RenderResult,
    Renderer,
};
