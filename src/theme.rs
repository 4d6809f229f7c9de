pub mod manifest;
pub mod renderer;

pub use manifest::{ThemeManifest, ThemeSelection};
pub use renderer::MiniJinjaRenderer;
