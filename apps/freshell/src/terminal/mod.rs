pub mod render;

pub use render::{render, RenderOptions};
