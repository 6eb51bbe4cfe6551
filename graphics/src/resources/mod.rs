//! Scene resources shared between pipelines.
//!
//! - [`SharedBlock`] - a reference-counted GPU block
//! - [`SharedBuffer`] - a vertex or instance buffer, standalone or inside a block
//! - [`TextureSource`] - an externally owned image plus its companion metadata

mod block;
mod buffer;
mod texture;

pub use block::SharedBlock;
pub use buffer::SharedBuffer;
pub use texture::{SharedTexture, StaticTexture, TextureSource, share_texture};
