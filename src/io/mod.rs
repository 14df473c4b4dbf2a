//! Plain parameter-tree I/O
//!
//! SafeTensors import and export for unsharded trees, used to bring in
//! converted pretrained weights and to export trained ones.

mod load;
mod save;


pub use load::load_safetensors;
pub use save::save_safetensors;
