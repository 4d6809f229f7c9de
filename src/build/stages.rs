pub mod assemble;
pub mod assets;
pub mod finalize;
pub mod load;
pub mod render;
