pub mod error;
pub mod field;
pub mod march;
pub mod mesh;
pub mod metaballs;
pub mod plugin;
pub mod tables;
pub mod types;

pub use plugin::MetaballsPlugin;
