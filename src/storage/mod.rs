pub mod files;
pub mod keys;
pub mod metadata;

pub use files::*;
pub use keys::KeyEncoder;
pub use metadata::*;
