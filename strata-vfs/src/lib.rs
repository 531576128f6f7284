pub mod local;
pub mod range;
pub mod root;
pub mod symlink;
pub mod zip;

pub use root::{File, FileInfo, FileMode, Root, Vfs};
