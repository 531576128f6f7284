pub mod reader;
pub mod redirects;
pub mod response;

pub use reader::{Reader, ServeParams};
pub use response::Body;
