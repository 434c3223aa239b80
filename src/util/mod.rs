pub mod paths;
pub mod signals;

pub use paths::Paths;
