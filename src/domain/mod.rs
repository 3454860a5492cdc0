pub mod forecast;
pub mod site;

pub use forecast::*;
pub use site::*;
