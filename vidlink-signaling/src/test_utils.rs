mod messages;
mod relay;

pub use messages::*;
pub use relay::*;
