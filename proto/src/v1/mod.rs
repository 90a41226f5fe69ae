mod flow;
mod source;

pub use self::flow::*;
pub use self::source::*;
