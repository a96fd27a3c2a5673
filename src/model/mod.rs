pub mod agreement;
pub mod combination;
pub mod common;
pub mod decision;
pub mod job;
pub mod response;

pub use agreement::*;
pub use combination::*;
pub use common::*;
pub use decision::*;
pub use job::*;
pub use response::*;
