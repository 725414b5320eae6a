pub mod health;
pub mod diagnostics;
pub mod documents;

pub use health::*;
pub use diagnostics::*;
pub use documents::*;
