pub mod health;
pub mod diagnostics;
pub mod doc;
pub mod document;
pub mod lorodoc;
pub mod messages;
pub mod principal;
pub mod error;

pub use health::*;
pub use diagnostics::*;
pub use doc::*;
pub use document::*;
pub use messages::*;
pub use principal::*;
pub use error::*;
