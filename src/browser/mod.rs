pub mod chrome;
pub mod navigation;
pub mod session;

pub use chrome::ChromeBrowser;
pub use navigation::NavigationManager;
pub use session::{Session, SessionState};
