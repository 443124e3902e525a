pub mod binding;
pub(crate) mod control;
pub mod kernel;
pub mod session;
pub mod state;

pub use binding::{BindingHandle, BindingHost, LocalBindingHost};
pub use kernel::SessionKernel;
pub use session::{Role, SessionId, SessionSnapshot};
pub use state::SessionState;
