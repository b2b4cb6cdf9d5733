mod error;
pub mod models;
mod server;
pub mod services;
pub mod state;
pub(crate) mod utils;

pub use error::ApiError;
pub use server::{router, run};
pub use state::{AnyError, AppState};
pub use utils::{ADMIN_TOKEN_HEADER, OWNER_HEADER};
