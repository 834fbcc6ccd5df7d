pub mod auth;
pub mod clients;
pub mod config;
pub mod ops;
pub mod types;
pub mod utils;

pub use ops::{CheckoutStream, Session, StatusStream};
pub use types::errors::GinError;
pub use types::progress::RepoFileStatus;

pub static GIN_APP_NAME: &str = "gin";
