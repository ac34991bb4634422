pub mod auth;
pub mod catalog;
pub mod encoder;
pub mod state;

pub use auth::AuthStore;
pub use catalog::VideoCatalog;
pub use encoder::{Encoder, FfmpegEncoder};
pub use state::{ClientInfo, StateCore, SyncNotifier};
