#[cfg(feature = "provider-chat")]
pub mod chat;
#[cfg(feature = "provider-rest")]
pub mod rest;

#[cfg(feature = "provider-chat")]
pub use chat::ChatImages;
#[cfg(feature = "provider-rest")]
pub use rest::RestImages;
