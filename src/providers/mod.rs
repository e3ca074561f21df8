//! Concrete storage backends
//!
//! All three implement [`crate::provider::StorageProvider`] and are only
//! ever constructed through the registry so instances stay cached for the
//! process lifetime.

pub mod bucket;
pub mod s3;
pub mod telegram;

pub use bucket::BucketProvider;
pub use s3::SignedRestProvider;
pub use telegram::TelegramProvider;
