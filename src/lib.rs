//! File Hosting Storage Service
//!
//! Multi-backend storage service for a file hosting platform. Uploads are
//! routed to one of several interchangeable backends (a chat-relay store
//! over the Telegram Bot API, an object bucket via the AWS SDK, or any
//! S3-protocol endpoint via hand-signed REST calls), optionally mirrored
//! for redundancy, and served back through a fallback chain that survives
//! slow or missing backends.
//!
//! ## Features
//!
//! - **Smart Routing**: Declarative size/type/name rules decide which
//!   backend receives each upload
//! - **Redundant Mirrors**: A confirmed primary write plus background
//!   replication to mirror backends, tracked per copy
//! - **Fallback Reads**: Candidate backends tried in order with a
//!   per-candidate deadline, so one slow backend never blocks a read
//! - **Conditional Serving**: ETag/Last-Modified revalidation and range
//!   requests pass through to backends that support them
//!
//! ## Architecture
//!
//! ```text
//! Upload                       Backends                  Metadata KV
//! ┌──────────────┐            ┌──────────────┐          ┌──────────────┐
//! │ POST /upload │            │ telegram     │          │ file_id ->   │
//! └──────────────┘            │ bucket       │          │  primary,    │
//!        │                    │ s3           │          │  mirrors[]   │
//!        ▼                    └──────────────┘          └──────────────┘
//! ┌──────────────┐                   ▲                         ▲
//! │ Smart        │                   │                         │
//! │ Router       │                   │                         │
//! └──────────────┘                   │                         │
//!        │                           │                         │
//!        ▼                           │                         │
//! ┌──────────────┐            ┌──────────────┐                │
//! │ Redundancy   │───────────▶│ Provider     │────────────────┘
//! │ Manager      │            │ Registry     │
//! └──────────────┘            └──────────────┘
//!                                    ▲
//! ┌──────────────┐                   │
//! │ GET /file/id │──────────────────▶│
//! └──────────────┘            ┌──────────────┐
//!                             │ Fallback     │
//!                             │ Reader       │
//!                             └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod fallback;
pub mod metadata;
pub mod provider;
pub mod providers;
pub mod redundancy;
pub mod registry;
pub mod router;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::{Config, StorageMode};
pub use fallback::FallbackReader;
pub use metadata::{FileMetadata, InMemoryMetadataStore, MetadataStore, MirrorState, MirrorStatus, StorageInfo};
pub use provider::{
    FileResponse, ProviderKind, ReadRequest, StorageProvider, UploadFile, UploadOptions,
    UploadResult,
};
pub use providers::{BucketProvider, SignedRestProvider, TelegramProvider};
pub use redundancy::RedundancyManager;
pub use registry::{ProviderRegistry, ProviderStatus};
pub use router::SmartRouter;
