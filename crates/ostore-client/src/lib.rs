//! Object store client for ostore.
//!
//! An [`ObjectStore`] writes objects as ordered chunks over a
//! [`Transport`](ostore_transport::Transport) and installs each completed
//! upload as the object's new current revision. Reads are lazy and verified:
//! an [`ObjectReader`] fetches chunks only as they are consumed and checks the
//! recomputed digest once the last one has been delivered.
//!
//! # Layers
//!
//! - [`ChunkedEncoder`] cuts a byte stream into chunks while hashing it
//! - [`TransferSession`] sends requests with timeout, retry and cancellation
//! - [`ObjectStore`] drives puts, gets, listings and bucket operations
//!
//! ```no_run
//! # async fn demo(store: ostore_client::ObjectStore) -> ostore_client::StoreResult<()> {
//! use ostore_types::{BucketName, ObjectHeaders, ObjectName};
//!
//! let bucket = BucketName::new("test")?;
//! let name = ObjectName::new("hello.txt")?;
//! store.put(&bucket, &name, ObjectHeaders::new(), &b"hello"[..]).await?;
//!
//! let mut reader = store.get(&bucket, &name).await?;
//! let mut out = Vec::new();
//! reader.copy_to(&mut out).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod encoder;
pub mod error;
pub mod lister;
pub mod reader;
pub mod session;
pub mod store;

pub use config::{StoreConfig, DEFAULT_CHUNK_SIZE};
pub use encoder::{ChunkedEncoder, EncodedChunk};
pub use error::{StoreError, StoreResult};
pub use lister::ObjectLister;
pub use reader::ObjectReader;
pub use session::{TransferSession, TransferStats};
pub use store::{BucketStatus, ObjectStore};
