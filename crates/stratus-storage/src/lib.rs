//! Object storage controllers: StratusBucket and StratusKey

pub mod bucket;
pub mod key;
pub mod store;

pub use bucket::{bucket_plan, buckets_for_key, BucketContext};
pub use key::{key_plan, KeyContext};
pub use store::{BucketStore, KeyStore, KubeStorageStore};
