//! Test fixtures for the cursor-to-table read path: an in-memory storage
//! engine speaking the cursor-source interface, and a ready-wired fixture
//! with a default organization and bucket.

use std::sync::Arc;

use storage_reads::{BucketId, OrgId, Reader};

pub mod engine;

pub use engine::{EngineError, MemEngine};

/// A test fixture owning a storage engine plus the identities tests read
/// under. Explicit composition: it forwards only what tests need.
#[derive(Debug)]
pub struct TestEngine {
    engine: Arc<MemEngine>,
    org_id: OrgId,
    bucket_id: BucketId,
}

impl TestEngine {
    /// An opened engine with one default bucket.
    pub fn new() -> Self {
        let engine = Arc::new(MemEngine::new());
        engine.open();
        let org_id = OrgId::from_hex("3131313131313131").expect("valid org id");
        let bucket_id = BucketId::from_hex("3232323232323232").expect("valid bucket id");
        engine.create_bucket(org_id, bucket_id);
        Self {
            engine,
            org_id,
            bucket_id,
        }
    }

    pub fn org_id(&self) -> OrgId {
        self.org_id
    }

    pub fn bucket_id(&self) -> BucketId {
        self.bucket_id
    }

    pub fn engine(&self) -> Arc<MemEngine> {
        Arc::clone(&self.engine)
    }

    /// A reader over this engine with default chunking.
    pub fn reader(&self) -> Reader<MemEngine> {
        Reader::new(self.engine())
    }

    /// Write line protocol into the default bucket, panicking on malformed
    /// input.
    pub fn write_lp(&self, lp: &str) {
        self.engine
            .write_lp(self.org_id, self.bucket_id, lp)
            .expect("write line protocol");
    }

    /// Number of storage cursors currently open — zero once every table has
    /// been drained or dropped.
    pub fn open_cursor_count(&self) -> usize {
        self.engine.open_cursor_count()
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
