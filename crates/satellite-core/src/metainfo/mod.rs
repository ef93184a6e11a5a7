//! # Metainfo
//!
//! Segment metadata access (`Service`) and the shared iteration loop
//! (`Loop`) that chores join instead of scanning the pointer database on
//! their own.

pub mod segment_loop;

pub use segment_loop::{Loop, LoopError, Observer};

use std::sync::Arc;

use shared_types::{Buckets, Pointer, PointerDb, RemotePiece, SegmentData, StorageError};

/// Pointer lookups and piece bookkeeping.
pub struct Service {
    db: Arc<dyn PointerDb>,
    buckets: Arc<dyn Buckets>,
}

impl Service {
    pub fn new(db: Arc<dyn PointerDb>, buckets: Arc<dyn Buckets>) -> Self {
        Self { db, buckets }
    }

    pub async fn get(&self, path: &str) -> Result<Pointer, StorageError> {
        self.db.get(path).await
    }

    pub async fn put(&self, path: &str, pointer: Pointer) -> Result<(), StorageError> {
        self.db.put(path, pointer).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.db.delete(path).await
    }

    pub async fn bucket_exists(&self, project_id: &str, bucket: &str) -> Result<bool, StorageError> {
        self.buckets.bucket_exists(project_id, bucket).await
    }

    /// Replace pieces of a remote segment.
    ///
    /// Pieces in `remove` are dropped first, then `add` is applied; a piece
    /// number that is still present after the removal is a conflict.
    pub async fn update_pieces(
        &self,
        path: &str,
        add: Vec<RemotePiece>,
        remove: &[u16],
    ) -> Result<Pointer, StorageError> {
        let mut pointer = self.db.get(path).await?;

        match &mut pointer.data {
            SegmentData::Inline(_) => {
                return Err(StorageError::Conflict(format!("{path} is an inline segment")));
            }
            SegmentData::Remote { pieces, .. } => {
                pieces.retain(|piece| !remove.contains(&piece.piece_num));
                for piece in add {
                    if pieces.iter().any(|p| p.piece_num == piece.piece_num) {
                        return Err(StorageError::Conflict(format!(
                            "{path}: piece {} already present",
                            piece.piece_num
                        )));
                    }
                    pieces.push(piece);
                }
                pieces.sort_by_key(|p| p.piece_num);
            }
        }

        self.db.put(path, pointer.clone()).await?;
        Ok(pointer)
    }
}
