//! 청크 스테이징 저장소
//!
//! 대용량 전송에서 수신 청크를 메모리에 모두 들고 있지 않도록
//! (transfer_id, chunk_index) 키로 보관. 호출은 블로킹이므로 `spawn_blocking` 에서 수행

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::chunk::ChunkIndex;
use crate::Result;

/// 전송 ID 의 파일 시스템용 이름 (SHA-256 hex, 항상 64자)
///
/// 전송 ID 를 그대로 경로에 쓰지 않으며 길이와 무관하게 파일명 한도 안에 들어감
pub fn hashed_name(transfer_id: &str) -> String {
    hex::encode(Sha256::digest(transfer_id.as_bytes()))
}

/// 키-값 청크 저장소
pub trait ChunkStore: Send + Sync {
    fn put(&self, transfer_id: &str, index: ChunkIndex, data: Bytes) -> Result<()>;

    fn get(&self, transfer_id: &str, index: ChunkIndex) -> Result<Option<Bytes>>;

    fn delete(&self, transfer_id: &str, index: ChunkIndex) -> Result<()>;

    /// 전송의 모든 청크 삭제, 삭제된 개수 반환
    fn delete_transfer(&self, transfer_id: &str) -> Result<usize>;
}

/// 메모리 저장소
#[derive(Debug, Default)]
pub struct MemoryStore {
    chunks: DashMap<(String, ChunkIndex), Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 저장된 청크 수
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl ChunkStore for MemoryStore {
    fn put(&self, transfer_id: &str, index: ChunkIndex, data: Bytes) -> Result<()> {
        self.chunks.insert((transfer_id.to_string(), index), data);
        Ok(())
    }

    fn get(&self, transfer_id: &str, index: ChunkIndex) -> Result<Option<Bytes>> {
        Ok(self
            .chunks
            .get(&(transfer_id.to_string(), index))
            .map(|entry| entry.value().clone()))
    }

    fn delete(&self, transfer_id: &str, index: ChunkIndex) -> Result<()> {
        self.chunks.remove(&(transfer_id.to_string(), index));
        Ok(())
    }

    fn delete_transfer(&self, transfer_id: &str) -> Result<usize> {
        let before = self.chunks.len();
        self.chunks.retain(|(id, _), _| id != transfer_id);
        Ok(before - self.chunks.len())
    }
}

/// 디스크 저장소 (청크당 파일 하나)
///
/// 경로: `<root>/<sha256(transfer_id)>/<index>.chunk`
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn transfer_dir(&self, transfer_id: &str) -> PathBuf {
        self.root.join(hashed_name(transfer_id))
    }

    fn chunk_path(&self, transfer_id: &str, index: ChunkIndex) -> PathBuf {
        self.transfer_dir(transfer_id).join(format!("{}.chunk", index))
    }
}

impl ChunkStore for DiskStore {
    fn put(&self, transfer_id: &str, index: ChunkIndex, data: Bytes) -> Result<()> {
        fs::create_dir_all(self.transfer_dir(transfer_id))?;
        fs::write(self.chunk_path(transfer_id, index), &data)?;
        Ok(())
    }

    fn get(&self, transfer_id: &str, index: ChunkIndex) -> Result<Option<Bytes>> {
        match fs::read(self.chunk_path(transfer_id, index)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, transfer_id: &str, index: ChunkIndex) -> Result<()> {
        match fs::remove_file(self.chunk_path(transfer_id, index)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_transfer(&self, transfer_id: &str) -> Result<usize> {
        let dir = self.transfer_dir(transfer_id);
        let count = match fs::read_dir(&dir) {
            Ok(entries) => entries.count(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        fs::remove_dir_all(&dir)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn ChunkStore) {
        store.put("a", 0, Bytes::from_static(b"zero")).unwrap();
        store.put("a", 1, Bytes::from_static(b"one")).unwrap();
        store.put("b", 0, Bytes::from_static(b"other")).unwrap();

        assert_eq!(store.get("a", 1).unwrap().unwrap().as_ref(), b"one");
        assert!(store.get("a", 2).unwrap().is_none());

        store.delete("a", 1).unwrap();
        store.delete("a", 1).unwrap();
        assert!(store.get("a", 1).unwrap().is_none());

        assert_eq!(store.delete_transfer("a").unwrap(), 1);
        assert_eq!(store.delete_transfer("a").unwrap(), 0);
        assert_eq!(store.get("b", 0).unwrap().unwrap().as_ref(), b"other");
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("staging")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_disk_store_hides_transfer_id_in_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        store.put("../escape", 0, Bytes::from_static(b"x")).unwrap();

        assert!(!dir.path().join("..").join("escape").exists());
        assert_eq!(store.get("../escape", 0).unwrap().unwrap().as_ref(), b"x");
    }

    #[test]
    fn test_disk_store_accepts_long_transfer_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        let long_id = "x".repeat(1000);

        store.put(&long_id, 3, Bytes::from_static(b"long")).unwrap();
        assert_eq!(store.get(&long_id, 3).unwrap().unwrap().as_ref(), b"long");

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![hashed_name(&long_id)]);
        assert_eq!(names[0].len(), 64);
        assert_eq!(store.delete_transfer(&long_id).unwrap(), 1);
    }
}
