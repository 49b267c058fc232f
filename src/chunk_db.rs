use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use redb::{
    Database,
    MultimapTableDefinition,
    ReadTransaction,
    ReadableDatabase,
    ReadableMultimapTable,
    ReadableTable,
    TableDefinition,
};

use crate::{
    document::{Chunk, chunk_sequence},
    error::{Error, Result},
    store::ChunkStore,
};

/// Chunk id -> JSON chunk metadata (everything except the vector).
const CHUNKS: TableDefinition<&str, &[u8]> = TableDefinition::new("chunks");

/// Chunk id -> embedding vector.
const EMBEDDINGS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("embeddings");

/// Document id -> chunk ids.
const DOCUMENT_CHUNKS: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("document_chunks");

/// `document:chapter` composite key -> chunk ids.
const CHAPTER_CHUNKS: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("chapter_chunks");

/// Header size: 4 bytes dimension.
const HEADER_SIZE: usize = 4;

/// Persistent [`ChunkStore`] backed by redb.
///
/// Embedding binary format per entry:
/// - 4 bytes: dimension D (u32 LE)
/// - D * 4 bytes: f32 LE values
///
/// Lookups by document or chapter return chunks ordered by the sequence
/// number in their id, which is the order the chunker produced them in.
///
/// Clones share the same database. The [`ChunkStore`] impl runs each
/// transaction on the blocking pool.
#[derive(Clone)]
pub struct ChunkDb {
    db: Arc<Database>,
}

impl ChunkDb {
    /// Open or create a chunk database at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use bookbert::ChunkDb;
    ///
    /// let db = ChunkDb::open(&tmp.path().join("chunks.redb")).unwrap();
    /// assert!(db.list_documents().unwrap().is_empty());
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(CHUNKS)?;
        txn.open_table(EMBEDDINGS)?;
        txn.open_multimap_table(DOCUMENT_CHUNKS)?;
        txn.open_multimap_table(CHAPTER_CHUNKS)?;
        txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ChunkDb) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| Error::Storage(format!("chunk database task failed: {e}")))?
    }

    /// Insert or replace chunks in a single transaction.
    ///
    /// A chunk saved without an embedding drops any vector stored under
    /// the same id.
    pub fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHUNKS)?;
            let mut vectors = txn.open_table(EMBEDDINGS)?;
            let mut documents = txn.open_multimap_table(DOCUMENT_CHUNKS)?;
            let mut chapters = txn.open_multimap_table(CHAPTER_CHUNKS)?;

            for chunk in chunks {
                let id = chunk.id.as_str();
                let metadata = serde_json::to_vec(&Chunk {
                    embedding: None,
                    ..chunk.clone()
                })?;
                table.insert(id, metadata.as_slice())?;

                match &chunk.embedding {
                    Some(vector) => {
                        let byte_len =
                            HEADER_SIZE + std::mem::size_of_val(vector.as_slice());
                        let mut guard = vectors.insert_reserve(id, byte_len)?;
                        let dest = guard.as_mut();
                        dest[0..HEADER_SIZE]
                            .copy_from_slice(&(vector.len() as u32).to_le_bytes());
                        dest[HEADER_SIZE..]
                            .copy_from_slice(bytemuck::cast_slice(vector));
                    }
                    None => {
                        vectors.remove(id)?;
                    }
                }

                documents.insert(chunk.document_id.as_str(), id)?;
                chapters.insert(chunk.composite_key.as_str(), id)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// All chunks of a document in chunker order.
    pub fn load_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let txn = self.db.begin_read()?;
        let ids = Self::ids_under(&txn, DOCUMENT_CHUNKS, document_id)?;
        Self::load_many(&txn, &ids)
    }

    /// All chunks stored under a `document:chapter` composite key.
    pub fn load_chapter(&self, composite_key: &str) -> Result<Vec<Chunk>> {
        let txn = self.db.begin_read()?;
        let ids = Self::ids_under(&txn, CHAPTER_CHUNKS, composite_key)?;
        Self::load_many(&txn, &ids)
    }

    /// Load chunks by id, preserving input order and skipping unknown ids.
    pub fn load_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_read()?;
        Self::load_many(&txn, ids)
    }

    pub fn contains_document(&self, document_id: &str) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_multimap_table(DOCUMENT_CHUNKS)?;
        let mut values = table.get(document_id)?;
        Ok(values.next().transpose()?.is_some())
    }

    /// Remove every chunk of a document, with its vectors and index
    /// entries, in one transaction. Returns the number of chunks removed.
    pub fn remove_document(&self, document_id: &str) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let removed = {
            let ids: Vec<String> = {
                let mut documents = txn.open_multimap_table(DOCUMENT_CHUNKS)?;
                let values = documents.remove_all(document_id)?;
                values
                    .map(|v| v.map(|guard| guard.value().to_string()))
                    .collect::<std::result::Result<_, _>>()?
            };

            let mut table = txn.open_table(CHUNKS)?;
            let mut vectors = txn.open_table(EMBEDDINGS)?;
            let mut chapters = txn.open_multimap_table(CHAPTER_CHUNKS)?;

            for id in &ids {
                let composite_key = match table.remove(id.as_str())? {
                    Some(guard) => {
                        serde_json::from_slice::<Chunk>(guard.value())?
                            .composite_key
                    }
                    None => continue,
                };
                chapters.remove(composite_key.as_str(), id.as_str())?;
                vectors.remove(id.as_str())?;
            }
            ids.len()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Every indexed document id with its chunk count.
    pub fn list_documents(&self) -> Result<Vec<(String, usize)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_multimap_table(DOCUMENT_CHUNKS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, values) = entry?;
            result.push((k.value().to_string(), values.count()));
        }
        Ok(result)
    }

    fn ids_under(
        txn: &ReadTransaction,
        definition: MultimapTableDefinition<'static, &'static str, &'static str>,
        key: &str,
    ) -> Result<Vec<String>> {
        let table = txn.open_multimap_table(definition)?;
        let mut ids = Vec::new();
        for value in table.get(key)? {
            ids.push(value?.value().to_string());
        }
        ids.sort_by_cached_key(|id| {
            (chunk_sequence(id).unwrap_or(usize::MAX), id.clone())
        });
        Ok(ids)
    }

    fn load_many(txn: &ReadTransaction, ids: &[String]) -> Result<Vec<Chunk>> {
        let table = txn.open_table(CHUNKS)?;
        let vectors = txn.open_table(EMBEDDINGS)?;

        let mut chunks = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(guard) = table.get(id.as_str())? else {
                continue;
            };
            let mut chunk: Chunk = serde_json::from_slice(guard.value())?;
            if let Some(bytes) = vectors.get(id.as_str())? {
                chunk.embedding = decode_vector(bytes.value());
            }
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    let header: [u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
    let dimension = u32::from_le_bytes(header) as usize;
    if bytes.len() != HEADER_SIZE + dimension * 4 {
        return None;
    }
    Some(bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..]))
}

impl std::fmt::Debug for ChunkDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkDb").finish_non_exhaustive()
    }
}

#[async_trait]
impl ChunkStore for ChunkDb {
    async fn save_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let chunks = chunks.to_vec();
        self.blocking(move |db| db.insert_chunks(&chunks)).await
    }

    async fn get_chunks_by_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<Chunk>> {
        let document_id = document_id.to_string();
        self.blocking(move |db| db.load_document(&document_id)).await
    }

    async fn get_chunks_by_document_chapter(
        &self,
        document_id: &str,
        chapter_id: &str,
    ) -> Result<Vec<Chunk>> {
        let key = crate::document::composite_key(document_id, chapter_id);
        self.blocking(move |db| db.load_chapter(&key)).await
    }

    async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let ids = ids.to_vec();
        self.blocking(move |db| db.load_ids(&ids)).await
    }

    async fn has_chunks(&self, document_id: &str) -> Result<bool> {
        let document_id = document_id.to_string();
        self.blocking(move |db| db.contains_document(&document_id)).await
    }

    async fn delete_chunks_by_document(&self, document_id: &str) -> Result<()> {
        let document_id = document_id.to_string();
        self.blocking(move |db| db.remove_document(&document_id).map(|_| ()))
            .await
    }
}
