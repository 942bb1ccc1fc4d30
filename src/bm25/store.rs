//! Versioned binary persistence for BM25 indexes.
//!
//! Layout: header (magic, format version, tokenizer version, parameters,
//! N, total length), doc table, term table (term, df, posting offset),
//! posting blocks. All integers little-endian; strings are u32
//! length-prefixed UTF-8. Postings reference documents by their ordinal in
//! the doc table.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::tokenizer::TOKENIZER_VERSION;
use super::{Bm25Index, Bm25Params, DocRecord, Posting};

const MAGIC: &[u8; 4] = b"KBIX";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("version mismatch (format {found_format}, tokenizer {found_tokenizer})")]
    VersionMismatch {
        found_format: u32,
        found_tokenizer: u32,
    },
    #[error("corrupt index: {0}")]
    Corrupt(String),
}

// ──────────────────────────── Encoding ────────────────────────────

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

pub fn encode(index: &Bm25Index) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    put_u32(&mut buf, FORMAT_VERSION);
    put_u32(&mut buf, TOKENIZER_VERSION);
    put_f64(&mut buf, index.params.k1);
    put_f64(&mut buf, index.params.b);
    put_u64(&mut buf, index.docs.len() as u64);
    put_u64(&mut buf, index.total_len);

    // Doc table; ordinal order fixes the ids postings refer to.
    let mut ordinals: HashMap<&str, u32> = HashMap::with_capacity(index.docs.len());
    let mut chunk_ids: Vec<&String> = index.docs.keys().collect();
    chunk_ids.sort();
    for (ord, chunk_id) in chunk_ids.iter().enumerate() {
        let record = &index.docs[chunk_id.as_str()];
        ordinals.insert(chunk_id.as_str(), ord as u32);
        put_str(&mut buf, chunk_id);
        put_str(&mut buf, &record.doc_id);
        put_i32(&mut buf, record.chunk_index);
        put_u32(&mut buf, record.len);
        put_i32(&mut buf, record.page.unwrap_or(i32::MIN));
        match &record.section_title {
            Some(section) => {
                buf.push(1);
                put_str(&mut buf, section);
            }
            None => buf.push(0),
        }
        put_str(&mut buf, &record.content);
    }

    // Posting blocks are built first so the term table can carry offsets.
    let mut terms: Vec<&String> = index.postings.keys().collect();
    terms.sort();
    let mut posting_region = Vec::new();
    let mut offsets = Vec::with_capacity(terms.len());
    for term in &terms {
        offsets.push(posting_region.len() as u64);
        let list = &index.postings[term.as_str()];
        put_u32(&mut posting_region, list.len() as u32);
        for posting in list {
            put_u32(&mut posting_region, ordinals[posting.chunk_id.as_str()]);
            put_u32(&mut posting_region, posting.tf);
        }
    }

    put_u64(&mut buf, terms.len() as u64);
    for (term, offset) in terms.iter().zip(&offsets) {
        put_str(&mut buf, term);
        put_u32(&mut buf, index.postings[term.as_str()].len() as u32);
        put_u64(&mut buf, *offset);
    }
    buf.extend_from_slice(&posting_region);
    buf
}

// ──────────────────────────── Decoding ────────────────────────────

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        if self.pos + n > self.bytes.len() {
            return Err(LoadError::Corrupt(format!(
                "unexpected end of file at offset {}",
                self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, LoadError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, LoadError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, LoadError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn byte(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn str(&mut self) -> Result<String, LoadError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| LoadError::Corrupt(format!("invalid utf-8 in string: {e}")))
    }
}

pub fn decode(bytes: &[u8]) -> Result<Bm25Index, LoadError> {
    let mut reader = Reader::new(bytes);

    let magic = reader.take(4)?;
    if magic != MAGIC {
        return Err(LoadError::Corrupt("bad magic".to_string()));
    }
    let format_version = reader.u32()?;
    let tokenizer_version = reader.u32()?;
    if format_version != FORMAT_VERSION || tokenizer_version != TOKENIZER_VERSION {
        return Err(LoadError::VersionMismatch {
            found_format: format_version,
            found_tokenizer: tokenizer_version,
        });
    }

    let k1 = reader.f64()?;
    let b = reader.f64()?;
    let n_docs = reader.u64()? as usize;
    let total_len = reader.u64()?;

    let mut index = Bm25Index::new(Bm25Params { k1, b });
    let mut chunk_ids_by_ord = Vec::with_capacity(n_docs);
    for _ in 0..n_docs {
        let chunk_id = reader.str()?;
        let doc_id = reader.str()?;
        let chunk_index = reader.i32()?;
        let len = reader.u32()?;
        let page_raw = reader.i32()?;
        let section_title = match reader.byte()? {
            0 => None,
            _ => Some(reader.str()?),
        };
        let content = reader.str()?;
        chunk_ids_by_ord.push(chunk_id.clone());
        index.docs.insert(
            chunk_id,
            DocRecord {
                doc_id,
                chunk_index,
                content,
                page: (page_raw != i32::MIN).then_some(page_raw),
                section_title,
                len,
            },
        );
    }
    index.total_len = total_len;

    let term_count = reader.u64()? as usize;
    let mut term_table = Vec::with_capacity(term_count);
    for _ in 0..term_count {
        let term = reader.str()?;
        let df = reader.u32()?;
        let offset = reader.u64()?;
        term_table.push((term, df, offset));
    }

    let region_start = reader.pos;
    for (term, df, offset) in term_table {
        reader.pos = region_start + offset as usize;
        let count = reader.u32()?;
        if count != df {
            return Err(LoadError::Corrupt(format!(
                "posting count {count} disagrees with df {df} for term {term}"
            )));
        }
        let mut list = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let ord = reader.u32()? as usize;
            let tf = reader.u32()?;
            let chunk_id = chunk_ids_by_ord
                .get(ord)
                .ok_or_else(|| LoadError::Corrupt(format!("doc ordinal {ord} out of range")))?;
            list.push(Posting {
                chunk_id: chunk_id.clone(),
                tf,
            });
        }
        index.postings.insert(term, list);
    }

    Ok(index)
}

// ──────────────────────────── Files ────────────────────────────

/// Persist atomically via a temp file in the same directory.
pub async fn write_to_path(path: &Path, index: &Bm25Index) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = encode(index);

    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        Uuid::new_v4().as_hyphenated()
    );
    let tmp_path = path.parent().unwrap_or(Path::new(".")).join(tmp_name);

    tokio::fs::write(&tmp_path, &bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        tokio::fs::remove_file(&tmp_path).await.ok();
        return Err(e.into());
    }
    debug!("persisted BM25 index to {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

pub async fn read_from_path(path: &Path) -> Result<Bm25Index, LoadError> {
    let bytes = tokio::fs::read(path).await?;
    decode(&bytes)
}
