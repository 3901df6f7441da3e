//! SQLite-backed `PersistenceAdapter` and `AudioStorageBackend` (§4.9, §6.4).
//!
//! Grounded on `meet-scribe`'s `adapters/storage/sqlite.rs`: an
//! `Arc<Mutex<Connection>>` driven from async methods via `spawn_blocking`,
//! migrations run through `rusqlite_migration`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use rusqlite_migration::{Migrations, M};
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use super::adapter::{AudioRef, AudioStorageBackend, PersistenceAdapter};
use crate::config::AudioStorageBackend as BackendChoice;
use crate::error::{CoreError, Result};
use crate::model::{ClosedSegmentDescriptor, TranslationResult};

const CHUNK_SIZE: usize = 64 * 1024;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("../../migrations/001_initial.sql"))])
}

async fn run_blocking<F, T>(conn: Arc<Mutex<Connection>>, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = conn.lock().expect("sqlite connection mutex poisoned");
        f(&conn)
    })
    .await
    .map_err(|e| CoreError::Internal(format!("blocking task join failed: {e}")))?
}

pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
    backend: BackendChoice,
}

impl SqlitePersistence {
    pub fn open(path: &Path, backend: BackendChoice) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            backend,
        })
    }

    pub fn run_migrations(&self) -> Result<()> {
        let mut conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        migrations()
            .to_latest(&mut conn)
            .map_err(|e| CoreError::Internal(format!("migration failed: {e}")))
    }

    pub fn create_recording(
        &self,
        recording_id: &str,
        user_id: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        conn.execute(
            "INSERT INTO recordings (id, user_id, source_lang, target_lang, status, source_type)
             VALUES (?1, ?2, ?3, ?4, 'recording', 'live')",
            params![recording_id, user_id, source_lang, target_lang],
        )?;
        Ok(())
    }
}

#[async_trait]
impl AudioStorageBackend for SqlitePersistence {
    async fn save_audio(&self, bytes: Vec<u8>) -> Result<AudioRef> {
        let conn = self.conn.clone();
        match self.backend {
            BackendChoice::LargeObject => {
                run_blocking(conn, move |conn| {
                    conn.execute("INSERT INTO audio_objects (total_size) VALUES (0)", [])?;
                    let oid = conn.last_insert_rowid();
                    for (index, chunk) in bytes.chunks(CHUNK_SIZE).enumerate() {
                        conn.execute(
                            "INSERT INTO audio_object_chunks (oid, chunk_index, data) VALUES (?1, ?2, ?3)",
                            params![oid, index as i64, chunk],
                        )?;
                    }
                    conn.execute(
                        "UPDATE audio_objects SET total_size = ?1 WHERE oid = ?2",
                        params![bytes.len() as i64, oid],
                    )?;
                    Ok(AudioRef::LargeObject(oid))
                })
                .await
            }
            BackendChoice::Blob => {
                let blob_id = uuid::Uuid::new_v4();
                run_blocking(conn, move |conn| {
                    conn.execute(
                        "INSERT INTO audio_blobs (blob_id, data) VALUES (?1, ?2)",
                        params![blob_id.to_string(), bytes],
                    )?;
                    Ok(AudioRef::Blob(blob_id))
                })
                .await
            }
        }
    }

    async fn read_audio(&self, audio_ref: AudioRef, offset: u64, length: u64) -> Result<Vec<u8>> {
        let conn = self.conn.clone();
        run_blocking(conn, move |conn| match audio_ref {
            AudioRef::LargeObject(oid) => {
                let mut stmt = conn.prepare(
                    "SELECT data FROM audio_object_chunks WHERE oid = ?1 ORDER BY chunk_index",
                )?;
                let chunks = stmt
                    .query_map(params![oid], |row| row.get::<_, Vec<u8>>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let full: Vec<u8> = chunks.into_iter().flatten().collect();
                Ok(slice_range(&full, offset, length))
            }
            AudioRef::Blob(blob_id) => {
                let full: Vec<u8> = conn.query_row(
                    "SELECT data FROM audio_blobs WHERE blob_id = ?1",
                    params![blob_id.to_string()],
                    |row| row.get(0),
                )?;
                Ok(slice_range(&full, offset, length))
            }
        })
        .await
    }

    async fn stream_audio_chunks(
        &self,
        audio_ref: AudioRef,
        chunk_size: usize,
    ) -> Result<std::pin::Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>> {
        let full = self.read_audio(audio_ref, 0, u64::MAX).await?;
        let chunks: Vec<Result<Vec<u8>>> = full
            .chunks(chunk_size.max(1))
            .map(|c| Ok(c.to_vec()))
            .collect();
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }

    async fn get_audio_size(&self, audio_ref: AudioRef) -> Result<u64> {
        let conn = self.conn.clone();
        run_blocking(conn, move |conn| match audio_ref {
            AudioRef::LargeObject(oid) => {
                let size: i64 = conn.query_row(
                    "SELECT total_size FROM audio_objects WHERE oid = ?1",
                    params![oid],
                    |row| row.get(0),
                )?;
                Ok(size as u64)
            }
            AudioRef::Blob(blob_id) => {
                let size: i64 = conn.query_row(
                    "SELECT length(data) FROM audio_blobs WHERE blob_id = ?1",
                    params![blob_id.to_string()],
                    |row| row.get(0),
                )?;
                Ok(size as u64)
            }
        })
        .await
    }

    async fn delete_audio(&self, audio_ref: AudioRef) -> Result<bool> {
        let conn = self.conn.clone();
        run_blocking(conn, move |conn| {
            let rows = match audio_ref {
                AudioRef::LargeObject(oid) => {
                    conn.execute("DELETE FROM audio_objects WHERE oid = ?1", params![oid])?
                }
                AudioRef::Blob(blob_id) => conn.execute(
                    "DELETE FROM audio_blobs WHERE blob_id = ?1",
                    params![blob_id.to_string()],
                )?,
            };
            Ok(rows > 0)
        })
        .await
    }
}

fn slice_range(data: &[u8], offset: u64, length: u64) -> Vec<u8> {
    let start = (offset as usize).min(data.len());
    let end = if length == u64::MAX {
        data.len()
    } else {
        (start + length as usize).min(data.len())
    };
    data[start..end].to_vec()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TranslationSegmentRow {
    segment_id: Option<String>,
    text: String,
    start: Option<f64>,
    end: Option<f64>,
    is_final: bool,
}

#[async_trait]
impl PersistenceAdapter for SqlitePersistence {
    async fn append_transcript(
        &self,
        recording_id: &str,
        language: &str,
        segment: ClosedSegmentDescriptor,
    ) -> Result<()> {
        let conn = self.conn.clone();
        let recording_id = recording_id.to_string();
        let language = language.to_string();
        run_blocking(conn, move |conn| {
            let existing: Option<(String, String)> = conn
                .query_row(
                    "SELECT segments, full_text FROM transcripts WHERE recording_id = ?1",
                    params![recording_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (mut segments, mut full_text): (Vec<ClosedSegmentDescriptor>, String) = match existing {
                Some((segments_json, full_text)) => (serde_json::from_str(&segments_json)?, full_text),
                None => (Vec::new(), String::new()),
            };

            if !full_text.is_empty() {
                full_text.push(' ');
            }
            full_text.push_str(&segment.text);
            segments.push(segment);
            let segments_json = serde_json::to_string(&segments)?;

            conn.execute(
                "INSERT INTO transcripts (recording_id, segments, full_text, language)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(recording_id) DO UPDATE SET
                     segments = excluded.segments,
                     full_text = excluded.full_text",
                params![recording_id, segments_json, full_text, language],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_translation(
        &self,
        recording_id: &str,
        target_lang: &str,
        result: TranslationResult,
    ) -> Result<()> {
        let conn = self.conn.clone();
        let recording_id = recording_id.to_string();
        let target_lang = target_lang.to_string();
        run_blocking(conn, move |conn| {
            let existing: Option<(i64, String, String)> = conn
                .query_row(
                    "SELECT id, segments, full_text FROM translations WHERE recording_id = ?1 AND target_lang = ?2",
                    params![recording_id, target_lang],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let result_segment_id = result.segment_id.to_string();
            let (row_id, mut segments): (Option<i64>, Vec<TranslationSegmentRow>) = match existing {
                Some((id, segments_json, _)) => (Some(id), serde_json::from_str(&segments_json)?),
                None => (None, Vec::new()),
            };

            if let Some(matching) = segments
                .iter_mut()
                .find(|s| s.segment_id.as_deref() == Some(result_segment_id.as_str()))
            {
                if !matching.text.is_empty() {
                    matching.text.push(' ');
                }
                matching.text.push_str(&result.text);
                matching.is_final = result.is_final;
            } else if let Some(last) = segments.last_mut().filter(|s| s.segment_id.is_none()) {
                // Adopt the trailing phantom placeholder rather than
                // appending a duplicate segment for the same span.
                if !last.text.is_empty() {
                    last.text.push(' ');
                }
                last.text.push_str(&result.text);
                last.segment_id = Some(result_segment_id);
                last.is_final = result.is_final;
                last.start.get_or_insert(0.0);
                last.end.get_or_insert(0.0);
            } else {
                segments.push(TranslationSegmentRow {
                    segment_id: Some(result_segment_id),
                    text: result.text.clone(),
                    start: None,
                    end: None,
                    is_final: result.is_final,
                });
            }

            let full_text = segments
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let segments_json = serde_json::to_string(&segments)?;

            match row_id {
                Some(id) => {
                    conn.execute(
                        "UPDATE translations SET segments = ?1, full_text = ?2 WHERE id = ?3",
                        params![segments_json, full_text, id],
                    )?;
                }
                None => {
                    conn.execute(
                        "INSERT INTO translations (recording_id, target_lang, segments, full_text)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![recording_id, target_lang, segments_json, full_text],
                    )?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn update_recording_audio(
        &self,
        recording_id: &str,
        audio_ref: AudioRef,
        audio_size: u64,
        audio_format: &str,
        duration_seconds: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn.clone();
        let recording_id = recording_id.to_string();
        let audio_format = audio_format.to_string();
        run_blocking(conn, move |conn| {
            match audio_ref {
                AudioRef::LargeObject(oid) => conn.execute(
                    "UPDATE recordings SET audio_oid = ?1, audio_blob_id = NULL, audio_size = ?2,
                         audio_format = ?3, duration_seconds = COALESCE(?4, duration_seconds),
                         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                     WHERE id = ?5",
                    params![oid, audio_size as i64, audio_format, duration_seconds, recording_id],
                )?,
                AudioRef::Blob(blob_id) => conn.execute(
                    "UPDATE recordings SET audio_blob_id = ?1, audio_oid = NULL, audio_size = ?2,
                         audio_format = ?3, duration_seconds = COALESCE(?4, duration_seconds),
                         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                     WHERE id = ?5",
                    params![blob_id.to_string(), audio_size as i64, audio_format, duration_seconds, recording_id],
                )?,
            };
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SegmentId;

    fn open_test_db() -> SqlitePersistence {
        let db = SqlitePersistence::open(Path::new(":memory:"), BackendChoice::LargeObject).unwrap();
        db.run_migrations().unwrap();
        db.create_recording("rec-1", "user-1", "en", "zh").unwrap();
        db
    }

    #[tokio::test]
    async fn large_object_roundtrip() {
        let db = open_test_db();
        let bytes = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let audio_ref = db.save_audio(bytes.clone()).await.unwrap();
        assert!(matches!(audio_ref, AudioRef::LargeObject(_)));

        let read_back = db.read_audio(audio_ref, 0, u64::MAX).await.unwrap();
        assert_eq!(read_back, bytes);
        assert_eq!(db.get_audio_size(audio_ref).await.unwrap(), 8);

        assert!(db.delete_audio(audio_ref).await.unwrap());
        assert!(!db.delete_audio(audio_ref).await.unwrap());
    }

    #[tokio::test]
    async fn blob_backend_roundtrip() {
        let db = SqlitePersistence::open(Path::new(":memory:"), BackendChoice::Blob).unwrap();
        db.run_migrations().unwrap();
        db.create_recording("rec-2", "user-1", "en", "zh").unwrap();

        let bytes = vec![9u8; 100];
        let audio_ref = db.save_audio(bytes.clone()).await.unwrap();
        assert!(matches!(audio_ref, AudioRef::Blob(_)));
        let partial = db.read_audio(audio_ref, 10, 20).await.unwrap();
        assert_eq!(partial.len(), 20);
    }

    #[tokio::test]
    async fn append_transcript_accumulates_segments() {
        let db = open_test_db();
        db.append_transcript(
            "rec-1",
            "en",
            ClosedSegmentDescriptor {
                text: "Hello.".into(),
                start: 0.0,
                end: 1.0,
                is_final: true,
                speaker: None,
            },
        )
        .await
        .unwrap();
        db.append_transcript(
            "rec-1",
            "en",
            ClosedSegmentDescriptor {
                text: "World.".into(),
                start: 1.0,
                end: 2.0,
                is_final: true,
                speaker: None,
            },
        )
        .await
        .unwrap();

        let conn = db.conn.lock().unwrap();
        let full_text: String = conn
            .query_row("SELECT full_text FROM transcripts WHERE recording_id = 'rec-1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(full_text, "Hello. World.");
    }

    #[tokio::test]
    async fn update_translation_adopts_phantom_segment() {
        let db = open_test_db();
        let seg = SegmentId::new();

        // Seed a phantom placeholder segment (no segment_id) as the UI would.
        {
            let conn = db.conn.lock().unwrap();
            let phantom = vec![TranslationSegmentRow {
                segment_id: None,
                text: String::new(),
                start: None,
                end: None,
                is_final: false,
            }];
            conn.execute(
                "INSERT INTO translations (recording_id, target_lang, segments, full_text) VALUES (?1, ?2, ?3, '')",
                params!["rec-1", "zh", serde_json::to_string(&phantom).unwrap()],
            )
            .unwrap();
        }

        db.update_translation(
            "rec-1",
            "zh",
            TranslationResult {
                text: "你好".into(),
                segment_id: seg,
                sentence_index: 0,
                is_final: true,
                error: false,
            },
        )
        .await
        .unwrap();

        let conn = db.conn.lock().unwrap();
        let segments_json: String = conn
            .query_row(
                "SELECT segments FROM translations WHERE recording_id = 'rec-1' AND target_lang = 'zh'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        let segments: Vec<TranslationSegmentRow> = serde_json::from_str(&segments_json).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].segment_id, Some(seg.to_string()));
        assert_eq!(segments[0].text, "你好");
    }
}
