use std::sync::Arc;

use docchat_storage::{KeyValueStore, StorageNamespace};
use snafu::ResultExt;

use crate::error::{ClientResult, EncodePayloadSnafu, StorageSnafu};
use crate::message::MessageEntry;

/// Rejection reason for an illegal transcript mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRejection {
    /// The last entry is still streaming; nothing may be appended after it.
    StreamingEntryOpen,
    /// There is no streaming entry to mutate or finalize.
    NoStreamingEntry,
}

/// Ordered message log. At most one entry streams, and only the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    entries: Vec<MessageEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: MessageEntry) -> Result<&MessageEntry, TranscriptRejection> {
        if self.streaming_entry().is_some() {
            return Err(TranscriptRejection::StreamingEntryOpen);
        }
        self.entries.push(entry);
        Ok(self.last_entry())
    }

    /// Applies `mutate` to the last entry; legal only while it is streaming.
    pub fn mutate_last<F>(&mut self, mutate: F) -> Result<&MessageEntry, TranscriptRejection>
    where
        F: FnOnce(&mut MessageEntry),
    {
        match self.entries.last_mut() {
            Some(entry) if entry.streaming => {
                mutate(entry);
                Ok(entry)
            }
            _ => Err(TranscriptRejection::NoStreamingEntry),
        }
    }

    pub fn finalize_last(&mut self) -> Result<&MessageEntry, TranscriptRejection> {
        self.mutate_last(|entry| entry.streaming = false)
    }

    pub fn streaming_entry(&self) -> Option<&MessageEntry> {
        self.entries.last().filter(|entry| entry.streaming)
    }

    pub fn entries(&self) -> &[MessageEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Swaps in restored entries. Nothing restored from storage is still streaming.
    pub fn replace(&mut self, entries: Vec<MessageEntry>) {
        self.entries = entries
            .into_iter()
            .map(|mut entry| {
                entry.streaming = false;
                entry
            })
            .collect();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn last_entry(&self) -> &MessageEntry {
        &self.entries[self.entries.len() - 1]
    }
}

/// Transcript plus selected document, persisted under a per-user namespace.
pub struct TranscriptStore {
    transcript: Transcript,
    selected_document: Option<String>,
    store: Arc<dyn KeyValueStore>,
    namespace: StorageNamespace,
}

impl TranscriptStore {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: StorageNamespace) -> Self {
        Self {
            transcript: Transcript::new(),
            selected_document: None,
            store,
            namespace,
        }
    }

    pub fn namespace(&self) -> &StorageNamespace {
        &self.namespace
    }

    /// Points the store at another user's scope. In-memory state is dropped until `restore`.
    pub fn rescope(&mut self, namespace: StorageNamespace) {
        if self.namespace != namespace {
            tracing::debug!(
                from = %self.namespace,
                to = %namespace,
                "rescoping transcript storage"
            );
        }
        self.namespace = namespace;
        self.transcript.clear();
        self.selected_document = None;
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    pub fn selected_document(&self) -> Option<&str> {
        self.selected_document.as_deref()
    }

    pub fn set_selected_document(&mut self, document_id: Option<String>) {
        self.selected_document = document_id.filter(|id| !id.trim().is_empty());
    }

    /// Writes the whole transcript and the selected document id.
    pub fn persist(&self) -> ClientResult<()> {
        let encoded = serde_json::to_string(self.transcript.entries()).context(EncodePayloadSnafu {
            stage: "encode-transcript",
        })?;

        self.store
            .set(&self.namespace.messages_key(), &encoded)
            .context(StorageSnafu {
                stage: "persist-transcript",
            })?;
        self.persist_selected_document()?;

        tracing::debug!(
            namespace = %self.namespace,
            entries = self.transcript.len(),
            "persisted transcript"
        );
        Ok(())
    }

    /// Writes only the selected document id; an empty value means none.
    pub fn persist_selected_document(&self) -> ClientResult<()> {
        self.store
            .set(
                &self.namespace.document_id_key(),
                self.selected_document.as_deref().unwrap_or_default(),
            )
            .context(StorageSnafu {
                stage: "persist-selected-document",
            })
    }

    /// Loads the persisted scope. Absent or unreadable data yields an empty transcript.
    pub fn restore(&mut self) {
        let entries = match self.store.get(&self.namespace.messages_key()) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<MessageEntry>>(&raw) {
                Ok(entries) => entries,
                Err(error) => {
                    tracing::warn!(
                        namespace = %self.namespace,
                        error = %error,
                        "stored transcript is corrupt, starting empty"
                    );
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(error) => {
                tracing::warn!(error = %error, "failed to read stored transcript");
                Vec::new()
            }
        };
        self.transcript.replace(entries);

        self.selected_document = match self.store.get(&self.namespace.document_id_key()) {
            Ok(document_id) => document_id.filter(|id| !id.is_empty()),
            Err(error) => {
                tracing::warn!(error = %error, "failed to read stored document selection");
                None
            }
        };

        tracing::debug!(
            namespace = %self.namespace,
            entries = self.transcript.len(),
            document_id = ?self.selected_document,
            "restored transcript"
        );
    }
}

#[cfg(test)]
mod tests {
    use docchat_storage::MemoryStore;

    use super::*;
    use crate::message::Role;

    fn streamed(chunks: &[&str]) -> Transcript {
        let mut transcript = Transcript::new();
        transcript.append(MessageEntry::user("question")).unwrap();
        transcript.append(MessageEntry::assistant_streaming()).unwrap();
        for chunk in chunks {
            transcript
                .mutate_last(|entry| entry.content.push_str(chunk))
                .unwrap();
        }
        transcript.finalize_last().unwrap();
        transcript
    }

    #[test]
    fn finalized_entry_is_the_concatenation_of_its_chunks() {
        let transcript = streamed(&["Hi", " there", "", "!"]);
        let last = transcript.entries().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "Hi there!");
        assert!(!last.streaming);
        assert!(transcript.streaming_entry().is_none());
    }

    #[test]
    fn mutations_without_a_streaming_entry_are_rejected_and_leave_state_alone() {
        let mut transcript = streamed(&["done"]);
        let before = transcript.clone();

        assert_eq!(
            transcript.mutate_last(|entry| entry.content.push_str("late")),
            Err(TranscriptRejection::NoStreamingEntry)
        );
        assert_eq!(
            transcript.finalize_last(),
            Err(TranscriptRejection::NoStreamingEntry)
        );
        assert_eq!(transcript, before);
    }

    #[test]
    fn nothing_is_appended_behind_a_streaming_entry() {
        let mut transcript = Transcript::new();
        transcript.append(MessageEntry::assistant_streaming()).unwrap();
        assert_eq!(
            transcript.append(MessageEntry::user("interrupt")),
            Err(TranscriptRejection::StreamingEntryOpen)
        );
        assert_eq!(transcript.len(), 1);
        assert_eq!(
            transcript.entries().iter().filter(|entry| entry.streaming).count(),
            1
        );
    }

    #[test]
    fn persist_then_restore_round_trips_per_namespace() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let namespace = StorageNamespace::User("u-1".into());

        let mut writer = TranscriptStore::new(store.clone(), namespace.clone());
        *writer.transcript_mut() = streamed(&["Hi", " there"]);
        writer.set_selected_document(Some("doc-9".into()));
        writer.persist().unwrap();

        let mut reader = TranscriptStore::new(store.clone(), namespace);
        reader.restore();
        assert_eq!(reader.transcript(), writer.transcript());
        assert_eq!(reader.selected_document(), Some("doc-9"));

        let mut guest = TranscriptStore::new(store, StorageNamespace::Guest);
        guest.restore();
        assert!(guest.transcript().is_empty());
        assert_eq!(guest.selected_document(), None);
    }

    #[test]
    fn corrupt_storage_falls_back_to_empty() {
        let store = Arc::new(MemoryStore::with_entries([
            ("chat_guest_messages", "[{\"type\":\"user\""),
            ("chat_guest_document_id", ""),
        ]));
        let mut transcripts = TranscriptStore::new(store, StorageNamespace::Guest);
        transcripts.restore();
        assert!(transcripts.transcript().is_empty());
        assert_eq!(transcripts.selected_document(), None);
    }

    #[test]
    fn restored_entries_are_never_streaming() {
        let store = Arc::new(MemoryStore::with_entries([(
            "chat_guest_messages",
            r#"[{"type":"assistant","content":"partial","time":"2024-05-01T08:30:00Z","streaming":true}]"#,
        )]));
        let mut transcripts = TranscriptStore::new(store, StorageNamespace::Guest);
        transcripts.restore();
        assert_eq!(transcripts.transcript().len(), 1);
        assert!(transcripts.transcript().streaming_entry().is_none());
    }
}
