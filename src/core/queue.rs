//! Multi-file send queue: a pure reducer.
//!
//! The engine sends one file at a time; the queue is the FIFO in front of
//! it. All transitions go through [`reduce`], which returns a new state
//! and bumps `revision` only on observable change. Applying the same
//! action twice is safe, and the UI can diff on the revision alone.

use crate::core::transfer::source::SendFile;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

// ── Items ────────────────────────────────────────────────────────────────────

/// Lifecycle of one queued file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendItemStatus {
    Queued,
    Sending,
    Completed,
    Failed,
}

/// One entry in the send queue.
#[derive(Debug, Clone)]
pub struct SendQueueItem {
    pub id: Uuid,
    pub file: Arc<SendFile>,
    pub status: SendItemStatus,
    pub sent_bytes: u64,
    pub total_bytes: u64,
    /// 0–100, clamped.
    pub progress_percent: u8,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── State / actions ──────────────────────────────────────────────────────────

/// Whole-queue state. Cheap to clone; items share their `SendFile`s.
#[derive(Debug, Clone, Default)]
pub struct SendQueueState {
    pub items: Vec<SendQueueItem>,
    /// Bumped on every observable change.
    pub revision: u64,
}

impl SendQueueState {
    /// At most one item is `Sending` at any instant.
    pub fn sending(&self) -> Option<&SendQueueItem> {
        self.items.iter().find(|i| i.status == SendItemStatus::Sending)
    }

    /// The next file eligible to start, FIFO.
    pub fn next_queued(&self) -> Option<&SendQueueItem> {
        self.items.iter().find(|i| i.status == SendItemStatus::Queued)
    }

    pub fn get(&self, id: Uuid) -> Option<&SendQueueItem> {
        self.items.iter().find(|i| i.id == id)
    }
}

/// Everything that can happen to the queue.
#[derive(Debug, Clone)]
pub enum SendQueueAction {
    Enqueue { id: Uuid, file: Arc<SendFile> },
    MarkSending { id: Uuid },
    UpdateProgress { id: Uuid, sent_bytes: u64 },
    MarkCompleted { id: Uuid },
    MarkFailed { id: Uuid, error: String },
    Retry { id: Uuid },
    Remove { id: Uuid },
    ClearCompleted,
    Reset,
}

// ── Reducer ──────────────────────────────────────────────────────────────────

/// Apply one action. Pure: no I/O, no interior mutation of the input.
pub fn reduce(state: &SendQueueState, action: SendQueueAction, now_ms: u64) -> SendQueueState {
    let mut next = state.clone();
    let changed = apply(&mut next, action, now_ms);
    if changed {
        next.revision = state.revision + 1;
    }
    next
}

fn apply(state: &mut SendQueueState, action: SendQueueAction, now_ms: u64) -> bool {
    match action {
        SendQueueAction::Enqueue { id, file } => {
            if state.items.iter().any(|i| i.id == id) {
                return false;
            }
            let total_bytes = file.size;
            state.items.push(SendQueueItem {
                id,
                file,
                status: SendItemStatus::Queued,
                sent_bytes: 0,
                total_bytes,
                progress_percent: 0,
                attempts: 0,
                error_message: None,
                created_at: now_ms,
                updated_at: now_ms,
            });
            true
        }

        SendQueueAction::MarkSending { id } => {
            if !state.items.iter().any(|i| i.id == id) {
                return false;
            }
            // Only one item may be active: demote any other sender first.
            for item in &mut state.items {
                if item.id != id && item.status == SendItemStatus::Sending {
                    item.status = SendItemStatus::Queued;
                    item.updated_at = now_ms;
                }
            }
            let item = state.items.iter_mut().find(|i| i.id == id).unwrap();
            item.status = SendItemStatus::Sending;
            item.attempts += 1;
            item.error_message = None;
            item.updated_at = now_ms;
            true
        }

        SendQueueAction::UpdateProgress { id, sent_bytes } => {
            let Some(item) = state.items.iter_mut().find(|i| i.id == id) else {
                return false;
            };
            if item.status != SendItemStatus::Sending {
                return false;
            }
            let clamped = sent_bytes.min(item.total_bytes);
            let percent = if item.total_bytes == 0 {
                100
            } else {
                ((clamped * 100) / item.total_bytes) as u8
            };
            if item.sent_bytes == clamped && item.progress_percent == percent {
                return false;
            }
            item.sent_bytes = clamped;
            item.progress_percent = percent;
            item.updated_at = now_ms;
            true
        }

        SendQueueAction::MarkCompleted { id } => {
            let Some(item) = state.items.iter_mut().find(|i| i.id == id) else {
                return false;
            };
            if item.status == SendItemStatus::Completed {
                return false;
            }
            item.status = SendItemStatus::Completed;
            item.sent_bytes = item.total_bytes;
            item.progress_percent = 100;
            item.updated_at = now_ms;
            true
        }

        SendQueueAction::MarkFailed { id, error } => {
            let Some(item) = state.items.iter_mut().find(|i| i.id == id) else {
                return false;
            };
            item.status = SendItemStatus::Failed;
            item.error_message = Some(error);
            item.updated_at = now_ms;
            true
        }

        SendQueueAction::Retry { id } => {
            let Some(item) = state.items.iter_mut().find(|i| i.id == id) else {
                return false;
            };
            if item.status != SendItemStatus::Failed {
                return false;
            }
            item.status = SendItemStatus::Queued;
            item.sent_bytes = 0;
            item.progress_percent = 0;
            item.error_message = None;
            item.updated_at = now_ms;
            true
        }

        SendQueueAction::Remove { id } => {
            let Some(index) = state.items.iter().position(|i| i.id == id) else {
                return false;
            };
            // An in-flight item must be failed or completed first.
            if state.items[index].status == SendItemStatus::Sending {
                return false;
            }
            state.items.remove(index);
            true
        }

        SendQueueAction::ClearCompleted => {
            let before = state.items.len();
            state.items.retain(|i| i.status != SendItemStatus::Completed);
            state.items.len() != before
        }

        SendQueueAction::Reset => {
            if state.items.is_empty() {
                return false;
            }
            state.items.clear();
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, size: usize) -> Arc<SendFile> {
        Arc::new(SendFile::from_bytes(name, "", 0, vec![0u8; size]))
    }

    fn enqueue(state: &SendQueueState, name: &str, size: usize) -> (SendQueueState, Uuid) {
        let id = Uuid::new_v4();
        let next = reduce(
            state,
            SendQueueAction::Enqueue {
                id,
                file: file(name, size),
            },
            1,
        );
        (next, id)
    }

    #[test]
    fn fifo_lifecycle() {
        let (state, a) = enqueue(&SendQueueState::default(), "a.bin", 100);
        let (state, b) = enqueue(&state, "b.bin", 100);
        assert_eq!(state.next_queued().unwrap().id, a);

        let state = reduce(&state, SendQueueAction::MarkSending { id: a }, 2);
        assert_eq!(state.sending().unwrap().id, a);
        assert_eq!(state.sending().unwrap().attempts, 1);
        assert_eq!(state.next_queued().unwrap().id, b);

        let state = reduce(&state, SendQueueAction::MarkCompleted { id: a }, 3);
        assert!(state.sending().is_none());
        assert_eq!(state.get(a).unwrap().progress_percent, 100);
        assert_eq!(state.next_queued().unwrap().id, b);
    }

    #[test]
    fn only_one_item_sends_at_a_time() {
        let (state, a) = enqueue(&SendQueueState::default(), "a.bin", 100);
        let (state, b) = enqueue(&state, "b.bin", 100);

        let state = reduce(&state, SendQueueAction::MarkSending { id: a }, 2);
        let state = reduce(&state, SendQueueAction::MarkSending { id: b }, 3);

        let sending: Vec<_> = state
            .items
            .iter()
            .filter(|i| i.status == SendItemStatus::Sending)
            .collect();
        assert_eq!(sending.len(), 1);
        assert_eq!(sending[0].id, b);
        assert_eq!(state.get(a).unwrap().status, SendItemStatus::Queued);
    }

    #[test]
    fn progress_clamps_and_ignores_non_sending() {
        let (state, a) = enqueue(&SendQueueState::default(), "a.bin", 100);

        // Not sending yet: ignored, revision unchanged.
        let next = reduce(
            &state,
            SendQueueAction::UpdateProgress { id: a, sent_bytes: 10 },
            2,
        );
        assert_eq!(next.revision, state.revision);

        let state = reduce(&state, SendQueueAction::MarkSending { id: a }, 2);
        let state = reduce(
            &state,
            SendQueueAction::UpdateProgress {
                id: a,
                sent_bytes: 5_000,
            },
            3,
        );
        let item = state.get(a).unwrap();
        assert_eq!(item.sent_bytes, 100);
        assert_eq!(item.progress_percent, 100);
    }

    #[test]
    fn retry_requeues_only_failures() {
        let (state, a) = enqueue(&SendQueueState::default(), "a.bin", 100);
        let state = reduce(&state, SendQueueAction::MarkSending { id: a }, 2);
        let state = reduce(
            &state,
            SendQueueAction::MarkFailed {
                id: a,
                error: "TRANSFER_TIMEOUT".into(),
            },
            3,
        );
        assert_eq!(state.get(a).unwrap().status, SendItemStatus::Failed);

        let state = reduce(&state, SendQueueAction::Retry { id: a }, 4);
        let item = state.get(a).unwrap();
        assert_eq!(item.status, SendItemStatus::Queued);
        assert_eq!(item.attempts, 1);
        assert!(item.error_message.is_none());
        assert_eq!(item.sent_bytes, 0);

        // Retry of a queued item is a no-op.
        let again = reduce(&state, SendQueueAction::Retry { id: a }, 5);
        assert_eq!(again.revision, state.revision);
    }

    #[test]
    fn remove_refuses_sending_items_and_absent_ids_are_noops() {
        let (state, a) = enqueue(&SendQueueState::default(), "a.bin", 100);
        let state = reduce(&state, SendQueueAction::MarkSending { id: a }, 2);

        let next = reduce(&state, SendQueueAction::Remove { id: a }, 3);
        assert_eq!(next.revision, state.revision);
        assert!(next.get(a).is_some());

        let next = reduce(&state, SendQueueAction::Remove { id: Uuid::new_v4() }, 3);
        assert_eq!(next.revision, state.revision);
    }

    #[test]
    fn clear_completed_is_idempotent() {
        let (state, a) = enqueue(&SendQueueState::default(), "a.bin", 100);
        let (state, _b) = enqueue(&state, "b.bin", 100);
        let state = reduce(&state, SendQueueAction::MarkSending { id: a }, 2);
        let state = reduce(&state, SendQueueAction::MarkCompleted { id: a }, 3);

        let cleared = reduce(&state, SendQueueAction::ClearCompleted, 4);
        assert_eq!(cleared.items.len(), 1);
        assert!(cleared.get(a).is_none());

        // Already clean: same state, same revision.
        let again = reduce(&cleared, SendQueueAction::ClearCompleted, 5);
        assert_eq!(again.revision, cleared.revision);
        assert_eq!(again.items.len(), 1);
    }

    #[test]
    fn zero_byte_files_complete_at_100_percent() {
        let (state, a) = enqueue(&SendQueueState::default(), "empty.bin", 0);
        let state = reduce(&state, SendQueueAction::MarkSending { id: a }, 2);
        let state = reduce(
            &state,
            SendQueueAction::UpdateProgress { id: a, sent_bytes: 0 },
            3,
        );
        assert_eq!(state.get(a).unwrap().progress_percent, 100);
    }

    #[test]
    fn duplicate_enqueue_is_a_noop() {
        let (state, a) = enqueue(&SendQueueState::default(), "a.bin", 100);
        let next = reduce(
            &state,
            SendQueueAction::Enqueue {
                id: a,
                file: file("a.bin", 100),
            },
            2,
        );
        assert_eq!(next.revision, state.revision);
        assert_eq!(next.items.len(), 1);
    }
}
