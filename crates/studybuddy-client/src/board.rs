//! Local view of one message log (a group, or the caller's personal notes).
//!
//! The board keeps entries oldest first. Pages are fetched newest first by
//! offset; the cursor counts how far back into the server's log we have read.
//! Deletes elsewhere can push the cursor past unread rows; `load_more`
//! detects that against the oldest loaded message.
//! Deletes are applied optimistically behind a pending marker and either
//! confirmed or rolled back when the server answers.
//!
//! State sits behind a mutex that is never held across an await, so a UI can
//! share one board between concurrent tasks.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::{debug, warn};

use studybuddy_types::api::{SendMessageRequest, UploadKind};
use studybuddy_types::events::GatewayEvent;
use studybuddy_types::models::Message;

use crate::api::BoardApi;
use crate::error::{ClientError, ClientResult};

/// A file chosen in the composer, not yet uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_type: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Delete,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    pending: Option<Pending>,
}

#[derive(Debug, Default)]
struct Draft {
    text: String,
    attachment: Option<Attachment>,
}

#[derive(Debug, Default)]
struct BoardState {
    entries: Vec<Entry>,
    cursor: u32,
    has_more: bool,
    sending: bool,
    draft: Draft,
}

impl BoardState {
    fn contains(&self, id: i64) -> bool {
        self.entries.iter().any(|e| e.message.id == id)
    }

    fn insert_sorted(&mut self, message: Message) {
        let key = message.sort_key();
        let at = self.entries.partition_point(|e| e.message.sort_key() < key);
        self.entries.insert(at, Entry { message, pending: None });
    }

    fn set_pending(&mut self, id: i64, pending: Option<Pending>) -> bool {
        match self.entries.iter_mut().find(|e| e.message.id == id) {
            Some(entry) => {
                entry.pending = pending;
                true
            }
            None => false,
        }
    }
}

pub struct MessageBoard<A> {
    api: A,
    user_id: i64,
    group_id: Option<i64>,
    page_size: u32,
    state: Mutex<BoardState>,
}

impl<A: BoardApi> MessageBoard<A> {
    /// `group_id == None` opens the caller's personal notes.
    pub fn new(api: A, user_id: i64, group_id: Option<i64>, page_size: u32) -> Self {
        Self {
            api,
            user_id,
            group_id,
            page_size: page_size.max(1),
            state: Mutex::new(BoardState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn group_id(&self) -> Option<i64> {
        self.group_id
    }

    /// Visible messages, oldest first. Pending deletes are hidden.
    pub fn messages(&self) -> Vec<Message> {
        self.state()
            .entries
            .iter()
            .filter(|e| e.pending.is_none())
            .map(|e| e.message.clone())
            .collect()
    }

    /// Whether "load more" should still be offered.
    pub fn has_more(&self) -> bool {
        self.state().has_more
    }

    pub fn is_sending(&self) -> bool {
        self.state().sending
    }

    // -- Paging --

    /// Fetch the newest page and replace whatever was loaded.
    pub async fn load_initial(&self) -> ClientResult<()> {
        let mut page = self.api.list_recent(self.group_id, 0, self.page_size).await?;
        let returned = page.len() as u32;
        page.reverse();

        let mut state = self.state();
        state.entries = page.into_iter().map(|message| Entry { message, pending: None }).collect();
        state.cursor = returned;
        state.has_more = returned == self.page_size;
        Ok(())
    }

    /// Fetch the next older page. Returns how many new messages were added.
    ///
    /// A short page means the start of the log was reached. Each fetch reads
    /// one row of overlap with the oldest loaded message; if the page starts
    /// below it, rows were deleted upstream and the cursor has overshot, so
    /// the fetch steps back a page and tries again.
    pub async fn load_more(&self) -> ClientResult<usize> {
        let (mut offset, anchor) = {
            let state = self.state();
            if !state.has_more {
                return Ok(0);
            }
            (state.cursor, state.entries.first().map(|e| e.message.sort_key()))
        };

        let (page, start, more) = loop {
            let overlap = u32::from(anchor.is_some() && offset > 0);
            let start = offset - overlap;
            let page = self.api.list_recent(self.group_id, start, self.page_size + overlap).await?;

            let overshot = match (anchor, page.first()) {
                (Some(anchor), Some(newest)) => start > 0 && newest.sort_key() < anchor,
                (Some(_), None) => start > 0,
                (None, _) => false,
            };
            if !overshot {
                let more = page.len() as u32 == self.page_size + overlap;
                break (page, start, more);
            }
            debug!("paging cursor {} overshot the server log, stepping back", offset);
            offset = start.saturating_sub(self.page_size);
        };

        let mut state = self.state();
        state.cursor = start + page.len() as u32;
        state.has_more = more;

        // Messages that arrived since the last fetch shift offsets forward.
        let mut added = 0;
        for message in page {
            if !state.contains(message.id) {
                state.insert_sorted(message);
                added += 1;
            }
        }
        Ok(added)
    }

    // -- Realtime --

    /// True when `event` means this board's log changed.
    pub fn is_relevant(&self, event: &GatewayEvent) -> bool {
        match (event, self.group_id) {
            (GatewayEvent::MessagesChanged { group_id }, Some(active)) => *group_id == active,
            (GatewayEvent::PersonalMessagesChanged, None) => true,
            _ => false,
        }
    }

    /// Refetch the first page if `event` concerns this board.
    pub async fn on_realtime_event(&self, event: &GatewayEvent) -> ClientResult<bool> {
        if !self.is_relevant(event) {
            return Ok(false);
        }
        self.refresh_tail().await?;
        Ok(true)
    }

    /// Re-read the newest page and reconcile it with what is loaded.
    ///
    /// If the page overlaps the loaded log, it replaces the newest part and
    /// keeps older pages. Otherwise too much changed and the board restarts
    /// from that page.
    pub async fn refresh_tail(&self) -> ClientResult<()> {
        let page = self.api.list_recent(self.group_id, 0, self.page_size).await?;
        let full_page = page.len() as u32 == self.page_size;

        let mut state = self.state();
        let overlaps = page.iter().any(|m| state.contains(m.id));

        if full_page && !overlaps {
            debug!("realtime refetch found no overlap, restarting the log");
            let mut page = page;
            page.reverse();
            state.entries = page.into_iter().map(|message| Entry { message, pending: None }).collect();
            state.cursor = state.entries.len() as u32;
            state.has_more = true;
            return Ok(());
        }

        let fresh: HashSet<i64> = page.iter().map(|m| m.id).collect();
        // A short page is the whole log.
        let window_start = if full_page {
            page.iter().map(Message::sort_key).min()
        } else {
            None
        };

        // Rows inside the window that the server no longer returns were deleted.
        state.entries.retain(|e| {
            let in_window = window_start.is_none_or(|start| e.message.sort_key() >= start);
            !in_window || fresh.contains(&e.message.id)
        });
        for message in page {
            if !state.contains(message.id) {
                state.insert_sorted(message);
            }
        }

        state.cursor = state.entries.len() as u32;
        if !full_page {
            state.has_more = false;
        }
        Ok(())
    }

    // -- Composer --

    pub fn set_draft_text(&self, text: impl Into<String>) {
        self.state().draft.text = text.into();
    }

    pub fn draft_text(&self) -> String {
        self.state().draft.text.clone()
    }

    /// Attach a file, rejecting it before any upload if it is over the ceiling.
    pub fn attach(&self, attachment: Attachment) -> ClientResult<()> {
        let limit = UploadKind::Attachment.max_bytes();
        if attachment.body.len() > limit {
            return Err(ClientError::AttachmentTooLarge {
                size: attachment.body.len(),
                limit,
            });
        }
        self.state().draft.attachment = Some(attachment);
        Ok(())
    }

    pub fn attachment(&self) -> Option<Attachment> {
        self.state().draft.attachment.clone()
    }

    pub fn clear_attachment(&self) {
        self.state().draft.attachment = None;
    }

    /// Send is offered only when idle and the draft has content.
    pub fn can_send(&self) -> bool {
        let state = self.state();
        !state.sending && (!state.draft.text.trim().is_empty() || state.draft.attachment.is_some())
    }

    /// Upload the attachment (if any), then post the message.
    ///
    /// On any failure the draft is left untouched so the user can retry.
    pub async fn send(&self) -> ClientResult<Message> {
        let (text, attachment) = {
            let mut state = self.state();
            if state.sending {
                return Err(ClientError::SendInFlight);
            }
            let text = Some(state.draft.text.trim().to_string()).filter(|t| !t.is_empty());
            let attachment = state.draft.attachment.clone();
            if text.is_none() && attachment.is_none() {
                return Err(ClientError::EmptyMessage);
            }
            state.sending = true;
            (text, attachment)
        };

        let result = self.upload_and_post(text, attachment).await;

        let mut state = self.state();
        state.sending = false;
        match result {
            Ok(message) => {
                state.draft = Draft::default();
                if !state.contains(message.id) {
                    state.insert_sorted(message.clone());
                    state.cursor += 1;
                }
                Ok(message)
            }
            Err(e) => {
                warn!("send failed, keeping draft: {}", e);
                Err(e)
            }
        }
    }

    async fn upload_and_post(
        &self,
        text: Option<String>,
        attachment: Option<Attachment>,
    ) -> ClientResult<Message> {
        let attachment_url = match attachment {
            Some(file) => Some(
                self.api
                    .upload(UploadKind::Attachment, &file.content_type, file.body)
                    .await?,
            ),
            None => None,
        };

        self.api
            .send_message(SendMessageRequest {
                group_id: self.group_id,
                message: text,
                attachment_url,
            })
            .await
    }

    // -- Deletes --

    /// Hide the message at once, then confirm with the server.
    ///
    /// On failure the message reappears in its original position.
    pub async fn delete(&self, message_id: i64) -> ClientResult<()> {
        {
            let mut state = self.state();
            let Some(entry) = state.entries.iter().find(|e| e.message.id == message_id) else {
                return Ok(());
            };
            if entry.message.author_id != self.user_id {
                return Err(ClientError::NotAuthor);
            }
            state.set_pending(message_id, Some(Pending::Delete));
        }

        let result = self.api.delete_message(message_id).await;

        let mut state = self.state();
        match result {
            Ok(()) => {
                let before = state.entries.len();
                state.entries.retain(|e| e.message.id != message_id);
                if state.entries.len() < before {
                    state.cursor = state.cursor.saturating_sub(1);
                }
                Ok(())
            }
            Err(e) => {
                warn!("delete of message {} failed, restoring it: {}", message_id, e);
                state.set_pending(message_id, None);
                Err(e)
            }
        }
    }
}
