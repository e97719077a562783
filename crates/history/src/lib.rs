//! The canvas history: an ordered command log over persistent canvas
//! snapshots. Local commands apply optimistically into a fork that the
//! authoritative remote echo confirms; a remote command arriving out of
//! order rewinds to the fork base and replays. Undo is scoped per context
//! id and bounded by a sliding window of undo points.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use canvas::{CanvasState, TransientCanvasState};
use paint::PaintError;
use protocol::{ContextId, LayerId, Message, MessagePayload};
use tracing::warn;

/// How many undo points behind the present stay undoable.
pub const UNDO_DEPTH_LIMIT: usize = 30;
/// A snapshot is recorded after this many accepted commands.
pub const SNAPSHOT_INTERVAL: usize = 64;
/// Upper bound of dab messages fused into one history transaction.
pub const MAX_MULTIDABS: usize = 128;
/// A local fork longer than this gives up on rewinding and soft-resets.
pub const MAX_FORK_SIZE: usize = 256;

const CATCHUP_REPLAY_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoState {
    Available,
    Undone,
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryError {
    Paint(PaintError),
    NothingToUndo { context_id: ContextId },
    NothingToRedo { context_id: ContextId },
    TooManyMultidabs { count: usize },
}

impl fmt::Display for HistoryError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::Paint(error) => write!(formatter, "paint error: {error}"),
            HistoryError::NothingToUndo { context_id } => {
                write!(formatter, "context {context_id} has nothing to undo")
            }
            HistoryError::NothingToRedo { context_id } => {
                write!(formatter, "context {context_id} has nothing to redo")
            }
            HistoryError::TooManyMultidabs { count } => {
                write!(formatter, "multidab batch of {count} exceeds {MAX_MULTIDABS}")
            }
        }
    }
}

impl std::error::Error for HistoryError {}

impl From<PaintError> for HistoryError {
    fn from(error: PaintError) -> Self {
        HistoryError::Paint(error)
    }
}

/// Cursor movement observed while applying commands, drained on state fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserCursor {
    pub context_id: ContextId,
    pub layer_id: LayerId,
    pub x: i32,
    pub y: i32,
}

/// Where history reports back: the save-point stream after every accepted
/// command, and catchup progress while replaying after a rewind.
pub trait HistorySink: Send {
    fn save_point(&mut self, state: &Arc<CanvasState>, snapshot_requested: bool);
    fn catchup(&mut self, progress: u8);
}

#[derive(Debug)]
struct HistoryEntry {
    msg: Message,
    local: bool,
    undo_state: UndoState,
    snapshot_before: Option<Arc<CanvasState>>,
}

pub struct CanvasHistory {
    entries: Vec<HistoryEntry>,
    current: Arc<CanvasState>,
    fork: VecDeque<Message>,
    fork_base: Option<Arc<CanvasState>>,
    accepted_since_snapshot: usize,
    snapshot_requested: bool,
    local_drawing_in_progress: bool,
    cursor_changes: Vec<UserCursor>,
    sink: Box<dyn HistorySink>,
}

impl CanvasHistory {
    pub fn new(sink: Box<dyn HistorySink>) -> CanvasHistory {
        CanvasHistory {
            entries: Vec::new(),
            current: Arc::new(CanvasState::new()),
            fork: VecDeque::new(),
            fork_base: None,
            accepted_since_snapshot: 0,
            snapshot_requested: false,
            local_drawing_in_progress: false,
            cursor_changes: Vec::new(),
            sink,
        }
    }

    pub fn current_state(&self) -> Arc<CanvasState> {
        self.current.clone()
    }

    /// The latest state if it differs from `prev` (pointer comparison),
    /// along with the cursor movements accumulated since the last fetch.
    pub fn compare_and_get(
        &mut self,
        prev: Option<&Arc<CanvasState>>,
    ) -> Option<(Arc<CanvasState>, Vec<UserCursor>)> {
        let changed = match prev {
            Some(prev) => !Arc::ptr_eq(prev, &self.current),
            None => true,
        };
        if changed {
            Some((self.current.clone(), std::mem::take(&mut self.cursor_changes)))
        } else {
            None
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn fork_len(&self) -> usize {
        self.fork.len()
    }

    /// Suppresses snapshot creation while a local stroke is in flight, so
    /// rewinds never land mid-stroke.
    pub fn set_local_drawing_in_progress(&mut self, in_progress: bool) {
        self.local_drawing_in_progress = in_progress;
    }

    /// Request a snapshot on the next accepted command and hand the current
    /// state to the save-point stream immediately.
    pub fn snapshot(&mut self) {
        self.snapshot_requested = true;
        let state = self.current.clone();
        self.sink.save_point(&state, true);
    }

    /// Discard everything and start from a blank canvas.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.fork.clear();
        self.fork_base = None;
        self.accepted_since_snapshot = 0;
        self.current = Arc::new(CanvasState::new());
    }

    /// Accept the current state as the new authoritative base: the local
    /// fork is discarded and the log starts over.
    pub fn soft_reset(&mut self) {
        self.entries.clear();
        self.fork.clear();
        self.fork_base = None;
        self.accepted_since_snapshot = 0;
    }

    /// Handle one command. Remote commands reconcile against the local fork.
    pub fn handle(&mut self, local: bool, msg: Message) -> Result<(), HistoryError> {
        if local {
            if self.fork.len() >= MAX_FORK_SIZE {
                // Authoritative branch wins from here on; the dropped
                // prediction still arrives later as its own echo.
                warn!(fork_len = self.fork.len(), "local fork too long, soft-resetting");
                self.soft_reset();
                self.sink.catchup(100);
                return Ok(());
            }
            if self.fork.is_empty() {
                self.fork_base = Some(self.current.clone());
            }
            self.fork.push_back(msg.clone());
            let result = self.apply_command(true, msg);
            if result.is_err() {
                self.fork.pop_back();
                if self.fork.is_empty() {
                    self.fork_base = None;
                }
            }
            result
        } else {
            self.handle_remote(msg)
        }
    }

    fn handle_remote(&mut self, msg: Message) -> Result<(), HistoryError> {
        if let Some(expected) = self.fork.front() {
            if *expected == msg {
                // The authoritative echo of our own prediction; the state
                // is already what it should be.
                self.fork.pop_front();
                let confirm_index = self.entries.len() - self.fork.len() - 1;
                self.entries[confirm_index].local = false;
                if self.fork.is_empty() {
                    self.fork_base = None;
                }
                return Ok(());
            }
            return self.rollback_and_replay(msg);
        }
        self.apply_command(false, msg)
    }

    /// A remote command interleaved ahead of our unconfirmed local fork:
    /// rewind to the fork base, apply the remote command, then reapply the
    /// still-valid fork tail.
    fn rollback_and_replay(&mut self, msg: Message) -> Result<(), HistoryError> {
        let Some(base) = self.fork_base.clone() else {
            warn!("fork without base, soft-resetting");
            self.soft_reset();
            self.sink.catchup(100);
            return self.apply_command(false, msg);
        };

        let fork_len = self.fork.len();
        self.entries.truncate(self.entries.len() - fork_len);
        self.current = base;

        let result = self.apply_command(false, msg);
        if let Err(error) = &result {
            warn!(%error, "remote command failed during rollback");
        }
        self.fork_base = Some(self.current.clone());

        let fork_messages: Vec<Message> = self.fork.iter().cloned().collect();
        let total = fork_messages.len();
        let report_progress = total >= CATCHUP_REPLAY_THRESHOLD;
        let mut surviving = VecDeque::with_capacity(total);
        for (index, fork_msg) in fork_messages.into_iter().enumerate() {
            match self.apply_command(true, fork_msg.clone()) {
                Ok(()) => surviving.push_back(fork_msg),
                Err(error) => {
                    warn!(%error, "dropping fork command invalidated by remote");
                }
            }
            if report_progress && index % 16 == 15 {
                self.sink.catchup((index * 100 / total) as u8);
            }
        }
        if report_progress {
            self.sink.catchup(100);
        }
        self.fork = surviving;
        if self.fork.is_empty() {
            self.fork_base = None;
        }
        result
    }

    /// Apply up to [`MAX_MULTIDABS`] contiguous dab commands as one edit.
    /// Each message stays individually addressable in the log; they share
    /// the undo point that preceded them.
    pub fn handle_multidab(
        &mut self,
        local: bool,
        msgs: Vec<Message>,
    ) -> Result<(), HistoryError> {
        let total: usize = msgs.iter().map(|msg| msg.dab_count().unwrap_or(1)).sum();
        if total > MAX_MULTIDABS {
            return Err(HistoryError::TooManyMultidabs { count: total });
        }

        if !local {
            // Remote batches still need fork reconciliation per message.
            for msg in msgs {
                if let Err(error) = self.handle(false, msg) {
                    warn!(%error, "remote dab command discarded");
                }
            }
            return Ok(());
        }

        if self.fork.is_empty() {
            self.fork_base = Some(self.current.clone());
        }

        let mut tcs = TransientCanvasState::new(&self.current);
        let mut applied = Vec::with_capacity(msgs.len());
        for msg in msgs {
            match paint::apply(&mut tcs, &msg) {
                Ok(()) => applied.push(msg),
                Err(error) => {
                    warn!(%error, "dab command in batch discarded");
                }
            }
        }
        if applied.is_empty() {
            return Ok(());
        }

        let state_before = self.current.clone();
        let mut first = true;
        for msg in applied {
            self.fork.push_back(msg.clone());
            self.record_cursor(&msg);
            let snapshot_before = if first && self.take_snapshot_decision() {
                Some(state_before.clone())
            } else {
                None
            };
            first = false;
            self.entries.push(HistoryEntry {
                msg,
                local: true,
                undo_state: UndoState::Available,
                snapshot_before,
            });
            self.accepted_since_snapshot += 1;
        }
        self.current = Arc::new(tcs.persist());
        let state = self.current.clone();
        let snapshot_requested = std::mem::take(&mut self.snapshot_requested);
        self.sink.save_point(&state, snapshot_requested);
        Ok(())
    }

    fn apply_command(&mut self, local: bool, msg: Message) -> Result<(), HistoryError> {
        if let MessagePayload::Undo {
            override_user,
            redo,
        } = msg.payload
        {
            let target = if override_user != 0 {
                override_user
            } else {
                msg.context_id
            };
            if redo {
                self.perform_redo(target)?;
            } else {
                self.perform_undo(target)?;
            }
            // The undo command itself joins the log so fork accounting and
            // rollback replay stay one-to-one with messages.
            self.push_entry(local, msg, self.current.clone());
            return Ok(());
        }

        let state_before = self.current.clone();
        if msg.is_undo_point() {
            self.push_entry(local, msg, state_before);
            self.compact_undo_window();
            return Ok(());
        }

        let mut tcs = TransientCanvasState::new(&self.current);
        paint::apply(&mut tcs, &msg)?;
        self.record_cursor(&msg);
        self.push_entry(local, msg, state_before);
        self.current = Arc::new(tcs.persist());
        self.accepted_since_snapshot += 1;

        let state = self.current.clone();
        let snapshot_requested = std::mem::take(&mut self.snapshot_requested);
        self.sink.save_point(&state, snapshot_requested);
        Ok(())
    }

    fn push_entry(&mut self, local: bool, msg: Message, state_before: Arc<CanvasState>) {
        let snapshot_before = if self.take_snapshot_decision() {
            Some(state_before)
        } else {
            None
        };
        self.entries.push(HistoryEntry {
            msg,
            local,
            undo_state: UndoState::Available,
            snapshot_before,
        });
    }

    fn take_snapshot_decision(&mut self) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        if self.snapshot_requested {
            return true;
        }
        if self.accepted_since_snapshot >= SNAPSHOT_INTERVAL && !self.local_drawing_in_progress {
            self.accepted_since_snapshot = 0;
            return true;
        }
        false
    }

    fn record_cursor(&mut self, msg: &Message) {
        let position = match &msg.payload {
            MessagePayload::DrawDabsClassic {
                layer_id, x, y, dabs, ..
            } => {
                let (dx, dy) = dab_deltas(dabs.iter().map(|dab| (dab.x, dab.y)));
                Some((*layer_id, (*x + dx) / 4, (*y + dy) / 4))
            }
            MessagePayload::DrawDabsPixel {
                layer_id, x, y, dabs, ..
            }
            | MessagePayload::DrawDabsPixelSquare {
                layer_id, x, y, dabs, ..
            } => {
                let (dx, dy) = dab_deltas(dabs.iter().map(|dab| (dab.x, dab.y)));
                Some((*layer_id, *x + dx, *y + dy))
            }
            MessagePayload::DrawDabsMyPaint {
                layer_id, x, y, dabs, ..
            } => {
                let (dx, dy) = dab_deltas(dabs.iter().map(|dab| (dab.x, dab.y)));
                Some((*layer_id, (*x + dx) / 4, (*y + dy) / 4))
            }
            MessagePayload::PutImage { layer_id, x, y, .. }
            | MessagePayload::FillRect { layer_id, x, y, .. } => {
                Some((*layer_id, *x as i32, *y as i32))
            }
            _ => None,
        };
        if let Some((layer_id, x, y)) = position {
            let cursor = UserCursor {
                context_id: msg.context_id,
                layer_id,
                x,
                y,
            };
            match self
                .cursor_changes
                .iter_mut()
                .find(|existing| existing.context_id == cursor.context_id)
            {
                Some(existing) => *existing = cursor,
                None => self.cursor_changes.push(cursor),
            }
        }
    }

    fn perform_undo(&mut self, context_id: ContextId) -> Result<(), HistoryError> {
        let undo_point = self
            .entries
            .iter()
            .rposition(|entry| {
                entry.msg.context_id == context_id
                    && entry.msg.is_undo_point()
                    && entry.undo_state == UndoState::Available
            })
            .ok_or(HistoryError::NothingToUndo { context_id })?;

        for entry in &mut self.entries[undo_point..] {
            if entry.msg.context_id == context_id && entry.undo_state == UndoState::Available {
                entry.undo_state = UndoState::Undone;
            }
        }
        self.recompute_from(undo_point);
        Ok(())
    }

    fn perform_redo(&mut self, context_id: ContextId) -> Result<(), HistoryError> {
        let undo_point = self
            .entries
            .iter()
            .position(|entry| {
                entry.msg.context_id == context_id
                    && entry.msg.is_undo_point()
                    && entry.undo_state == UndoState::Undone
            })
            .ok_or(HistoryError::NothingToRedo { context_id })?;

        self.entries[undo_point].undo_state = UndoState::Available;
        for entry in &mut self.entries[undo_point + 1..] {
            if entry.msg.context_id != context_id {
                continue;
            }
            if entry.msg.is_undo_point() {
                break;
            }
            if entry.undo_state == UndoState::Undone {
                entry.undo_state = UndoState::Available;
            }
        }
        self.recompute_from(undo_point);
        Ok(())
    }

    /// Rebuild the current state from the nearest snapshot at or before
    /// `index` by replaying every non-undone command.
    fn recompute_from(&mut self, index: usize) {
        let start = self.entries[..=index]
            .iter()
            .rposition(|entry| entry.snapshot_before.is_some())
            .expect("the oldest retained entry always carries a snapshot");
        let snapshot = self.entries[start]
            .snapshot_before
            .clone()
            .expect("rposition found a snapshot");

        let mut tcs = TransientCanvasState::new(&snapshot);
        for entry in &self.entries[start..] {
            if entry.undo_state != UndoState::Available {
                continue;
            }
            match &entry.msg.payload {
                MessagePayload::Undo { .. } | MessagePayload::UndoPoint => continue,
                _ => {}
            }
            if let Err(error) = paint::apply(&mut tcs, &entry.msg) {
                warn!(%error, "command failed during history replay");
            }
        }
        self.current = Arc::new(tcs.persist());
        let state = self.current.clone();
        self.sink.save_point(&state, false);
    }

    /// Compact undo points beyond the depth limit to `Gone` and drop the log
    /// prefix up to the newest snapshot that still covers the window.
    fn compact_undo_window(&mut self) {
        // Compaction waits for the fork to settle so the log prefix drop
        // can never eat into unconfirmed local entries.
        if !self.fork.is_empty() {
            return;
        }
        let undo_points: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.msg.is_undo_point() && entry.undo_state != UndoState::Gone
            })
            .map(|(index, _)| index)
            .collect();
        if undo_points.len() <= UNDO_DEPTH_LIMIT {
            return;
        }

        let boundary = undo_points[undo_points.len() - UNDO_DEPTH_LIMIT];
        let cut = self.entries[..=boundary]
            .iter()
            .rposition(|entry| entry.snapshot_before.is_some())
            .unwrap_or(0);

        // Everything before the cut is no longer reachable; entries between
        // the cut and the boundary stay replayable but can't be undone, and
        // their snapshots are freed since replay starts at the new head.
        self.entries.drain(..cut);
        let boundary = boundary - cut;
        for entry in &mut self.entries[..boundary] {
            if entry.msg.is_undo_point() {
                entry.undo_state = UndoState::Gone;
            }
        }
        if boundary > 1 {
            for entry in &mut self.entries[1..boundary] {
                entry.snapshot_before = None;
            }
        }
    }
}

fn dab_deltas(deltas: impl Iterator<Item = (i8, i8)>) -> (i32, i32) {
    let mut dx = 0;
    let mut dy = 0;
    for (x, y) in deltas {
        dx += i32::from(x);
        dy += i32::from(y);
    }
    (dx, dy)
}
