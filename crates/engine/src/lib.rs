//! The paint engine: serializes local and remote command streams through a
//! worker thread into the canvas history, overlays ephemeral previews, and
//! reports tile-level changes back to the GUI on its tick.

pub mod callbacks;
pub mod preview;
pub mod snapshots;
#[cfg(test)]
mod threaded_tests;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use arc_swap::ArcSwapOption;
use canvas::{CanvasDiff, CanvasState, LayerPropsList, TransientCanvasState};
use history::{CanvasHistory, HistorySink, UserCursor};
use pixels::{BIT15, BlendMode, Pixel8, Pixel15};
use protocol::{InternalMessage, LayerId, Message, MessagePayload};
use tiles::{TILE_LENGTH, Tile};
use tracing::warn;

pub use callbacks::{
    AclChangeFlags, AclFilter, AclResult, MetaSink, OpenAcl, PushMessage, RenderSink, SavePoint,
    TickSink,
};
pub use history::{MAX_MULTIDABS, SNAPSHOT_INTERVAL, UNDO_DEPTH_LIMIT};
pub use preview::Preview;
pub use snapshots::{Snapshot, SnapshotQueue, reset_image_build};

/// Counting semaphore over a mutex and condvar. The queue discipline keeps
/// its count equal to the number of queued messages at all times.
struct Semaphore {
    count: Mutex<u64>,
    available: Condvar,
}

impl Semaphore {
    fn new() -> Semaphore {
        Semaphore {
            count: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    fn post(&self, n: u64) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        *count += n;
        self.available.notify_all();
    }

    fn wait(&self) {
        self.wait_many(1);
    }

    fn wait_many(&self, n: u64) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        while *count < n {
            count = self
                .available
                .wait(count)
                .expect("semaphore mutex poisoned");
        }
        *count -= n;
    }
}

/// Pending preview installation handed from the worker to the tick.
#[derive(Debug)]
enum PreviewSlot {
    Clear,
    Set(Arc<Preview>),
}

#[derive(Debug)]
enum QueueMessage {
    Message(Message),
    Preview(PreviewSlot),
}

#[derive(Default)]
struct Queues {
    local: VecDeque<QueueMessage>,
    remote: VecDeque<QueueMessage>,
}

struct EngineShared {
    history: Mutex<CanvasHistory>,
    queues: Mutex<Queues>,
    sem: Semaphore,
    running: AtomicBool,
    catchup: Arc<AtomicI32>,
    next_preview: ArcSwapOption<PreviewSlot>,
}

struct EngineHistorySink {
    save_point: Box<dyn SavePoint>,
    catchup: Arc<AtomicI32>,
}

impl HistorySink for EngineHistorySink {
    fn save_point(&mut self, state: &Arc<CanvasState>, snapshot_requested: bool) {
        self.save_point.save_point(state, snapshot_requested);
    }

    fn catchup(&mut self, progress: u8) {
        self.catchup.store(i32::from(progress), Ordering::Relaxed);
    }
}

/// Latest-value-per-user consolidation of meta messages within one `handle`
/// call, emitted after the queue lock is released.
#[derive(Default)]
struct MetaBuffer {
    acl_change_flags: AclChangeFlags,
    lasers: Vec<(u8, u8, u32)>,
    cursors: Vec<(u8, i32, i32)>,
    default_layer: Option<LayerId>,
}

impl MetaBuffer {
    fn record_laser(&mut self, context_id: u8, persistence: u8, color: u32) {
        match self
            .lasers
            .iter_mut()
            .find(|(existing, _, _)| *existing == context_id)
        {
            Some(entry) => *entry = (context_id, persistence, color),
            None => self.lasers.push((context_id, persistence, color)),
        }
    }

    fn record_cursor(&mut self, context_id: u8, x: i32, y: i32) {
        match self
            .cursors
            .iter_mut()
            .find(|(existing, _, _)| *existing == context_id)
        {
            Some(entry) => *entry = (context_id, x, y),
            None => self.cursors.push((context_id, x, y)),
        }
    }
}

pub struct PaintEngine {
    shared: Arc<EngineShared>,
    acl: Box<dyn AclFilter>,
    worker: Option<JoinHandle<()>>,
    // Tick-side view state, touched only by the GUI thread.
    history_cs: Arc<CanvasState>,
    view_cs: Arc<CanvasState>,
    preview: Option<Arc<Preview>>,
    diff: CanvasDiff,
    checker: Tile,
    hidden_layers: HashSet<LayerId>,
    hidden_changed: bool,
    props_override_cache: Option<(Arc<LayerPropsList>, Arc<LayerPropsList>)>,
    render_width: u32,
    render_height: u32,
}

impl PaintEngine {
    pub fn new(acl: Box<dyn AclFilter>, save_point: Box<dyn SavePoint>) -> PaintEngine {
        let catchup = Arc::new(AtomicI32::new(-1));
        let history = CanvasHistory::new(Box::new(EngineHistorySink {
            save_point,
            catchup: catchup.clone(),
        }));
        let history_cs = history.current_state();

        let shared = Arc::new(EngineShared {
            history: Mutex::new(history),
            queues: Mutex::new(Queues::default()),
            sem: Semaphore::new(),
            running: AtomicBool::new(true),
            catchup,
            next_preview: ArcSwapOption::const_empty(),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("paint_engine".to_owned())
            .spawn(move || run_worker(worker_shared))
            .expect("spawn paint engine thread");

        let gray = Pixel15 {
            b: BIT15 / 2,
            g: BIT15 / 2,
            r: BIT15 / 2,
            a: BIT15,
        };
        let white = Pixel15 {
            b: BIT15,
            g: BIT15,
            r: BIT15,
            a: BIT15,
        };

        PaintEngine {
            shared,
            acl,
            worker: Some(worker),
            view_cs: history_cs.clone(),
            history_cs,
            preview: None,
            diff: CanvasDiff::new(),
            checker: Tile::checker(gray, white),
            hidden_layers: HashSet::new(),
            hidden_changed: false,
            props_override_cache: None,
            render_width: 0,
            render_height: 0,
        }
    }

    /// The state currently presented to the GUI (preview and visibility
    /// overrides applied).
    pub fn canvas_state(&self) -> Arc<CanvasState> {
        self.view_cs.clone()
    }

    pub fn set_local_drawing_in_progress(&mut self, in_progress: bool) {
        self.shared
            .history
            .lock()
            .expect("history mutex poisoned")
            .set_local_drawing_in_progress(in_progress);
    }

    /// Hide or show a layer locally, on top of the authoritative props.
    pub fn set_local_layer_visibility(&mut self, layer_id: LayerId, hidden: bool) {
        let changed = if hidden {
            self.hidden_layers.insert(layer_id)
        } else {
            self.hidden_layers.remove(&layer_id)
        };
        if changed {
            self.hidden_changed = true;
            self.props_override_cache = None;
        }
    }

    /// Filter and enqueue messages. Returns how many were pushed to the
    /// worker; meta messages are consolidated and emitted through `meta`
    /// after the queue lock is released.
    pub fn handle(&mut self, local: bool, msgs: Vec<Message>, meta: &mut dyn MetaSink) -> usize {
        debug_assert!(
            self.shared.running.load(Ordering::Relaxed),
            "handle after free_join"
        );
        let mut buffer = MetaBuffer::default();
        let mut pushed = 0;

        let mut iter = msgs.into_iter();
        let mut first_accepted = None;
        for msg in iter.by_ref() {
            if should_push(local, &msg, self.acl.as_mut(), &mut buffer) {
                first_accepted = Some(msg);
                break;
            }
        }

        // Nothing is locked until a message actually needs pushing.
        if let Some(first) = first_accepted {
            let shared = self.shared.clone();
            let mut queues = shared.queues.lock().expect("queue mutex poisoned");
            let queue = if local {
                &mut queues.local
            } else {
                &mut queues.remote
            };
            queue.push_back(QueueMessage::Message(first));
            pushed = 1;
            for msg in iter {
                if should_push(local, &msg, self.acl.as_mut(), &mut buffer) {
                    queue.push_back(QueueMessage::Message(msg));
                    pushed += 1;
                }
            }
            shared.sem.post(pushed as u64);
        }

        if !buffer.acl_change_flags.is_empty() {
            meta.acls_changed(buffer.acl_change_flags);
        }
        for (context_id, persistence, color) in buffer.lasers {
            meta.laser_trail(context_id, persistence, color);
        }
        for (context_id, x, y) in buffer.cursors {
            meta.move_pointer(context_id, x, y);
        }
        if let Some(layer_id) = buffer.default_layer {
            meta.default_layer_set(layer_id);
        }
        pushed
    }

    /// Install a cut preview: a rectangle (or mask) erased from the target
    /// layer until cleared.
    pub fn preview_cut(
        &mut self,
        layer_id: LayerId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        mask: Option<Vec<u8>>,
    ) {
        let preview = Preview::new_cut(
            layer_id,
            x,
            y,
            width,
            height,
            mask,
            self.view_cs.offset_x(),
            self.view_cs.offset_y(),
        );
        self.sync_preview(PreviewSlot::Set(Arc::new(preview)));
    }

    /// Install a dabs preview from captured draw commands.
    pub fn preview_dabs(&mut self, layer_id: LayerId, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let preview = Preview::new_dabs(
            layer_id,
            messages,
            self.view_cs.offset_x(),
            self.view_cs.offset_y(),
        );
        self.sync_preview(PreviewSlot::Set(Arc::new(preview)));
    }

    pub fn preview_clear(&mut self) {
        self.sync_preview(PreviewSlot::Clear);
    }

    /// Previews travel through the local queue so they serialize with the
    /// commands already in flight; installing them directly would show the
    /// preview before the state it was made against.
    fn sync_preview(&self, slot: PreviewSlot) {
        let mut queues = self.shared.queues.lock().expect("queue mutex poisoned");
        queues.local.push_back(QueueMessage::Preview(slot));
        self.shared.sem.post(1);
    }

    /// Pull changes since the last tick and notify the GUI. Called from the
    /// GUI thread.
    pub fn tick(&mut self, sink: &mut dyn TickSink) {
        let progress = self.shared.catchup.swap(-1, Ordering::Relaxed);
        if progress >= 0 {
            sink.catchup(progress.min(100) as u8);
        }

        let fetched = self
            .shared
            .history
            .lock()
            .expect("history mutex poisoned")
            .compare_and_get(Some(&self.history_cs));

        let mut preview_changed = false;
        if let Some(slot) = self.shared.next_preview.swap(None) {
            preview_changed = true;
            match slot.as_ref() {
                PreviewSlot::Clear => self.preview = None,
                PreviewSlot::Set(preview) => self.preview = Some(preview.clone()),
            }
        }

        let mut cursors: Vec<UserCursor> = Vec::new();
        let history_changed = match fetched {
            Some((state, moved)) => {
                self.history_cs = state;
                cursors = moved;
                true
            }
            None => false,
        };
        let hidden_changed = std::mem::take(&mut self.hidden_changed);
        if !history_changed && !preview_changed && !hidden_changed {
            return;
        }

        let prev = self.view_cs.clone();
        let mut next = self.history_cs.clone();
        if let Some(preview) = &self.preview {
            next = preview.render(&next);
        }
        next = self.apply_hidden_layers(next);
        self.view_cs = next.clone();

        if prev.width() != next.width() || prev.height() != next.height() {
            sink.resized(
                prev.offset_x() - next.offset_x(),
                prev.offset_y() - next.offset_y(),
                prev.width(),
                prev.height(),
            );
        }
        self.diff.check(&next, &prev);
        let mut changed_tiles = Vec::new();
        self.diff.each_pos(|x, y| changed_tiles.push((x, y)));
        for (x, y) in changed_tiles {
            sink.tile_changed(x, y);
        }
        if self.diff.layer_props_changed_reset() {
            sink.layer_props_changed(next.props());
        }
        if !CanvasState::same_annotations(&next, &prev) {
            sink.annotations_changed(next.annotations());
        }
        if !CanvasState::same_metadata(&next, &prev) {
            sink.document_metadata_changed(next.metadata());
        }
        for cursor in cursors {
            sink.cursor_moved(cursor.context_id, cursor.layer_id, cursor.x, cursor.y);
        }
    }

    fn apply_hidden_layers(&mut self, cs: Arc<CanvasState>) -> Arc<CanvasState> {
        if self.hidden_layers.is_empty() {
            return cs;
        }
        let overridden = match &self.props_override_cache {
            Some((source, cached)) if Arc::ptr_eq(source, cs.props()) => cached.clone(),
            _ => {
                let mut list = cs.props().as_ref().clone();
                hide_ids(&mut list, &self.hidden_layers);
                let overridden = Arc::new(list);
                self.props_override_cache = Some((cs.props().clone(), overridden.clone()));
                overridden
            }
        };
        let mut tcs = TransientCanvasState::new(&cs);
        tcs.replace_props(overridden);
        Arc::new(tcs.persist())
    }

    /// Report the output size and resize the render target bookkeeping.
    pub fn prepare_render(&mut self, sink: &mut dyn RenderSink) {
        let width = self.view_cs.width();
        let height = self.view_cs.height();
        sink.render_size(width, height);
        if width != self.render_width || height != self.render_height {
            self.render_width = width;
            self.render_height = height;
            self.diff.mark_all();
        }
    }

    /// Composite every tile in the diff mask and hand the 8-bit pixels to
    /// the sink. Consumes the mask.
    pub fn render(&mut self, sink: &mut dyn RenderSink) {
        let view = self.view_cs.clone();
        let mut positions = Vec::new();
        self.diff.each_pos_reset(|x, y| positions.push((x, y)));

        let mut buffer = vec![Pixel8::TRANSPARENT; TILE_LENGTH];
        for (tile_x, tile_y) in positions {
            if tile_x >= view.tiles_x() || tile_y >= view.tiles_y() {
                continue;
            }
            let mut tile = view.flatten_tile(tile_x, tile_y, true);
            tile.merge(Some(&self.checker), BIT15, BlendMode::Behind);
            pixels::pixels15_to_8(&mut buffer, tile.pixels());
            sink.render_tile(tile_x, tile_y, &buffer);
        }
    }

    /// Stop the worker, join it, and drop anything still queued.
    pub fn free_join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.running.store(false, Ordering::Relaxed);
            self.shared.sem.post(1);
            worker.join().expect("join paint engine thread");
            let mut queues = self.shared.queues.lock().expect("queue mutex poisoned");
            queues.local.clear();
            queues.remote.clear();
        }
    }
}

impl Drop for PaintEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn hide_ids(list: &mut LayerPropsList, ids: &HashSet<LayerId>) {
    for index in 0..list.len() {
        let props = list.at_mut(index);
        if ids.contains(&props.id) {
            props.hidden = true;
        }
        if props.children.is_some() {
            hide_ids(props.children_mut(), ids);
        }
    }
}

fn should_push(
    local: bool,
    msg: &Message,
    acl: &mut dyn AclFilter,
    buffer: &mut MetaBuffer,
) -> bool {
    if local {
        return msg.is_internal_or_command();
    }
    let result = acl.handle(msg);
    buffer.acl_change_flags |= result.change_flags;
    if result.filtered {
        return false;
    }
    if msg.is_internal_or_command() {
        return true;
    }
    match &msg.payload {
        MessagePayload::LaserTrail { persistence, color } => {
            buffer.record_laser(msg.context_id, *persistence, *color);
        }
        MessagePayload::MovePointer { x, y } => {
            buffer.record_cursor(msg.context_id, *x, *y);
        }
        MessagePayload::DefaultLayer { layer_id } => {
            buffer.default_layer = Some(*layer_id);
        }
        _ => {}
    }
    false
}

fn run_worker(shared: Arc<EngineShared>) {
    loop {
        shared.sem.wait();
        if !shared.running.load(Ordering::Relaxed) {
            break;
        }
        process_next(&shared);
    }
}

enum Batch {
    Preview(PreviewSlot),
    Messages(Vec<Message>),
}

fn process_next(shared: &EngineShared) {
    let (local, batch) = {
        let mut queues = shared.queues.lock().expect("queue mutex poisoned");
        // Local strokes stay responsive by draining ahead of remote traffic.
        let (local, first) = match queues.local.pop_front() {
            Some(item) => (true, item),
            None => match queues.remote.pop_front() {
                Some(item) => (false, item),
                None => return,
            },
        };
        match first {
            QueueMessage::Preview(slot) => (local, Batch::Preview(slot)),
            QueueMessage::Message(msg) => {
                let mut msgs = vec![msg];
                if let Some(initial) = msgs[0].dab_count()
                    && initial < MAX_MULTIDABS
                {
                    let queue = if local {
                        &mut queues.local
                    } else {
                        &mut queues.remote
                    };
                    let mut total = initial;
                    let mut extra = 0u64;
                    loop {
                        let take = match queue.front() {
                            Some(QueueMessage::Message(next)) => match next.dab_count() {
                                Some(count) if total + count <= MAX_MULTIDABS => {
                                    total += count;
                                    true
                                }
                                _ => false,
                            },
                            _ => false,
                        };
                        if !take {
                            break;
                        }
                        match queue.pop_front() {
                            Some(QueueMessage::Message(next)) => msgs.push(next),
                            _ => unreachable!("front was just checked"),
                        }
                        extra += 1;
                    }
                    if extra > 0 {
                        // The semaphore counts the batched items too; drain
                        // them in lockstep so count == queued holds.
                        shared.sem.wait_many(extra);
                    }
                }
                (local, Batch::Messages(msgs))
            }
        }
    };

    match batch {
        Batch::Preview(slot) => {
            shared.next_preview.store(Some(Arc::new(slot)));
        }
        Batch::Messages(mut msgs) if msgs.len() == 1 => {
            let msg = msgs.pop().expect("single message batch");
            if let MessagePayload::Internal(internal) = &msg.payload {
                handle_internal(shared, *internal);
            } else {
                let mut history = shared.history.lock().expect("history mutex poisoned");
                if let Err(error) = history.handle(local, msg) {
                    warn!(%error, local, "command discarded");
                }
            }
        }
        Batch::Messages(msgs) => {
            let mut history = shared.history.lock().expect("history mutex poisoned");
            if let Err(error) = history.handle_multidab(local, msgs) {
                warn!(%error, local, "dab batch discarded");
            }
        }
    }
}

fn handle_internal(shared: &EngineShared, internal: InternalMessage) {
    let mut history = shared.history.lock().expect("history mutex poisoned");
    match internal {
        InternalMessage::Reset => history.reset(),
        InternalMessage::SoftReset => history.soft_reset(),
        InternalMessage::Snapshot => history.snapshot(),
        InternalMessage::Catchup { progress } => {
            shared
                .catchup
                .store(i32::from(progress.min(100)), Ordering::Relaxed);
        }
    }
}
