use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use canvas::CanvasState;
use pixels::{BlendMode, Pixel15, UPixel15};
use protocol::{LayerId, Message, MessagePayload, PixelDab};

use crate::callbacks::{
    AclChangeFlags, AclFilter, AclResult, MetaSink, OpenAcl, SavePoint, TickSink,
};
use crate::{PaintEngine, RenderSink};

const POLL_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_SLEEP: Duration = Duration::from_millis(2);

#[derive(Default)]
struct CountingSave {
    count: Arc<AtomicUsize>,
}

impl SavePoint for CountingSave {
    fn save_point(&mut self, _state: &Arc<CanvasState>, _snapshot_requested: bool) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct CollectingMeta {
    acl_flags: Vec<AclChangeFlags>,
    lasers: Vec<(u8, u8, u32)>,
    cursors: Vec<(u8, i32, i32)>,
    default_layers: Vec<LayerId>,
}

impl MetaSink for CollectingMeta {
    fn acls_changed(&mut self, flags: AclChangeFlags) {
        self.acl_flags.push(flags);
    }

    fn laser_trail(&mut self, context_id: u8, persistence: u8, color: u32) {
        self.lasers.push((context_id, persistence, color));
    }

    fn move_pointer(&mut self, context_id: u8, x: i32, y: i32) {
        self.cursors.push((context_id, x, y));
    }

    fn default_layer_set(&mut self, layer_id: LayerId) {
        self.default_layers.push(layer_id);
    }
}

#[derive(Default)]
struct CollectingTick {
    catchups: Vec<u8>,
    resizes: Vec<(i32, i32, u32, u32)>,
    tiles: Vec<(u32, u32)>,
    props_changes: usize,
    cursor_moves: Vec<(u8, LayerId, i32, i32)>,
}

impl TickSink for CollectingTick {
    fn catchup(&mut self, progress: u8) {
        self.catchups.push(progress);
    }

    fn resized(&mut self, offset_x: i32, offset_y: i32, prev_width: u32, prev_height: u32) {
        self.resizes.push((offset_x, offset_y, prev_width, prev_height));
    }

    fn tile_changed(&mut self, tile_x: u32, tile_y: u32) {
        if !self.tiles.contains(&(tile_x, tile_y)) {
            self.tiles.push((tile_x, tile_y));
        }
    }

    fn layer_props_changed(&mut self, _props: &Arc<canvas::LayerPropsList>) {
        self.props_changes += 1;
    }

    fn annotations_changed(&mut self, _annotations: &Arc<canvas::AnnotationList>) {}

    fn document_metadata_changed(&mut self, _metadata: &Arc<canvas::DocumentMetadata>) {}

    fn cursor_moved(&mut self, context_id: u8, layer_id: LayerId, x: i32, y: i32) {
        self.cursor_moves.push((context_id, layer_id, x, y));
    }
}

#[derive(Default)]
struct CollectingRender {
    sizes: Vec<(u32, u32)>,
    tiles: Vec<(u32, u32, Vec<pixels::Pixel8>)>,
}

impl RenderSink for CollectingRender {
    fn render_size(&mut self, width: u32, height: u32) {
        self.sizes.push((width, height));
    }

    fn render_tile(&mut self, tile_x: u32, tile_y: u32, pixels: &[pixels::Pixel8]) {
        self.tiles.push((tile_x, tile_y, pixels.to_vec()));
    }
}

fn new_engine() -> (PaintEngine, Arc<AtomicUsize>) {
    let save = CountingSave::default();
    let count = save.count.clone();
    (
        PaintEngine::new(Box::new(OpenAcl), Box::new(save)),
        count,
    )
}

fn resize_msg() -> Message {
    Message::new(
        1,
        MessagePayload::CanvasResize {
            top: 0,
            right: 100,
            bottom: 100,
            left: 0,
        },
    )
}

fn layer_create_msg(layer_id: LayerId) -> Message {
    Message::new(
        1,
        MessagePayload::LayerCreate {
            layer_id,
            source_id: 0,
            fill: 0,
            flags: 0,
            title: "Layer".into(),
        },
    )
}

fn dab_msg(x: i32) -> Message {
    Message::new(
        1,
        MessagePayload::DrawDabsPixel {
            layer_id: 0x100,
            x,
            y: 50,
            color: 0xffff_0000,
            blend_mode: BlendMode::Normal as u8,
            indirect: false,
            dabs: vec![PixelDab {
                x: 0,
                y: 0,
                size: 8,
                opacity: 0xff,
            }],
        },
    )
}

/// Tick until `done` returns true or the poll deadline passes.
fn tick_until(
    engine: &mut PaintEngine,
    sink: &mut CollectingTick,
    done: impl Fn(&CollectingTick) -> bool,
) {
    let deadline = Instant::now() + POLL_TIMEOUT;
    while !done(sink) {
        assert!(Instant::now() < deadline, "timed out waiting for ticks");
        engine.tick(sink);
        std::thread::sleep(POLL_SLEEP);
    }
}

/// Tick until the presented canvas shows `expected` at `(x, y)`.
fn tick_until_pixel(engine: &mut PaintEngine, x: u32, y: u32, expected: Pixel15) {
    let mut sink = CollectingTick::default();
    let deadline = Instant::now() + POLL_TIMEOUT;
    loop {
        let state = engine.canvas_state();
        if state.width() > x && state.height() > y && state.flatten_pixel_at(x, y) == expected {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for pixel");
        engine.tick(&mut sink);
        std::thread::sleep(POLL_SLEEP);
    }
}

#[test]
fn commands_flow_through_the_worker_into_the_canvas() {
    let (mut engine, _) = new_engine();
    let mut meta = CollectingMeta::default();
    let pushed = engine.handle(
        false,
        vec![resize_msg(), layer_create_msg(0x100), dab_msg(50)],
        &mut meta,
    );
    assert_eq!(pushed, 3);

    let mut sink = CollectingTick::default();
    tick_until(&mut engine, &mut sink, |sink| {
        !sink.tiles.is_empty() && !sink.cursor_moves.is_empty()
    });

    let state = engine.canvas_state();
    assert_eq!(state.width(), 100);
    let red = UPixel15::from_argb8(0xffff_0000).premultiply();
    assert_eq!(state.flatten_pixel_at(50, 50), red);
    assert!(
        sink.resizes.len() == 1,
        "one resize notification for the dimension change"
    );
    assert!(sink.props_changes >= 1, "layer create changes props");
    assert!(
        sink.cursor_moves.iter().any(|(context, ..)| *context == 1),
        "dab reports a cursor move"
    );
}

#[test]
fn single_dab_diff_marks_exactly_one_tile() {
    let (mut engine, _) = new_engine();
    let mut meta = CollectingMeta::default();
    engine.handle(false, vec![resize_msg(), layer_create_msg(0x100)], &mut meta);
    let mut sink = CollectingTick::default();
    tick_until(&mut engine, &mut sink, |sink| sink.props_changes >= 1);
    engine.render(&mut CollectingRender::default());

    let mut sink = CollectingTick::default();
    engine.handle(
        false,
        vec![
            Message::new(
                1,
                MessagePayload::DrawDabsPixel {
                    layer_id: 0x100,
                    x: 20,
                    y: 20,
                    color: 0xffff_0000,
                    blend_mode: BlendMode::Normal as u8,
                    indirect: false,
                    dabs: vec![PixelDab {
                        x: 0,
                        y: 0,
                        size: 8,
                        opacity: 0xff,
                    }],
                },
            ),
            Message::new(1, MessagePayload::PenUp),
        ],
        &mut meta,
    );
    tick_until(&mut engine, &mut sink, |sink| !sink.tiles.is_empty());
    assert_eq!(sink.tiles, vec![(0, 0)]);
}

#[test]
fn meta_messages_consolidate_to_latest_value_per_user() {
    let (mut engine, _) = new_engine();
    let mut meta = CollectingMeta::default();
    let pushed = engine.handle(
        false,
        vec![
            Message::new(
                3,
                MessagePayload::LaserTrail {
                    persistence: 1,
                    color: 0x0000_00ff,
                },
            ),
            Message::new(
                4,
                MessagePayload::LaserTrail {
                    persistence: 2,
                    color: 0x0000_ff00,
                },
            ),
            Message::new(
                3,
                MessagePayload::LaserTrail {
                    persistence: 9,
                    color: 0x00ff_0000,
                },
            ),
            Message::new(3, MessagePayload::MovePointer { x: 5, y: 6 }),
            Message::new(3, MessagePayload::MovePointer { x: 7, y: 8 }),
            Message::new(1, MessagePayload::DefaultLayer { layer_id: 0x105 }),
            Message::new(1, MessagePayload::Chat { text: "hi".into() }),
        ],
        &mut meta,
    );
    assert_eq!(pushed, 0, "meta messages never reach the queues");
    assert_eq!(meta.lasers, vec![(3, 9, 0x00ff_0000), (4, 2, 0x0000_ff00)]);
    assert_eq!(meta.cursors, vec![(3, 7, 8)]);
    assert_eq!(meta.default_layers, vec![0x105]);
}

#[test]
fn filtered_messages_report_acl_changes_only() {
    struct DenyAll;
    impl AclFilter for DenyAll {
        fn handle(&mut self, _msg: &Message) -> AclResult {
            AclResult {
                change_flags: AclChangeFlags::USERS,
                filtered: true,
            }
        }
    }

    let mut engine = PaintEngine::new(Box::new(DenyAll), Box::new(CountingSave::default()));
    let mut meta = CollectingMeta::default();
    let pushed = engine.handle(false, vec![resize_msg(), dab_msg(10)], &mut meta);
    assert_eq!(pushed, 0);
    assert_eq!(meta.acl_flags, vec![AclChangeFlags::USERS]);
    assert!(meta.lasers.is_empty());
}

#[test]
fn local_messages_bypass_the_acl_filter() {
    struct DenyAll;
    impl AclFilter for DenyAll {
        fn handle(&mut self, _msg: &Message) -> AclResult {
            AclResult {
                change_flags: AclChangeFlags::empty(),
                filtered: true,
            }
        }
    }

    let mut engine = PaintEngine::new(Box::new(DenyAll), Box::new(CountingSave::default()));
    let mut meta = CollectingMeta::default();
    let pushed = engine.handle(true, vec![resize_msg()], &mut meta);
    assert_eq!(pushed, 1);
}

#[test]
fn dab_burst_converges_to_sequential_result() {
    // 130 one-dab messages pushed at once; whatever batching the worker
    // manages, the final canvas must match one-by-one application.
    let (mut engine, saves) = new_engine();
    let mut meta = CollectingMeta::default();
    engine.handle(false, vec![resize_msg(), layer_create_msg(0x100)], &mut meta);

    let burst: Vec<Message> = (0..130).map(|i| dab_msg(5 + (i % 90))).collect();
    let expected_saves = 2 + burst.len();
    engine.handle(false, burst.clone(), &mut meta);

    let mut sink = CollectingTick::default();
    let deadline = Instant::now() + POLL_TIMEOUT;
    let mut history = history::CanvasHistory::new(Box::new(NullHistorySink));
    // Reference application, one message at a time.
    history.handle(false, resize_msg()).expect("resize");
    history.handle(false, layer_create_msg(0x100)).expect("layer");
    for msg in burst {
        history.handle(false, msg).expect("dab");
    }
    let reference = history.current_state();

    loop {
        engine.tick(&mut sink);
        let state = engine.canvas_state();
        let converged = state.width() == 100
            && (0..100u32).step_by(13).all(|x| {
                (0..100u32)
                    .step_by(13)
                    .all(|y| state.flatten_pixel_at(x, y) == reference.flatten_pixel_at(x, y))
            });
        if converged && saves.load(Ordering::Relaxed) > 0 {
            break;
        }
        assert!(Instant::now() < deadline, "burst never converged");
        std::thread::sleep(POLL_SLEEP);
    }
    assert!(
        saves.load(Ordering::Relaxed) <= expected_saves,
        "batching must not add save points"
    );
}

#[test]
fn preview_cut_shows_and_clears_with_original_pixels() {
    let (mut engine, _) = new_engine();
    let mut meta = CollectingMeta::default();
    engine.handle(
        false,
        vec![
            resize_msg(),
            layer_create_msg(0x100),
            Message::new(
                1,
                MessagePayload::FillRect {
                    layer_id: 0x100,
                    blend_mode: BlendMode::Replace as u8,
                    x: 0,
                    y: 0,
                    width: 64,
                    height: 64,
                    color: 0xffff_0000,
                },
            ),
        ],
        &mut meta,
    );
    let red = UPixel15::from_argb8(0xffff_0000).premultiply();
    tick_until_pixel(&mut engine, 5, 5, red);

    engine.preview_cut(0x100, 0, 0, 10, 10, None);
    tick_until_pixel(&mut engine, 5, 5, Pixel15::TRANSPARENT);

    engine.preview_clear();
    tick_until_pixel(&mut engine, 5, 5, red);
}

#[test]
fn hidden_layer_override_applies_without_touching_history() {
    let (mut engine, _) = new_engine();
    let mut meta = CollectingMeta::default();
    engine.handle(
        false,
        vec![
            resize_msg(),
            layer_create_msg(0x100),
            Message::new(
                1,
                MessagePayload::FillRect {
                    layer_id: 0x100,
                    blend_mode: BlendMode::Replace as u8,
                    x: 0,
                    y: 0,
                    width: 64,
                    height: 64,
                    color: 0xffff_0000,
                },
            ),
        ],
        &mut meta,
    );
    let mut sink = CollectingTick::default();
    tick_until(&mut engine, &mut sink, |sink| !sink.tiles.is_empty());

    let red = UPixel15::from_argb8(0xffff_0000).premultiply();
    tick_until_pixel(&mut engine, 5, 5, red);

    engine.set_local_layer_visibility(0x100, true);
    tick_until_pixel(&mut engine, 5, 5, Pixel15::TRANSPARENT);

    engine.set_local_layer_visibility(0x100, false);
    tick_until_pixel(&mut engine, 5, 5, red);
}

#[test]
fn render_composites_checker_behind_transparent_tiles() {
    let (mut engine, _) = new_engine();
    let mut meta = CollectingMeta::default();
    engine.handle(false, vec![resize_msg(), layer_create_msg(0x100)], &mut meta);
    let mut sink = CollectingTick::default();
    tick_until(&mut engine, &mut sink, |sink| sink.props_changes >= 1);

    let mut render = CollectingRender::default();
    engine.prepare_render(&mut render);
    engine.render(&mut render);
    assert_eq!(render.sizes, vec![(100, 100)]);
    assert!(!render.tiles.is_empty());
    let (_, _, pixels) = &render.tiles[0];
    assert!(
        pixels.iter().all(|pixel| pixel.a == 255),
        "checker fills transparency with opaque pixels"
    );

    let mut second = CollectingRender::default();
    engine.render(&mut second);
    assert!(second.tiles.is_empty(), "render consumes the diff mask");
}

#[test]
fn catchup_progress_surfaces_on_tick() {
    let (mut engine, _) = new_engine();
    let mut meta = CollectingMeta::default();
    engine.handle(
        false,
        vec![Message::internal(protocol::InternalMessage::Catchup {
            progress: 42,
        })],
        &mut meta,
    );
    let mut sink = CollectingTick::default();
    let deadline = Instant::now() + POLL_TIMEOUT;
    while sink.catchups.is_empty() {
        assert!(Instant::now() < deadline, "catchup never surfaced");
        engine.tick(&mut sink);
        std::thread::sleep(POLL_SLEEP);
    }
    assert_eq!(sink.catchups, vec![42]);
}

#[test]
fn free_join_with_queued_preview_does_not_hang() {
    let (mut engine, _) = new_engine();
    engine.preview_cut(0x100, 0, 0, 10, 10, None);
    engine.free_join();
}

struct NullHistorySink;

impl history::HistorySink for NullHistorySink {
    fn save_point(&mut self, _state: &Arc<CanvasState>, _snapshot_requested: bool) {}

    fn catchup(&mut self, _progress: u8) {}
}
