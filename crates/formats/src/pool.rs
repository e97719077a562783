//! Bounded worker pool for decoding layer PNGs during archive loads. Each
//! job decodes into its own layer content; the pool is joined before the
//! canvas state persists, so no decoded data escapes half-finished.

use std::thread;

use canvas::LayerContent;
use crossbeam_channel::{Receiver, Sender, unbounded};
use pixels::BlendMode;
use tracing::warn;

use crate::FormatError;

pub(crate) struct DecodeJob {
    pub index: usize,
    pub png_bytes: Vec<u8>,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub offset_x: i32,
    pub offset_y: i32,
}

pub(crate) struct DecodeResult {
    pub index: usize,
    pub content: Result<LayerContent, FormatError>,
}

fn decode_into_content(job: &DecodeJob) -> Result<LayerContent, FormatError> {
    let image = image::load_from_memory_with_format(&job.png_bytes, image::ImageFormat::Png)
        .map_err(|error| FormatError::Read(format!("layer png: {error}")))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    let premultiplied = crate::rgba8_to_premultiplied(image.as_raw());

    let mut content = LayerContent::new(job.canvas_width, job.canvas_height);
    content.put_image(
        BlendMode::Replace,
        job.offset_x,
        job.offset_y,
        width,
        height,
        &premultiplied,
    );
    Ok(content)
}

fn worker(jobs: Receiver<DecodeJob>, results: Sender<DecodeResult>) {
    for job in jobs {
        let index = job.index;
        let content = decode_into_content(&job);
        if results.send(DecodeResult { index, content }).is_err() {
            return;
        }
    }
}

/// Decode every job on a pool sized to the CPU count and return the layer
/// contents in job order. Individual decode failures are reported in place
/// so the caller can degrade to an empty layer.
pub(crate) fn decode_all(jobs: Vec<DecodeJob>) -> Vec<Result<LayerContent, FormatError>> {
    let job_count = jobs.len();
    if job_count == 0 {
        return Vec::new();
    }
    let thread_count = thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
        .min(job_count);

    let (job_sender, job_receiver) = unbounded::<DecodeJob>();
    let (result_sender, result_receiver) = unbounded::<DecodeResult>();
    for job in jobs {
        job_sender.send(job).expect("job channel open");
    }
    drop(job_sender);

    let mut results: Vec<Option<Result<LayerContent, FormatError>>> = Vec::new();
    results.resize_with(job_count, || None);

    thread::scope(|scope| {
        for _ in 0..thread_count {
            let jobs = job_receiver.clone();
            let sender = result_sender.clone();
            scope.spawn(move || worker(jobs, sender));
        }
        drop(result_sender);
        for result in result_receiver.iter() {
            if result.content.is_err() {
                warn!(index = result.index, "layer png decode failed");
            }
            results[result.index] = Some(result.content);
        }
    });

    results
        .into_iter()
        .map(|slot| slot.expect("every decode job reports a result"))
        .collect()
}
