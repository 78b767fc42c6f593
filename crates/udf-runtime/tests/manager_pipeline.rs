//! End-to-end pipeline tests driving the manager with in-process handles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use frame_core::{EncodeType, Frame, FrameQueue, PixelBacking};
use msg_envelope::Value;
use udf_runtime::{RuntimeError, UdfHandle, UdfManager, UdfOutcome};

const POP_TIMEOUT: Duration = Duration::from_secs(2);

/// Pixel storage that counts its releases.
struct TestPixels {
    bytes: Vec<u8>,
    drops: Arc<AtomicUsize>,
}

impl TestPixels {
    fn new(bytes: Vec<u8>, drops: Arc<AtomicUsize>) -> Self {
        Self { bytes, drops }
    }
}

impl PixelBacking for TestPixels {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for TestPixels {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Stage built from a closure, standing in for a loaded UDF.
struct StageFn<F> {
    name: &'static str,
    body: F,
}

impl<F> StageFn<F>
where
    F: FnMut(&mut Frame) -> Result<UdfOutcome, RuntimeError> + Send,
{
    fn boxed(name: &'static str, body: F) -> Box<dyn UdfHandle>
    where
        F: 'static,
    {
        Box::new(Self { name, body })
    }
}

impl<F> UdfHandle for StageFn<F>
where
    F: FnMut(&mut Frame) -> Result<UdfOutcome, RuntimeError> + Send,
{
    fn name(&self) -> &str {
        self.name
    }

    fn process(&mut self, frame: &mut Frame) -> Result<UdfOutcome, RuntimeError> {
        (self.body)(frame)
    }
}

fn hello_frame() -> Frame {
    Frame::new(b"Hello, World!\0".to_vec(), 14, 1, 1, EncodeType::None, 0).unwrap()
}

fn synthetic_bgr(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            bytes.push((x % 256) as u8);
            bytes.push((y % 256) as u8);
            bytes.push(((x ^ y) % 256) as u8);
        }
    }
    bytes
}

#[test]
fn empty_chain_forwards_frames_untouched() {
    let input = FrameQueue::bounded(4);
    let output = FrameQueue::bounded(4);
    let mut manager = UdfManager::with_chain(
        Vec::new(),
        2,
        4,
        input.clone(),
        output.clone(),
        (EncodeType::None, 0),
    )
    .unwrap();
    manager.start();

    input.push(hello_frame()).unwrap();
    let frame = output.pop_timeout(POP_TIMEOUT).expect("frame forwarded");
    assert_eq!(frame.data(0).unwrap(), b"Hello, World!\0");

    let envelope = frame.serialize().unwrap();
    assert_eq!(envelope.root().get_int("width").unwrap(), 14);
    assert_eq!(envelope.root().get_int("height").unwrap(), 1);
    assert_eq!(envelope.root().get_int("channels").unwrap(), 1);

    manager.stop();
}

#[test]
fn resize_stage_updates_dimensions_and_meta() {
    let input = FrameQueue::bounded(4);
    let output = FrameQueue::bounded(4);

    let resize = StageFn::boxed("resize", |frame: &mut Frame| {
        let (width, height) = (100u32, 100u32);
        frame.set_data(0, vec![0u8; (width * height) as usize], width, height, 1)?;
        let meta = frame.meta_data_mut();
        meta.put("resize_width", width as i64).map_err(|err| {
            RuntimeError::Process {
                name: "resize".to_string(),
                reason: err.to_string(),
            }
        })?;
        meta.put("resize_height", height as i64).map_err(|err| {
            RuntimeError::Process {
                name: "resize".to_string(),
                reason: err.to_string(),
            }
        })?;
        Ok(UdfOutcome::Modified)
    });

    let mut manager = UdfManager::with_chain(
        vec![resize],
        1,
        4,
        input.clone(),
        output.clone(),
        (EncodeType::None, 0),
    )
    .unwrap();
    manager.start();

    input.push(hello_frame()).unwrap();
    let frame = output.pop_timeout(POP_TIMEOUT).expect("frame forwarded");
    assert_eq!(frame.width(0).unwrap(), 100);
    assert_eq!(frame.height(0).unwrap(), 100);
    assert_eq!(frame.channels(0).unwrap(), 1);

    let envelope = frame.serialize().unwrap();
    assert_eq!(envelope.root().get_int("resize_width").unwrap(), 100);
    assert_eq!(envelope.root().get_int("resize_height").unwrap(), 100);
    assert_eq!(envelope.root().get_int("width").unwrap(), 100);

    manager.stop();
}

#[test]
fn stages_run_in_order_per_frame() {
    let input = FrameQueue::bounded(8);
    let output = FrameQueue::bounded(8);
    let trace: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let trace = trace.clone();
        StageFn::boxed("first", move |_frame: &mut Frame| {
            trace.lock().unwrap().push("first");
            Ok(UdfOutcome::Pass)
        })
    };
    let second = {
        let trace = trace.clone();
        StageFn::boxed("second", move |_frame: &mut Frame| {
            trace.lock().unwrap().push("second");
            Ok(UdfOutcome::Pass)
        })
    };

    // One worker keeps the interleaving deterministic.
    let mut manager = UdfManager::with_chain(
        vec![first, second],
        1,
        8,
        input.clone(),
        output.clone(),
        (EncodeType::None, 0),
    )
    .unwrap();
    manager.start();

    for _ in 0..3 {
        input.push(hello_frame()).unwrap();
    }
    for _ in 0..3 {
        assert!(output.pop_timeout(POP_TIMEOUT).is_some());
    }
    manager.stop();

    let trace = trace.lock().unwrap();
    assert_eq!(
        trace.as_slice(),
        ["first", "second", "first", "second", "first", "second"]
    );
}

#[test]
fn drop_stage_discards_frame_and_releases_buffers() {
    let input = FrameQueue::bounded(4);
    let output = FrameQueue::bounded(4);
    let dropper = StageFn::boxed("dropper", |_frame: &mut Frame| Ok(UdfOutcome::Drop));

    let mut manager = UdfManager::with_chain(
        vec![dropper],
        1,
        4,
        input.clone(),
        output.clone(),
        (EncodeType::None, 0),
    )
    .unwrap();
    manager.start();

    let drops = Arc::new(AtomicUsize::new(0));
    let frame = Frame::new(
        TestPixels::new(vec![1u8; 6], drops.clone()),
        6,
        1,
        1,
        EncodeType::None,
        0,
    )
    .unwrap();
    input.push(frame).unwrap();

    // Give the pipeline time to process, then confirm nothing came out and
    // the pixel buffer was released exactly once.
    thread::sleep(Duration::from_millis(500));
    assert!(output.try_pop().is_none());
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    manager.stop();
}

#[test]
fn failing_stage_destroys_frame_but_pipeline_continues() {
    let input = FrameQueue::bounded(4);
    let output = FrameQueue::bounded(4);

    let failures = Arc::new(AtomicUsize::new(0));
    let stage = {
        let failures = failures.clone();
        StageFn::boxed("flaky", move |_frame: &mut Frame| {
            if failures.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RuntimeError::Process {
                    name: "flaky".to_string(),
                    reason: "synthetic failure".to_string(),
                })
            } else {
                Ok(UdfOutcome::Pass)
            }
        })
    };

    let mut manager = UdfManager::with_chain(
        vec![stage],
        1,
        4,
        input.clone(),
        output.clone(),
        (EncodeType::None, 0),
    )
    .unwrap();
    manager.start();

    input.push(hello_frame()).unwrap();
    input.push(hello_frame()).unwrap();

    // Only the second frame survives.
    let frame = output.pop_timeout(POP_TIMEOUT).expect("second frame forwarded");
    assert_eq!(frame.data(0).unwrap(), b"Hello, World!\0");
    assert!(output.try_pop().is_none());
    assert_eq!(failures.load(Ordering::SeqCst), 2);

    manager.stop();
}

#[test]
fn modifier_stage_touches_only_its_plane() {
    let input = FrameQueue::bounded(4);
    let output = FrameQueue::bounded(4);

    let modifier = StageFn::boxed("modifier", |frame: &mut Frame| {
        frame.data_mut(0)?[..8].copy_from_slice(b"Goodbye\0");
        let meta = frame.meta_data_mut();
        let _ = meta.remove("ADDED");
        meta.put("ADDED", "test").map_err(|err| RuntimeError::Process {
            name: "modifier".to_string(),
            reason: err.to_string(),
        })?;
        Ok(UdfOutcome::Modified)
    });

    let mut manager = UdfManager::with_chain(
        vec![modifier],
        1,
        4,
        input.clone(),
        output.clone(),
        (EncodeType::None, 0),
    )
    .unwrap();
    manager.start();

    let mut frame = Frame::empty();
    frame
        .add_frame(b"Hello, World1\0".to_vec(), 14, 1, 1, EncodeType::None, 0)
        .unwrap();
    frame
        .add_frame(b"Hello, World2\0".to_vec(), 14, 1, 1, EncodeType::None, 0)
        .unwrap();
    input.push(frame).unwrap();

    let frame = output.pop_timeout(POP_TIMEOUT).expect("frame forwarded");
    assert!(frame.data(0).unwrap().starts_with(b"Goodbye\0"));
    assert_eq!(frame.data(1).unwrap(), b"Hello, World2\0");
    assert_eq!(
        frame.meta_data().get("ADDED").and_then(Value::as_str),
        Some("test")
    );

    manager.stop();
}

#[test]
fn manager_applies_target_encoding_before_the_chain() {
    let input = FrameQueue::bounded(4);
    let output = FrameQueue::bounded(4);
    let same_frame = StageFn::boxed("same-frame", |_frame: &mut Frame| Ok(UdfOutcome::Pass));

    let mut manager = UdfManager::with_chain(
        vec![same_frame],
        1,
        4,
        input.clone(),
        output.clone(),
        (EncodeType::Jpeg, 50),
    )
    .unwrap();
    manager.start();

    let raw = synthetic_bgr(48, 32);
    input
        .push(Frame::new(raw, 48, 32, 3, EncodeType::None, 0).unwrap())
        .unwrap();

    let frame = output.pop_timeout(POP_TIMEOUT).expect("frame forwarded");
    assert_eq!(frame.encode_type(0).unwrap(), EncodeType::Jpeg);
    assert_eq!(frame.encode_level(0).unwrap(), 50);

    let envelope = frame.serialize().unwrap();
    assert_eq!(
        envelope.get("encoding_type").and_then(Value::as_str),
        Some("jpeg")
    );
    assert_eq!(
        envelope.get("encoding_level").and_then(Value::as_int),
        Some(50)
    );

    // The payload decodes back to the full image shape.
    let decoded = Frame::from_envelope(envelope).unwrap();
    assert_eq!(decoded.width(0).unwrap(), 48);
    assert_eq!(decoded.height(0).unwrap(), 32);
    assert_eq!(decoded.channels(0).unwrap(), 3);

    manager.stop();
}

#[test]
fn saturated_output_applies_backpressure_without_losing_frames() {
    const FRAMES: usize = 6;
    let input = FrameQueue::bounded(FRAMES);
    let output = FrameQueue::bounded(1);
    let passthrough = StageFn::boxed("pass", |_frame: &mut Frame| Ok(UdfOutcome::Pass));

    let mut manager = UdfManager::with_chain(
        vec![passthrough],
        2,
        2,
        input.clone(),
        output.clone(),
        (EncodeType::None, 0),
    )
    .unwrap();
    manager.start();

    for index in 0..FRAMES {
        let mut frame = hello_frame();
        frame
            .meta_data_mut()
            .put("seq", index as i64)
            .unwrap();
        input.push(frame).unwrap();
    }

    // Workers are now blocked pushing into the single-slot output queue.
    // Drain slowly and verify every frame arrives.
    thread::sleep(Duration::from_millis(300));
    let mut seen = Vec::new();
    for _ in 0..FRAMES {
        let frame = output.pop_timeout(POP_TIMEOUT).expect("no frame lost");
        seen.push(frame.meta_data().root().get_int("seq").unwrap());
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(seen.len(), FRAMES);
    seen.sort_unstable();
    assert_eq!(seen, (0..FRAMES as i64).collect::<Vec<_>>());

    manager.stop();
}

#[test]
fn restart_after_stop_is_rejected() {
    let input = FrameQueue::bounded(2);
    let output = FrameQueue::bounded(2);
    let mut manager = UdfManager::with_chain(
        Vec::new(),
        1,
        2,
        input.clone(),
        output.clone(),
        (EncodeType::None, 0),
    )
    .unwrap();

    manager.start();
    manager.stop();
    manager.start();

    input.push(hello_frame()).unwrap();
    assert!(output.pop_timeout(Duration::from_millis(600)).is_none());
}

#[test]
fn invalid_target_encoding_is_rejected_at_construction() {
    let input = FrameQueue::bounded(1);
    let output = FrameQueue::bounded(1);
    let result = UdfManager::with_chain(
        Vec::new(),
        1,
        1,
        input,
        output,
        (EncodeType::Png, 42),
    );
    assert!(matches!(result, Err(RuntimeError::ConfigInvalid(_))));
}
