//! End-to-end tests through the public driver API, with a stub transport
//! backend and a stub device worker standing in for the USB plumbing.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use jsdrv::{
    AppClass, Backend, BufferRequest, BufferResponse, DeviceFactory, DeviceHandle,
    DeviceSpawnCtx, DeviceWorker, Driver, ErrorCode, Msg, MsgExtra, ResponseData, StreamHeader,
    SubFlags, TimeMap, TimeRange, UtcTime, Value,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Collects callback deliveries into a channel the test thread can drain.
fn collector() -> (
    impl Fn(&str, &Value) + Send + Sync + 'static,
    Receiver<(String, Value)>,
) {
    let (tx, rx) = unbounded();
    let callback = move |topic: &str, value: &Value| {
        let _ = tx.send((topic.to_string(), value.clone()));
    };
    (callback, rx)
}

/// A backend that reports one device immediately and then goes quiet.
struct StubBackend {
    prefixes: Vec<String>,
}

impl Backend for StubBackend {
    fn prefix(&self) -> char {
        'u'
    }

    fn initialize(&mut self, events: Sender<Msg>) -> jsdrv::Result<()> {
        for prefix in &self.prefixes {
            let (cmd_tx, _cmd_rx) = unbounded();
            let (_rsp_tx, rsp_rx) = unbounded();
            let handle = DeviceHandle {
                prefix: prefix.clone(),
                cmd_tx,
                rsp_rx,
            };
            let _ = events.send(
                Msg::new("@/!add", Value::null()).with_extra(MsgExtra::DeviceAdd { handle }),
            );
        }
        let _ = events.send(Msg::new("@/!init", Value::from(0i32)));
        Ok(())
    }

    fn finalize(&mut self) {}
}

/// A device worker that acknowledges every command with return code 0,
/// except topics containing "noreply".
struct EchoWorker {
    tx: Sender<Msg>,
    join: Option<JoinHandle<()>>,
}

impl DeviceWorker for EchoWorker {
    fn cmd_sender(&self) -> Sender<Msg> {
        self.tx.clone()
    }

    fn join(mut self: Box<Self>) {
        let _ = self.tx.send(Msg::new("_quit", Value::null()));
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn echo_factory() -> DeviceFactory {
    Box::new(|ctx: DeviceSpawnCtx| {
        let (tx, rx) = unbounded::<Msg>();
        let prefix = ctx.handle.prefix.clone();
        let loopback = ctx.loopback.clone();
        let _ = loopback.send(Msg::new(
            format!("{prefix}/h/state"),
            Value::from(1u32).with_retain(),
        ));
        let join = thread::spawn(move || {
            for msg in rx.iter() {
                if msg.topic == "_quit" {
                    break;
                }
                if msg.topic.ends_with('#') || msg.topic.contains("noreply") {
                    continue;
                }
                let _ = loopback.send(Msg::return_code(&msg.topic, 0));
            }
        });
        Ok(Box::new(EchoWorker {
            tx,
            join: Some(join),
        }) as Box<dyn DeviceWorker>)
    })
}

fn driver_with_device() -> Driver {
    Driver::builder()
        .backend(Box::new(StubBackend {
            prefixes: vec!["u/js110/123456".to_string()],
        }))
        .model("js110", echo_factory())
        .initialize()
        .unwrap()
}

#[test]
fn pubsub_round_trip() {
    init_logging();
    let driver = Driver::initialize().unwrap();
    driver
        .publish(
            "u/js110/123456/hello",
            Value::str("world").with_retain(),
            1000,
        )
        .unwrap();

    let (callback, rx) = collector();
    let sub_id = driver
        .subscribe("", SubFlags::RETAIN | SubFlags::PUB, callback, 1000)
        .unwrap();
    let (topic, value) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(topic, "u/js110/123456/hello");
    assert_eq!(value, Value::str("world"));
    assert!(rx.try_recv().is_err());

    driver.unsubscribe("", sub_id, 1000).unwrap();
    driver
        .publish(
            "u/js110/123456/hello",
            Value::str("world").with_retain(),
            1000,
        )
        .unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    driver.finalize().unwrap();
}

#[test]
fn query_sizing() {
    init_logging();
    let driver = Driver::initialize().unwrap();
    driver
        .publish("u/x", Value::str("hello world").with_retain(), 1000)
        .unwrap();

    let mut small = [0u8; 5];
    assert_eq!(
        driver.query_into("u/x", &mut small, 1000),
        Err(ErrorCode::TooSmall)
    );
    let mut buf = [0u8; 12];
    assert_eq!(driver.query_into("u/x", &mut buf, 1000), Ok(12));
    assert_eq!(&buf, b"hello world\0");
    assert_eq!(
        driver.query("u/missing", 1000),
        Err(ErrorCode::NotFound)
    );
    driver.finalize().unwrap();
}

#[test]
fn retained_replay_in_creation_order() {
    init_logging();
    let driver = Driver::initialize().unwrap();
    driver
        .publish("d/b", Value::from(1u8).with_retain(), 1000)
        .unwrap();
    driver
        .publish("d/a", Value::from(2u8).with_retain(), 1000)
        .unwrap();

    let (callback, rx) = collector();
    driver
        .subscribe("d", SubFlags::RETAIN | SubFlags::PUB, callback, 1000)
        .unwrap();
    let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(first.0, "d/b");
    assert_eq!(second.0, "d/a");
    driver.finalize().unwrap();
}

#[test]
fn version_and_timeout_are_retained() {
    init_logging();
    let driver = Driver::initialize().unwrap();
    assert_eq!(
        driver.query("@/version", 1000).unwrap(),
        Value::from(jsdrv::version_u32())
    );
    assert_eq!(driver.query("@/timeout", 1000).unwrap(), Value::from(1000u32));
    driver.finalize().unwrap();
}

#[test]
fn device_add_remove_and_return_codes() {
    init_logging();
    let driver = driver_with_device();

    // The backend's device landed before init completed.
    assert_eq!(
        driver.query("@/list", 1000).unwrap(),
        Value::str("u/js110/123456")
    );
    // The worker published its retained state on spawn.
    assert_eq!(
        driver.query("u/js110/123456/h/state", 1000).unwrap(),
        Value::from(1u32)
    );

    // Synchronous publish completes through the worker's return code.
    driver
        .publish("u/js110/123456/s/i/ctrl", Value::from(1u8), 1000)
        .unwrap();
    // A worker that never answers turns into a deadline expiry.
    assert_eq!(
        driver.publish("u/js110/123456/noreply", Value::from(1u8), 150),
        Err(ErrorCode::Timeout)
    );

    driver
        .publish("@/!remove", Value::str("u/js110/123456"), 1000)
        .unwrap();
    assert_eq!(driver.query("@/list", 1000).unwrap(), Value::str(""));
    assert_eq!(
        driver.publish("@/!remove", Value::str("u/js110/123456"), 1000),
        Err(ErrorCode::NotFound)
    );
    driver.finalize().unwrap();
}

fn f32_block(sample_id: u64, values: &[f32], rate: u32) -> Value {
    let header = StreamHeader {
        sample_id,
        field_id: 1,
        index: 0,
        element_type: jsdrv::ElementType::Float,
        element_size_bits: 32,
        element_count: values.len() as u32,
        sample_rate: rate,
        decimate_factor: 1,
        time_map: TimeMap::new(UtcTime::EPOCH, 0, rate as f64),
    };
    let mut data = Vec::with_capacity(values.len() * 4);
    for v in values {
        data.extend_from_slice(&v.to_le_bytes());
    }
    Value::bin(header.encode(&data)).with_app(AppClass::Stream)
}

#[test]
fn buffer_samples_and_summary() {
    init_logging();
    let driver = Driver::initialize().unwrap();
    let src = "u/js110/123456/s/i/!data";

    driver.publish("m/@/!add", Value::from(3u32), 1000).unwrap();
    driver.publish("m/3/a/!add", Value::from(1u8), 1000).unwrap();
    driver
        .publish("m/3/s/1/topic", Value::str(src), 1000)
        .unwrap();
    driver
        .publish("m/3/g/size", Value::from(8u64 * 1024 * 1024), 1000)
        .unwrap();

    assert_eq!(
        driver.query("m/3/g/list", 1000).unwrap(),
        Value::bin(vec![1u8, 0])
    );
    assert_eq!(
        driver.query("m/@/list", 1000).unwrap(),
        Value::bin(vec![3u8, 0])
    );

    // Ingest sample ids [1000, 2000) with value sid / 1e6.
    let rate = 1_000_000;
    let values: Vec<f32> = (1000..2000).map(|sid| sid as f32 / 1e6).collect();
    driver.publish(src, f32_block(1000, &values, rate), 0).unwrap();

    let (callback, rx) = collector();
    driver.subscribe("a/rsp", SubFlags::PUB, callback, 1000).unwrap();

    // Raw samples.
    let req = BufferRequest::new(
        TimeRange::Samples {
            start: 1000,
            end: 1999,
            length: 1000,
        },
        "a/rsp",
        42,
    );
    driver
        .publish(
            "m/3/s/1/!req",
            Value::bin(req.encode().unwrap()).with_app(AppClass::BufferRequest),
            1000,
        )
        .unwrap();
    let (topic, value) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(topic, "a/rsp");
    let rsp = BufferResponse::parse(value.bytes().unwrap()).unwrap();
    assert_eq!(rsp.rsp_id, 42);
    assert_eq!(rsp.info.sample_id_start, 1000);
    assert_eq!(rsp.info.sample_id_end, 2000);
    match &rsp.data {
        ResponseData::Samples(data) => {
            assert_eq!(data.len(), 1000 * 4);
            for i in 0..1000usize {
                let off = i * 4;
                let v = f32::from_le_bytes([
                    data[off],
                    data[off + 1],
                    data[off + 2],
                    data[off + 3],
                ]);
                assert_eq!(v, (1000 + i) as f32 / 1e6);
            }
        }
        _ => panic!("expected samples"),
    }

    // Multi-resolution summary with entries outside the retained window.
    let req = BufferRequest::new(
        TimeRange::Samples {
            start: 997,
            end: 1005,
            length: 3,
        },
        "a/rsp",
        43,
    );
    driver
        .publish(
            "m/3/s/1/!req",
            Value::bin(req.encode().unwrap()).with_app(AppClass::BufferRequest),
            1000,
        )
        .unwrap();
    let (_, value) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let rsp = BufferResponse::parse(value.bytes().unwrap()).unwrap();
    assert_eq!(rsp.rsp_id, 43);
    match &rsp.data {
        ResponseData::Summary(entries) => {
            assert_eq!(entries.len(), 3);
            assert!(entries[0].is_nan());
            assert!((entries[1].avg as f64 - 0.001001).abs() < 1e-7);
            assert!((entries[2].avg as f64 - 0.001004).abs() < 1e-7);
        }
        _ => panic!("expected summary"),
    }

    // The retained info structure tracks the holdings.
    let info = driver.query("m/3/s/1/info", 1000).unwrap();
    let info = jsdrv::BufferInfo::parse(info.bytes().unwrap()).unwrap();
    assert_eq!(info.topic, src);
    assert_eq!(info.sample_id_start, 1000);
    assert_eq!(info.sample_id_end, 2000);

    driver
        .publish("m/@/!remove", Value::from(3u32), 1000)
        .unwrap();
    assert_eq!(driver.query("m/@/list", 1000).unwrap(), Value::bin(vec![0u8]));
    driver.finalize().unwrap();
}

#[test]
fn buffer_hold_and_clear() {
    init_logging();
    let driver = Driver::initialize().unwrap();
    let src = "u/js220/000001/s/v/!data";

    driver.publish("m/@/!add", Value::from(1u32), 1000).unwrap();
    driver.publish("m/1/a/!add", Value::from(2u8), 1000).unwrap();
    driver
        .publish("m/1/s/2/topic", Value::str(src), 1000)
        .unwrap();
    driver
        .publish("m/1/g/size", Value::from(4u64 * 1024 * 1024), 1000)
        .unwrap();

    let rate = 1_000_000;
    let values: Vec<f32> = (0..1000).map(|i| i as f32).collect();
    driver.publish(src, f32_block(0, &values, rate), 0).unwrap();

    // Hold drops subsequent blocks.
    driver.publish("m/1/g/hold", Value::from(1u8), 1000).unwrap();
    driver
        .publish(src, f32_block(1000, &values, rate), 0)
        .unwrap();
    driver.publish("m/1/g/hold", Value::from(0u8), 1000).unwrap();

    let (callback, rx) = collector();
    driver.subscribe("b/rsp", SubFlags::PUB, callback, 1000).unwrap();
    let req = BufferRequest::new(
        TimeRange::Samples {
            start: 0,
            end: 4999,
            length: 5000,
        },
        "b/rsp",
        1,
    );
    driver
        .publish(
            "m/1/s/2/!req",
            Value::bin(req.encode().unwrap()).with_app(AppClass::BufferRequest),
            1000,
        )
        .unwrap();
    let (_, value) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let rsp = BufferResponse::parse(value.bytes().unwrap()).unwrap();
    // Only the first block landed.
    assert_eq!(rsp.info.sample_id_start, 0);
    assert_eq!(rsp.info.sample_id_end, 1000);

    // Clear drops the stored samples but keeps the configuration.
    driver.publish("m/1/g/!clear", Value::null(), 1000).unwrap();
    driver
        .publish(src, f32_block(5000, &values, rate), 0)
        .unwrap();
    driver
        .publish(
            "m/1/s/2/!req",
            Value::bin(req.encode().unwrap()).with_app(AppClass::BufferRequest),
            1000,
        )
        .unwrap();
    let (_, value) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let rsp = BufferResponse::parse(value.bytes().unwrap()).unwrap();
    assert_eq!(rsp.info.sample_id_start, 5000);
    assert_eq!(rsp.info.sample_id_end, 6000);
    driver.finalize().unwrap();
}

#[test]
fn buffer_add_errors() {
    init_logging();
    let driver = Driver::initialize().unwrap();
    driver.publish("m/@/!add", Value::from(2u32), 1000).unwrap();
    assert_eq!(
        driver.publish("m/@/!add", Value::from(2u32), 1000),
        Err(ErrorCode::AlreadyExists)
    );
    assert_eq!(
        driver.publish("m/@/!add", Value::from(99u32), 1000),
        Err(ErrorCode::ParameterInvalid)
    );
    assert_eq!(
        driver.publish("m/@/!remove", Value::from(7u32), 1000),
        Err(ErrorCode::NotFound)
    );
    driver.finalize().unwrap();
}

#[test]
fn finalize_aborts_nothing_outstanding() {
    init_logging();
    let driver = driver_with_device();
    driver.finalize().unwrap();
}
