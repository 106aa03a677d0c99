//! End-to-end flows through the engine: producers, broadcast list, workers
//! and sinks.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tidal_core::*;
use tidal_proto::{Clear, Instrument, Message, MessageKind, PriceLevel, Trade};

struct Collect {
    name: String,
    seen: Arc<Mutex<Vec<Message>>>,
}

impl Sink for Collect {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, messages: &[Message]) -> std::result::Result<(), SinkError> {
        self.seen.lock().extend_from_slice(messages);
        Ok(())
    }
}

fn collector(name: &str) -> (Box<dyn Sink>, Arc<Mutex<Vec<Message>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Collect {
        name: name.into(),
        seen: seen.clone(),
    };
    (Box::new(sink), seen)
}

fn start(pool_nodes: usize, sinks: Vec<Box<dyn Sink>>) -> Engine {
    let options = WorkerOptions {
        workers: 2,
        ..WorkerOptions::default()
    };
    Engine::with_sinks(pool_nodes, sinks, options, Shutdown::new()).unwrap()
}

fn wait_for(seen: &Mutex<Vec<Message>>, count: usize) {
    let start = Instant::now();
    while seen.lock().len() < count {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "sink saw {} of {count} records",
            seen.lock().len()
        );
        thread::sleep(Duration::from_millis(1));
    }
}

fn instrument(symbol: &str, time: i64) -> (Message, u32) {
    let def = Instrument::new("TEST", "F1", symbol, time);
    let sid = def.security_id;
    (Message::from_record(&def), sid)
}

#[test]
fn test_definition_then_level_then_disconnect_clear() {
    let (sink, seen) = collector("collect");
    let engine = start(64, vec![sink]);
    let ctx = engine.context_create("producer-1");

    let (def, sid) = instrument("BTCUSD", 100);
    engine.publish(&ctx, &[def]).unwrap();
    engine
        .publish(&ctx, &[Message::from_record(&PriceLevel::new(sid, 7, 5_000_000, 100, 101))])
        .unwrap();
    wait_for(&seen, 2);

    drop(ctx);
    wait_for(&seen, 3);
    thread::sleep(Duration::from_millis(20));

    let seen = seen.lock();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].kind().unwrap(), MessageKind::Instrument);
    assert_eq!(seen[1].kind().unwrap(), MessageKind::PriceLevel);
    assert_eq!(seen[1].record::<PriceLevel>().map(|r| r.level_id), Some(7));

    let clear = seen[2].record::<Clear>().copied().unwrap();
    let (clear_sid, clear_time) = (clear.security_id, clear.time);
    assert_eq!(clear_sid, sid);
    assert!(clear.is_disconnect());
    assert!(clear_time >= 101);
    assert!(seen[2].is_flush());
    assert!(seen.iter().all(|m| m.engine_time != 0));
}

#[test]
fn test_context_with_producer_clear_reports_only_open_instruments() {
    let (sink, seen) = collector("collect");
    let engine = start(64, vec![sink]);
    let ctx = engine.context_create("producer-1");

    let (a, sid_a) = instrument("AAA", 1);
    let (b, sid_b) = instrument("BBB", 1);
    engine.publish(&ctx, &[a, b]).unwrap();
    engine
        .publish(&ctx, &[Message::from_record(&Clear::new(sid_a, tidal_proto::CLEAR_FROM_DISCONNECT, 2))])
        .unwrap();
    drop(ctx);

    wait_for(&seen, 4);
    thread::sleep(Duration::from_millis(20));
    let seen = seen.lock();
    assert_eq!(seen.len(), 4);
    let synthesized = seen[3].record::<Clear>().copied().unwrap();
    let synthesized_sid = synthesized.security_id;
    assert_eq!(synthesized_sid, sid_b);
}

#[test]
fn test_pool_exhaustion_is_immediate() {
    let engine = start(8, Vec::new());
    let buffers: Vec<_> = (0..8).map(|_| engine.alloc_buffer().unwrap()).collect();

    let started = Instant::now();
    assert!(matches!(
        engine.alloc_buffer(),
        Err(EngineError::PoolExhausted { capacity: 8 })
    ));
    assert!(started.elapsed() < Duration::from_secs(1));

    drop(buffers);
    assert!(engine.alloc_buffer().is_ok());
}

#[test]
fn test_out_of_order_record_never_reaches_sinks() {
    let (sink, seen) = collector("collect");
    let engine = start(32, vec![sink]);
    let ctx = engine.context_create("producer-1");

    let (def, sid) = instrument("ETHUSD", 10);
    engine.publish(&ctx, &[def]).unwrap();
    engine
        .publish(&ctx, &[Message::from_record(&Trade::new(sid, 1, 100, 1, 20))])
        .unwrap();

    let err = engine
        .publish(&ctx, &[Message::from_record(&Trade::new(sid, 2, 100, 1, 15))])
        .unwrap_err();
    assert!(matches!(err, EngineError::OutOfOrder { time: 15, last: 20, .. }));

    wait_for(&seen, 2);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(seen.lock().len(), 2);
}

#[test]
fn test_concurrent_producers_keep_per_instrument_order() {
    const PRODUCERS: usize = 4;
    const UPDATES: i64 = 500;

    let (first, seen_a) = collector("a");
    let (second, seen_b) = collector("b");
    let engine = start(1024, vec![first, second]);

    thread::scope(|s| {
        for p in 0..PRODUCERS {
            let engine = &engine;
            s.spawn(move || {
                let ctx = engine.context_create(&format!("producer-{p}"));
                let (def, sid) = instrument(&format!("SYM{p}"), 1);
                engine.publish(&ctx, &[def]).unwrap();
                let mut time = 2;
                for batch in 0..UPDATES / 5 {
                    let messages: Vec<Message> = (0..5)
                        .map(|i| {
                            time += 1;
                            Message::from_record(&PriceLevel::new(sid, batch * 5 + i, 1, 1, time))
                        })
                        .collect();
                    loop {
                        match engine.publish(&ctx, &messages) {
                            Ok(()) => break,
                            Err(EngineError::PoolExhausted { .. }) => thread::yield_now(),
                            Err(e) => panic!("publish failed: {e}"),
                        }
                    }
                }
                drop(ctx);
            });
        }
    });

    // Definition, updates and the disconnect clear of every producer.
    let total = PRODUCERS * (2 + UPDATES as usize);
    wait_for(&seen_a, total);
    wait_for(&seen_b, total);

    for seen in [&seen_a, &seen_b] {
        let seen = seen.lock();
        let mut last: std::collections::HashMap<u32, i64> = Default::default();
        for msg in seen.iter() {
            let sid = msg.security_id().unwrap();
            let time = msg.time();
            let prev = last.insert(sid, time).unwrap_or(i64::MIN);
            assert!(time >= prev, "instrument {sid} went back in time");
        }
        assert_eq!(last.len(), PRODUCERS);
    }
    assert_eq!(*seen_a.lock(), *seen_b.lock());
}

#[test]
fn test_partial_reads_reassembled() {
    let (sink, seen) = collector("collect");
    let engine = start(16, vec![sink]);
    let ctx = engine.context_create("stream");

    let (def, sid) = instrument("XRPUSD", 1);
    let mut wire = bytemuck::bytes_of(&def).to_vec();
    for t in 2..12 {
        wire.extend_from_slice(bytemuck::bytes_of(&Message::from_record(&PriceLevel::new(sid, t, 1, 1, t))));
    }

    // Feed the stream in odd-sized reads, as a socket would.
    let mut buffer = engine.alloc_buffer().unwrap();
    for chunk in wire.chunks(37) {
        buffer.spare()[..chunk.len()].copy_from_slice(chunk);
        buffer.commit(chunk.len());
        engine.proceed(&mut buffer, &ctx).unwrap();
    }
    engine.free_buffer(buffer);

    wait_for(&seen, 11);
    let seen = seen.lock();
    let times: Vec<i64> = seen.iter().map(|m| m.time()).collect();
    assert_eq!(times, (1..12).collect::<Vec<_>>());
    assert!(seen.last().unwrap().is_flush());
}

#[test]
fn test_start_from_config() {
    let config: Config = r#"
        [engine]
        pool_nodes = 64
        workers = 1
        sinks = ["log; latency 10"]
    "#
    .parse()
    .unwrap();

    let engine = Engine::start(&config, &SinkRegistry::new(), Shutdown::new()).unwrap();
    assert_eq!(engine.consumers(), 1);
    let ctx = engine.context_create("cfg");
    let (def, _) = instrument("LTCUSD", 1);
    engine.publish(&ctx, &[def]).unwrap();
    drop(ctx);
    engine.shutdown();
}

#[test]
fn test_unknown_sink_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.engine.sinks = vec!["missing-plugin".into()];
    config.engine.plugin_dir = dir.path().to_path_buf();

    let registry = SinkRegistry::new().with_plugin_dir(dir.path());
    let err = Engine::start(&config, &registry, Shutdown::new()).err().unwrap();
    assert!(matches!(err, EngineError::Sink { .. }));
}
