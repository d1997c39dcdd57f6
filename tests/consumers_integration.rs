//! Integration tests for managed consumers on a simulated pipeline
//!
//! These tests validate that consumers:
//! - Attach and detach with the pipeline's capture state
//! - Tear down exactly once when stopped from several threads
//! - Produce results from simulated photon statistics

mod common;

use common::wait_until;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use timetag_capture::config::{
    CaptureConfig, ControlBackend, CorrelatorSettings, HistogramSettings, SimulatorConfig,
};
use timetag_capture::consumers::{
    BinnerConsumer, ConsumerConfig, ManagedBinner, ManagedConsumer,
};
use timetag_capture::pipeline::{CapturePipeline, ChannelStore, OutputRegistry, CAPTURE_OUTPUT};
use timetag_capture::Result;

fn simulated_pipeline() -> Arc<CapturePipeline> {
    let mut config = CaptureConfig::default();
    config.control.backend = ControlBackend::Simulated;
    config.simulator = SimulatorConfig {
        clockrate: 1_000_000,
        hw_version: "sim".into(),
        count_rates: vec![5_000.0, 2_000.0],
    };
    config.binner.bin_time = 1e-3;
    Arc::new(CapturePipeline::new(config).unwrap())
}

fn registry(pipeline: &Arc<CapturePipeline>) -> Arc<dyn OutputRegistry> {
    pipeline.clone()
}

/// Counts its lifecycle callbacks
#[derive(Default)]
struct CountingConsumer {
    started: AtomicUsize,
    stopped: AtomicUsize,
}

impl BinnerConsumer for CountingConsumer {
    type Handler = ChannelStore;

    fn name(&self) -> &str {
        "counting"
    }

    fn bin_time(&self) -> f64 {
        1e-3
    }

    fn create_handler(&self) -> Result<Arc<ChannelStore>> {
        Ok(Arc::new(ChannelStore::new(16)?))
    }

    fn on_started(&self, _handler: &Arc<ChannelStore>) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stopped(&self, _handler: &Arc<ChannelStore>) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
#[serial]
fn test_consumer_follows_capture_state() {
    let pipeline = simulated_pipeline();
    let consumer = ManagedConsumer::build(
        registry(&pipeline),
        ConsumerConfig::Histogram(HistogramSettings {
            bin_time: 1e-3,
            width: 2,
        }),
        Duration::from_millis(50),
    )
    .unwrap();
    consumer.watch().unwrap();
    assert!(!consumer.managed().is_running());

    pipeline.start().unwrap();
    pipeline.start_capture().unwrap();
    assert!(wait_until(|| consumer.managed().is_running()));
    assert_eq!(pipeline.output_ids().len(), 2);

    let ManagedConsumer::Histogram(hist) = &consumer else {
        panic!("expected a histogram consumer");
    };
    assert!(wait_until(|| hist.consumer().histograms().len() == 2));

    pipeline.stop_capture().unwrap();
    assert!(wait_until(|| !consumer.managed().is_running()));
    assert_eq!(pipeline.output_ids(), vec![CAPTURE_OUTPUT.to_string()]);

    // Histograms survive detaching
    assert_eq!(hist.consumer().histograms().len(), 2);

    consumer.unwatch();
    pipeline.stop().unwrap();
}

#[test]
#[serial]
fn test_pipeline_stop_detaches_consumer() {
    let pipeline = simulated_pipeline();
    let consumer = ManagedConsumer::build(
        registry(&pipeline),
        ConsumerConfig::Buffer {
            bin_time: 1e-3,
            points: 100,
        },
        Duration::from_millis(50),
    )
    .unwrap();
    consumer.watch().unwrap();

    pipeline.start().unwrap();
    pipeline.start_capture().unwrap();
    assert!(wait_until(|| consumer.managed().is_running()));

    pipeline.stop().unwrap();
    assert!(wait_until(|| !consumer.managed().is_running()));
    consumer.unwatch();
}

#[test]
#[serial]
fn test_concurrent_stop_tears_down_once() {
    let pipeline = simulated_pipeline();
    pipeline.start().unwrap();
    pipeline.start_capture().unwrap();

    let managed = Arc::new(ManagedBinner::new(
        registry(&pipeline),
        CountingConsumer::default(),
        Duration::from_secs(60),
    ));
    managed.start_binner().unwrap();
    assert!(pipeline.output_ids().contains(&managed.id().to_string()));

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let managed = Arc::clone(&managed);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                managed.stop_binner()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(managed.consumer().started.load(Ordering::SeqCst), 1);
    assert_eq!(managed.consumer().stopped.load(Ordering::SeqCst), 1);
    assert!(!managed.is_running());
    assert_eq!(pipeline.output_ids(), vec![CAPTURE_OUTPUT.to_string()]);
    pipeline.stop().unwrap();
}

#[test]
#[serial]
fn test_concurrent_start_attaches_once() {
    let pipeline = simulated_pipeline();
    pipeline.start().unwrap();

    let managed = Arc::new(ManagedBinner::new(
        registry(&pipeline),
        CountingConsumer::default(),
        Duration::from_secs(60),
    ));
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let managed = Arc::clone(&managed);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                managed.start_binner()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(managed.consumer().started.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.output_ids().len(), 2);
    managed.stop_binner().unwrap();
    pipeline.stop().unwrap();
}

#[test]
#[serial]
fn test_correlator_on_simulated_counts() {
    let pipeline = simulated_pipeline();
    let consumer = ManagedConsumer::build(
        registry(&pipeline),
        ConsumerConfig::Correlator(CorrelatorSettings {
            bin_time: 1e-3,
            plot_width: 1.0,
            channel_a: 0,
            channel_b: 1,
            window: 1000,
        }),
        Duration::from_millis(50),
    )
    .unwrap();
    let ManagedConsumer::Correlator(correlator) = &consumer else {
        panic!("expected a correlator consumer");
    };

    pipeline.start().unwrap();
    pipeline.start_capture().unwrap();
    correlator.start_binner().unwrap();
    assert!(wait_until(|| correlator
        .consumer()
        .correlate(5)
        .is_some_and(|c| c.sample_count == 1000)));

    let corr = correlator.consumer().correlate(5).unwrap();
    assert_eq!(corr.lags.len(), 6);
    // Independent Poisson channels are uncorrelated
    assert!(corr.values.iter().all(|v| (v - 1.0).abs() < 0.2));

    correlator.stop_binner().unwrap();
    pipeline.stop().unwrap();
}
