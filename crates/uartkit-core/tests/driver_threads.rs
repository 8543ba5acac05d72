use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use uartkit_core::{
    BackendError, ConfigParam, DriverState, MockBackend, StateError, TransferStrategy, UartConfig,
    UartDriver,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(2));

fn open_driver(strategy: TransferStrategy) -> (Arc<UartDriver<MockBackend>>, MockBackend) {
    let mock = MockBackend::new();
    let uart = UartDriver::new(1, mock.clone());
    uart.configure(UartConfig::default()).unwrap();
    uart.open(strategy).unwrap();
    (Arc::new(uart), mock)
}

#[test]
fn round_trip_over_interrupt() {
    let mock = MockBackend::new();
    let uart = UartDriver::new(1, mock.clone());
    uart.set_config(ConfigParam::BaudRate, 115_200).unwrap();
    uart.set_config(ConfigParam::DataBits, 8).unwrap();
    uart.set_config(ConfigParam::Parity, 0).unwrap();
    uart.set_config(ConfigParam::StopBits, 1).unwrap();
    uart.open(TransferStrategy::Interrupt).unwrap();

    assert!(mock.inject(&[0x48, 0x69]));
    let got = uart.read(10, WAIT).unwrap();
    assert_eq!(got, vec![0x48, 0x69]);
    assert_eq!(got.len(), 2);

    uart.close().unwrap();
    assert!(uart.read(10, WAIT).unwrap_err().is_not_open());
    assert_eq!(
        mock.opened(),
        vec![(
            UartConfig {
                baud_rate: 115_200,
                data_bits: 8,
                parity: false,
                stop_bits: 1,
            },
            TransferStrategy::Interrupt
        )]
    );
}

#[test]
fn interleaved_cycles_preserve_order() {
    for strategy in [TransferStrategy::Interrupt, TransferStrategy::Dma, TransferStrategy::Polling] {
        let (uart, mock) = open_driver(strategy);
        let mut received = Vec::new();
        for cycle in 0u8..5 {
            let chunk = [cycle * 3, cycle * 3 + 1, cycle * 3 + 2];
            mock.inject(&chunk);
            // Leave one byte behind each cycle so leftovers carry over.
            received.extend(uart.read(2, WAIT).unwrap());
        }
        while received.len() < 15 {
            let more = uart.read(64, WAIT).unwrap();
            assert!(!more.is_empty(), "{strategy:?}: bytes went missing");
            received.extend(more);
        }
        assert_eq!(received, (0u8..15).collect::<Vec<_>>(), "{strategy:?}");
    }
}

#[test]
fn producer_thread_bytes_arrive_in_order() {
    let (uart, mock) = open_driver(TransferStrategy::Dma);
    let producer = thread::spawn(move || {
        for block in 0u8..50 {
            mock.inject(&[block; 4]);
            if block % 10 == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
    });

    let mut received = Vec::new();
    while received.len() < 200 {
        let chunk = uart.read(7, WAIT).unwrap();
        assert!(!chunk.is_empty(), "timed out after {} bytes", received.len());
        assert!(chunk.len() <= 7);
        received.extend(chunk);
    }
    producer.join().unwrap();

    let expected: Vec<u8> = (0u8..50).flat_map(|b| [b; 4]).collect();
    assert_eq!(received, expected);
}

#[test]
fn zero_timeout_without_data_returns_empty() {
    for strategy in [TransferStrategy::Polling, TransferStrategy::Interrupt, TransferStrategy::Dma] {
        let (uart, _mock) = open_driver(strategy);
        let started = Instant::now();
        assert!(uart.read(16, Some(Duration::ZERO)).unwrap().is_empty());
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}

#[test]
fn read_honours_its_timeout() {
    let (uart, _mock) = open_driver(TransferStrategy::Interrupt);
    let started = Instant::now();
    assert!(uart.read(16, Some(Duration::from_millis(50))).unwrap().is_empty());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_secs(1), "waited {waited:?}");
}

#[test]
fn close_wakes_a_blocked_reader() {
    let (uart, _mock) = open_driver(TransferStrategy::Interrupt);
    let reader = {
        let uart = uart.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let res = uart.read(8, Some(Duration::from_secs(30)));
            (res, started.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(50));
    uart.close().unwrap();

    let (res, waited) = reader.join().unwrap();
    assert_eq!(res.unwrap_err().state(), Some(StateError::NotOpen));
    assert!(waited < Duration::from_secs(5), "reader hung for {waited:?}");
}

#[test]
fn receive_failure_wakes_a_blocked_reader() {
    let (uart, mock) = open_driver(TransferStrategy::Interrupt);
    let reader = {
        let uart = uart.clone();
        thread::spawn(move || {
            let started = Instant::now();
            (uart.read(8, Some(Duration::from_secs(30))), started.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(mock.inject_error(BackendError::Other("adapter unplugged".into())));

    let (res, waited) = reader.join().unwrap();
    assert!(res.unwrap_err().is_backend());
    assert!(waited < Duration::from_secs(5), "reader hung for {waited:?}");
    assert_eq!(uart.state(), DriverState::Open);
}

#[test]
fn close_wakes_a_polling_reader() {
    let (uart, _mock) = open_driver(TransferStrategy::Polling);
    let reader = {
        let uart = uart.clone();
        thread::spawn(move || uart.read(8, Some(Duration::from_secs(30))))
    };
    thread::sleep(Duration::from_millis(20));
    uart.close().unwrap();
    assert!(reader.join().unwrap().unwrap_err().is_not_open());
}

#[test]
fn reader_from_a_closed_session_does_not_see_the_next_one() {
    let (uart, mock) = open_driver(TransferStrategy::Interrupt);
    let reader = {
        let uart = uart.clone();
        thread::spawn(move || uart.read(8, Some(Duration::from_secs(30))))
    };
    thread::sleep(Duration::from_millis(20));
    uart.close().unwrap();
    uart.configure(UartConfig::default()).unwrap();
    uart.open(TransferStrategy::Interrupt).unwrap();
    mock.inject(b"new");

    assert!(reader.join().unwrap().unwrap_err().is_not_open());
    assert_eq!(uart.read(8, WAIT).unwrap(), b"new");
}

#[test]
fn bytes_after_close_are_not_delivered() {
    let (uart, mock) = open_driver(TransferStrategy::Dma);
    uart.close().unwrap();
    assert!(!mock.inject(b"late"));
    assert_eq!(uart.state(), DriverState::Closed);

    uart.configure(UartConfig::default()).unwrap();
    uart.open(TransferStrategy::Dma).unwrap();
    assert!(uart.read(8, Some(Duration::from_millis(20))).unwrap().is_empty());
}

#[test]
fn concurrent_readers_share_the_stream() {
    let (uart, mock) = open_driver(TransferStrategy::Interrupt);
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let uart = uart.clone();
            thread::spawn(move || {
                let mut got = Vec::new();
                while let Ok(chunk) = uart.read(3, Some(Duration::from_millis(200))) {
                    if chunk.is_empty() {
                        break;
                    }
                    got.extend(chunk);
                }
                got
            })
        })
        .collect();

    for i in 0u8..20 {
        mock.inject(&[i]);
    }

    let mut all: Vec<u8> = readers.into_iter().flat_map(|r| r.join().unwrap()).collect();
    all.sort_unstable();
    assert_eq!(all, (0u8..20).collect::<Vec<_>>());
}

#[test]
fn write_while_closed_fails() {
    let (uart, mock) = open_driver(TransferStrategy::Polling);
    assert_eq!(uart.write(b"Hello, UART!").unwrap(), 12);
    uart.close().unwrap();
    assert!(uart.write(b"again").unwrap_err().is_not_open());
    assert_eq!(mock.transmitted(), b"Hello, UART!");
}
