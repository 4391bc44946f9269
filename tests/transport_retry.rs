use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plmgate::metrics;
use plmgate::plm::memory::MemoryModem;
use plmgate::plm::port::{start_port, MessageWriter, PortEvent, PortTuning};
use plmgate::plm::registry::MessageRegistry;

fn fast_tuning() -> PortTuning {
    PortTuning {
        read_timeout: Duration::from_millis(5),
        ack_timeout: Duration::from_millis(50),
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
        reconnect_backoff: vec![Duration::from_millis(10)],
    }
}

#[tokio::test]
async fn silent_modem_gets_one_send_and_three_retransmissions() {
    let modem = MemoryModem::new();
    let registry = Arc::new(MessageRegistry::standard());
    let (port, _tasks) = start_port(Arc::new(modem.connector()), registry.clone(), fast_tuning())
        .await
        .unwrap();

    port.write(registry.make("GetIMInfo").unwrap()).unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(modem.writes(), vec![vec![0x02, 0x60]; 4]);
    assert!(metrics::snapshot().write_failures >= 1);

    // the writer moves on to the next message after giving up
    modem.take_writes();
    port.write(registry.make("GetIMConfiguration").unwrap()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(modem.writes().first(), Some(&vec![0x02, 0x73]));
    port.shutdown();
}

#[tokio::test]
async fn nack_is_retransmitted_until_acked() {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let modem = MemoryModem::with_responder(move |out| {
        // modem busy twice, then echo with ACK
        if seen.fetch_add(1, Ordering::SeqCst) < 2 {
            vec![0x15]
        } else {
            let mut echo = out.to_vec();
            echo.push(0x06);
            echo
        }
    });
    let registry = Arc::new(MessageRegistry::standard());
    let (port, _tasks) = start_port(Arc::new(modem.connector()), registry.clone(), fast_tuning())
        .await
        .unwrap();
    let mut events = port.subscribe();

    let mut msg = registry.make("LEDOn").unwrap();
    msg.set_quiet_time(Duration::ZERO);
    port.write(msg).unwrap();

    let echo = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(PortEvent::Message(m)) if m.command_number() == 0x6D => return m,
                Some(_) => continue,
                None => panic!("port closed"),
            }
        }
    })
    .await
    .expect("no echo");
    assert!(echo.is_echo());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(modem.writes().len(), 3);
    port.shutdown();
}

#[tokio::test]
async fn broken_link_is_reopened() {
    let modem = MemoryModem::new();
    let registry = Arc::new(MessageRegistry::standard());
    let (port, _tasks) = start_port(Arc::new(modem.connector()), registry, fast_tuning())
        .await
        .unwrap();
    let mut events = port.subscribe();
    assert_eq!(modem.opens(), 1);

    modem.fail_opens(2);
    modem.break_link();
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no reconnect")
        .expect("port closed");
    assert!(matches!(event, PortEvent::Reconnected));
    assert_eq!(modem.opens(), 2);

    // frames after the reconnect still arrive
    modem.inject(&[0x02, 0x50, 0x28, 0xC3, 0x91, 0x00, 0x00, 0x01, 0xCF, 0x11, 0x00]);
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no message")
        .expect("port closed");
    match event {
        PortEvent::Message(m) => assert!(m.is_all_link_broadcast()),
        other => panic!("unexpected {:?}", other),
    }
    port.shutdown();
}

#[tokio::test]
async fn shutdown_closes_listeners() {
    let modem = MemoryModem::new();
    let registry = Arc::new(MessageRegistry::standard());
    let (port, tasks) = start_port(Arc::new(modem.connector()), registry, fast_tuning())
        .await
        .unwrap();
    let mut events = port.subscribe();
    port.shutdown();
    for t in tasks {
        tokio::time::timeout(Duration::from_secs(2), t).await.unwrap().unwrap();
    }
    assert!(events.recv().await.is_none());
    assert!(port.write(MessageRegistry::standard().make("GetIMInfo").unwrap()).is_err());
}
