use std::sync::Arc;
use std::time::Duration;

use plmgate::plm::address::DeviceAddress;
use plmgate::plm::memory::MemoryModem;
use plmgate::plm::modem_db::{DbEvent, ModemDb, ModemDbBuilder};
use plmgate::plm::port::{start_port, MessageWriter, PortTuning};
use plmgate::plm::registry::MessageRegistry;

const SWITCH: [u8; 3] = [0x28, 0xC3, 0x91];
const KEYPAD: [u8; 3] = [0x1A, 0x2B, 0x3C];

fn tuning() -> PortTuning {
    PortTuning {
        read_timeout: Duration::from_millis(5),
        ack_timeout: Duration::from_millis(200),
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
        reconnect_backoff: vec![Duration::from_millis(10)],
    }
}

/// A modem whose link table loses the switch between the first and the
/// second download.
fn shrinking_modem() -> MemoryModem {
    let mut cycle = 0u32;
    let mut next = 0usize;
    MemoryModem::with_responder(move |out| {
        let mut reply = out.to_vec();
        match out.get(1) {
            Some(0x60) => reply.extend_from_slice(&[0x44, 0x85, 0x11, 0x03, 0x15, 0x9B, 0x06]),
            Some(cmd @ (0x69 | 0x6A)) => {
                if *cmd == 0x69 {
                    cycle += 1;
                    next = 0;
                }
                let records: Vec<(u8, u8, [u8; 3])> = if cycle == 1 {
                    vec![(0xA2, 1, SWITCH), (0xE2, 0, KEYPAD), (0xA2, 3, KEYPAD)]
                } else {
                    vec![(0xE2, 0, KEYPAD)]
                };
                match records.get(next) {
                    Some((flags, group, addr)) => {
                        next += 1;
                        reply.push(0x06);
                        reply.extend_from_slice(&[0x02, 0x57, *flags, *group]);
                        reply.extend_from_slice(addr);
                        reply.extend_from_slice(&[0x01, 0x20, 0x41]);
                    }
                    None => reply.push(0x15),
                }
            }
            _ => reply.push(0x06),
        }
        reply
    })
}

#[tokio::test]
async fn download_on_startup_and_again_after_reconnect() {
    let modem = shrinking_modem();
    let registry = Arc::new(MessageRegistry::standard());
    let (port, _tasks) = start_port(Arc::new(modem.connector()), registry.clone(), tuning())
        .await
        .unwrap();

    let db = ModemDb::new();
    let builder = ModemDbBuilder::new(db.clone(), registry.clone(), Duration::from_secs(30));
    let (db_tx, mut db_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(builder.run(port.subscribe(), port.clone(), db_tx));

    // nothing happens until the modem has identified itself
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(modem.writes().is_empty());
    assert!(!db.is_complete());
    port.write(registry.make("GetIMInfo").unwrap()).unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), db_rx.recv())
        .await
        .expect("download did not finish")
        .unwrap();
    assert_eq!(first, DbEvent::Complete { entries: 2 });
    assert!(db.is_complete());
    assert!(db.contains(&DeviceAddress::from_bytes(SWITCH)));
    let entry = db.entry(&DeviceAddress::from_bytes(KEYPAD)).unwrap();
    assert!(entry.controls().contains(&0));
    assert!(entry.responds_to().contains(&3));
    assert_eq!(entry.link_records().len(), 2);

    modem.take_writes();
    modem.break_link();
    let second = tokio::time::timeout(Duration::from_secs(5), db_rx.recv())
        .await
        .expect("no download after reconnect")
        .unwrap();
    assert_eq!(second, DbEvent::Complete { entries: 1 });
    assert_eq!(modem.opens(), 2);
    assert_eq!(modem.writes().first(), Some(&vec![0x02, 0x69]));

    // only the second cycle's records survive
    assert!(!db.contains(&DeviceAddress::from_bytes(SWITCH)));
    let entry = db.entry(&DeviceAddress::from_bytes(KEYPAD)).unwrap();
    assert_eq!(entry.link_records().len(), 1);
    assert!(entry.responds_to().is_empty());
    port.shutdown();
}

#[tokio::test]
async fn silent_modem_is_asked_again_until_it_answers() {
    let mut ignored = 0u32;
    let modem = MemoryModem::with_responder(move |out| {
        let mut reply = out.to_vec();
        match out.get(1) {
            Some(0x60) if ignored < 4 => {
                ignored += 1;
                return Vec::new();
            }
            Some(0x60) => reply.extend_from_slice(&[0x44, 0x85, 0x11, 0x03, 0x15, 0x9B, 0x06]),
            Some(0x69) => reply.push(0x15),
            _ => reply.push(0x06),
        }
        reply
    });
    let registry = Arc::new(MessageRegistry::standard());
    let tuning = PortTuning {
        ack_timeout: Duration::from_millis(100),
        ..tuning()
    };
    let (port, _tasks) = start_port(Arc::new(modem.connector()), registry.clone(), tuning)
        .await
        .unwrap();

    let db = ModemDb::new();
    let builder = ModemDbBuilder::new(db.clone(), registry.clone(), Duration::from_millis(500));
    let (db_tx, mut db_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(builder.run(port.subscribe(), port.clone(), db_tx));

    // the one request every attempt of which goes unanswered
    port.write(registry.make("GetIMInfo").unwrap()).unwrap();

    let done = tokio::time::timeout(Duration::from_secs(5), db_rx.recv())
        .await
        .expect("download never started")
        .unwrap();
    assert_eq!(done, DbEvent::Complete { entries: 0 });
    assert!(db.is_complete());
    let im_queries = modem.writes().iter().filter(|w| w.as_slice() == [0x02, 0x60]).count();
    assert_eq!(im_queries, 5);
    port.shutdown();
}
