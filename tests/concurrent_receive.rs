use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use filemq::{Address, InboundQueue, Message, QueueConfig};
use time::OffsetDateTime;

const PRODUCERS: usize = 4;
const CONSUMERS: usize = 6;
const PER_PRODUCER: usize = 100;

#[test]
fn each_message_goes_to_exactly_one_receiver() -> filemq::Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = Arc::new(InboundQueue::open("conc", &QueueConfig::new(dir.path()))?);
    let (tx, rx) = mpsc::channel();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            thread::spawn(move || {
                while let Some(m) = queue.receive(Some(Duration::from_secs(2))).unwrap() {
                    tx.send(m.id).unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let from = Address::tcp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, p as u8)), 7000);
                for i in 0..PER_PRODUCER {
                    let m = Message::text(from.clone(), "n", i.to_string(), OffsetDateTime::now_utc());
                    queue.enqueue(m).unwrap();
                }
            })
        })
        .collect();

    for handle in producers {
        handle.join().unwrap();
    }
    for handle in consumers {
        handle.join().unwrap();
    }

    let ids: Vec<_> = rx.iter().collect();
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(ids.len(), PRODUCERS * PER_PRODUCER);
    assert_eq!(unique.len(), ids.len());
    assert_eq!(queue.count(), 0);
    assert_eq!(std::fs::read_dir(dir.path().join("in"))?.count(), 0);
    Ok(())
}
