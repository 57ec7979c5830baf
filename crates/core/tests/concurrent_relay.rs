//! One relay shared by many threads
//!
//! Workers connect, negotiate, hang up and disconnect their own peers while
//! offers cross between threads. An observer thread checks consistency while
//! they run; every check takes the relay lock, so it must never see a
//! half-applied routing step.

use callrelay_core::{ClientMessage, PeerId, Relay, RelaySettings, RoutingPolicy, ServerMessage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;

const WORKERS: u64 = 8;
const ITERATIONS: usize = 2_000;

// Large enough that draining once per iteration never lets a queue fill
const QUEUE_CAPACITY: usize = 65_536;

struct OwnedPeer {
    id: PeerId,
    rx: mpsc::Receiver<ServerMessage>,
}

fn shared_relay(policy: RoutingPolicy) -> Arc<Relay> {
    Arc::new(Relay::new(&RelaySettings {
        routing_policy: policy,
        max_peers: 0,
        ..Default::default()
    }))
}

fn worker(relay: Arc<Relay>, worker_id: u64, all_ids: Arc<Vec<PeerId>>) -> OwnedPeer {
    let mut rng = StdRng::seed_from_u64(worker_id);
    let mut peers: Vec<OwnedPeer> = Vec::new();
    let mut next = 0usize;

    let mut connect = |peers: &mut Vec<OwnedPeer>| {
        next += 1;
        let id = PeerId::from(format!("w{}-{}", worker_id, next));
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        relay.register(id.clone(), None, tx).unwrap();
        peers.push(OwnedPeer { id, rx });
    };

    for _ in 0..ITERATIONS {
        if peers.is_empty() {
            connect(&mut peers);
        }

        let idx = rng.gen_range(0..peers.len());
        let from = peers[idx].id.clone();
        let payload = json!({"n": rng.gen::<u32>()});

        match rng.gen_range(0..7) {
            0 => connect(&mut peers),
            1 => {
                let gone = peers.swap_remove(idx);
                assert!(relay.unregister(&gone.id));
                assert!(relay.lookup(&gone.id).is_none());
            }
            2 => {
                let target = if relay.policy().is_addressed() {
                    Some(all_ids[rng.gen_range(0..all_ids.len())].clone())
                } else {
                    None
                };
                relay.handle_message(&from, ClientMessage::Offer { payload, target });
            }
            3 => {
                relay.handle_message(&from, ClientMessage::Answer { payload });
            }
            4 => {
                relay.handle_message(&from, ClientMessage::IceCandidate { payload });
            }
            5 => {
                relay.handle_message(&from, ClientMessage::Hangup);
                assert!(relay.sessions_of(&from).is_empty());
            }
            _ => {
                assert!(relay.touch(&from));
            }
        }

        for peer in peers.iter_mut() {
            while peer.rx.try_recv().is_ok() {}
        }
    }

    if peers.is_empty() {
        connect(&mut peers);
    }
    let survivor = peers.swap_remove(0);
    for peer in peers {
        assert!(relay.unregister(&peer.id));
    }
    survivor
}

fn run_concurrent(policy: RoutingPolicy) {
    let relay = shared_relay(policy);
    let done = Arc::new(AtomicBool::new(false));

    // Addressed offers target early ids of every worker; some will be gone
    let all_ids: Arc<Vec<PeerId>> = Arc::new(
        (0..WORKERS)
            .flat_map(|w| (1..=20).map(move |n| PeerId::from(format!("w{}-{}", w, n))))
            .collect(),
    );

    let observer = {
        let relay = Arc::clone(&relay);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut checks = 0u64;
            while !done.load(Ordering::SeqCst) {
                relay.verify_invariants().unwrap();
                checks += 1;
            }
            checks
        })
    };

    let workers: Vec<_> = (0..WORKERS)
        .map(|w| {
            let relay = Arc::clone(&relay);
            let all_ids = Arc::clone(&all_ids);
            thread::spawn(move || worker(relay, w, all_ids))
        })
        .collect();

    let survivors: Vec<OwnedPeer> = workers
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    done.store(true, Ordering::SeqCst);
    assert!(observer.join().unwrap() > 0);

    relay.verify_invariants().unwrap();
    assert_eq!(relay.stats().peers, survivors.len());
    for peer in &survivors {
        assert!(relay.lookup(&peer.id).is_some());
    }

    for peer in &survivors {
        assert!(relay.unregister(&peer.id));
    }
    let stats = relay.stats();
    assert_eq!(stats.peers, 0);
    assert_eq!(stats.sessions, 0);
}

#[test]
fn test_concurrent_churn_broadcast() {
    run_concurrent(RoutingPolicy::Broadcast);
}

#[test]
fn test_concurrent_churn_addressed() {
    run_concurrent(RoutingPolicy::Addressed);
}

#[test]
fn test_concurrent_register_unregister_distinct_peers() {
    let relay = shared_relay(RoutingPolicy::Broadcast);

    let handles: Vec<_> = (0..WORKERS)
        .map(|w| {
            let relay = Arc::clone(&relay);
            thread::spawn(move || {
                let mut receivers = Vec::new();
                for i in 0..ITERATIONS {
                    let id = PeerId::from(format!("t{}-{}", w, i));
                    let (tx, rx) = mpsc::channel(4);
                    relay.register(id.clone(), None, tx).unwrap();
                    if i % 2 == 0 {
                        assert!(relay.unregister(&id));
                        assert!(relay.lookup(&id).is_none());
                    } else {
                        receivers.push(rx);
                    }
                }
                receivers
            })
        })
        .collect();

    let kept: usize = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().len())
        .sum();

    assert_eq!(kept, WORKERS as usize * ITERATIONS / 2);
    assert_eq!(relay.stats().peers, kept);
    relay.verify_invariants().unwrap();
}
