// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proptest::prelude::*;
use sip_core::{generate_branch, is_rfc3261_branch, Headers, Method, Request, RequestLine, SipUri};
use sip_transaction::{
    Inbound, Role, StaticResolver, TimerHandle, TimerQueue, TransactionKey, TransactionManager,
    TransportContext, TransportDispatcher,
};
use sip_transport::TransportKind;
use tokio::runtime::{Builder, Runtime};
use tokio::time::{sleep, Instant};

fn paused_runtime() -> Runtime {
    Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

struct NullDispatcher;

#[async_trait]
impl TransportDispatcher for NullDispatcher {
    async fn dispatch(&self, _ctx: &TransportContext, _payload: Bytes) -> Result<()> {
        Ok(())
    }
}

fn request(method: Method, branch: &str) -> Request {
    let mut headers = Headers::new();
    headers.push("Via", format!("SIP/2.0/UDP 198.51.100.7;branch={branch}"));
    headers.push("From", "<sip:alice@example.com>;tag=p1");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", format!("prop-{branch}"));
    headers.push("CSeq", format!("7 {}", method.as_str()));
    Request::new(
        RequestLine::new(method, SipUri::parse("sip:bob@example.com").unwrap()),
        headers,
        Bytes::new(),
    )
    .unwrap()
}

#[derive(Debug, Clone)]
enum TimerOp {
    Schedule(u64),
    Cancel(usize),
    Reschedule(usize, u64),
}

fn timer_op() -> impl Strategy<Value = TimerOp> {
    prop_oneof![
        3 => (0u64..500).prop_map(TimerOp::Schedule),
        1 => any::<usize>().prop_map(TimerOp::Cancel),
        1 => (any::<usize>(), 0u64..500).prop_map(|(i, d)| TimerOp::Reschedule(i, d)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// However requests and their retransmissions interleave, each branch is
    /// delivered exactly once and owns exactly one server transaction.
    #[test]
    fn one_transaction_per_branch(sequence in prop::collection::vec(0usize..6, 1..40)) {
        let rt = paused_runtime();
        let (delivered, live) = rt.block_on(async {
            let manager = TransactionManager::new(
                Arc::new(NullDispatcher),
                Arc::new(StaticResolver::default()),
            );
            let ctx = TransportContext::new(
                TransportKind::Udp,
                SocketAddr::from(([198, 51, 100, 7], 5060)),
                None,
            );
            let mut delivered: HashMap<usize, usize> = HashMap::new();
            for index in &sequence {
                let method = if index % 2 == 0 { Method::Invite } else { Method::Options };
                let branch = format!("z9hG4bKprop{index}");
                if let Inbound::Deliver { .. } =
                    manager.receive_request(request(method, &branch), ctx.clone()).await
                {
                    *delivered.entry(*index).or_default() += 1;
                }
            }
            (delivered, manager.server_count())
        });

        let distinct: HashSet<usize> = sequence.iter().copied().collect();
        prop_assert_eq!(live, distinct.len());
        prop_assert_eq!(delivered.len(), distinct.len());
        prop_assert!(delivered.values().all(|count| *count == 1));
    }

    /// Live tasks fire once each, in deadline order with ties broken by
    /// scheduling order; cancelled tasks never fire.
    #[test]
    fn timers_fire_in_deadline_order(ops in prop::collection::vec(timer_op(), 1..40)) {
        let rt = paused_runtime();
        let (fired, expected) = rt.block_on(async {
            let queue = TimerQueue::new();
            let fired = Arc::new(Mutex::new(Vec::new()));
            let start = Instant::now();
            // (handle, deadline, order key) of each scheduled task.
            let mut scheduled: Vec<(TimerHandle, Instant, usize)> = Vec::new();
            let mut cancelled = HashSet::new();
            let mut order = 0usize;

            for op in ops {
                match op {
                    TimerOp::Schedule(ms) => {
                        let id = scheduled.len();
                        let log = fired.clone();
                        let handle = queue.schedule(Duration::from_millis(ms), move || {
                            log.lock().push(id);
                        });
                        scheduled.push((handle, start + Duration::from_millis(ms), order));
                        order += 1;
                    }
                    TimerOp::Cancel(i) if !scheduled.is_empty() => {
                        let id = i % scheduled.len();
                        if queue.cancel(scheduled[id].0) {
                            cancelled.insert(id);
                        }
                    }
                    TimerOp::Reschedule(i, ms) if !scheduled.is_empty() => {
                        let id = i % scheduled.len();
                        if queue.reschedule(scheduled[id].0, Duration::from_millis(ms)) {
                            scheduled[id].1 = start + Duration::from_millis(ms);
                            scheduled[id].2 = order;
                            order += 1;
                        }
                    }
                    _ => {}
                }
            }

            sleep(Duration::from_secs(1)).await;

            let mut expected: Vec<(Instant, usize, usize)> = scheduled
                .iter()
                .enumerate()
                .filter(|(id, _)| !cancelled.contains(id))
                .map(|(id, (_, deadline, order))| (*deadline, *order, id))
                .collect();
            expected.sort();
            let expected: Vec<usize> = expected.into_iter().map(|(_, _, id)| id).collect();
            let fired = fired.lock().clone();
            (fired, expected)
        });
        prop_assert_eq!(fired, expected);
    }

    #[test]
    fn generated_branches_carry_cookie(_iteration in 0..50u8) {
        let branch = generate_branch();
        prop_assert!(is_rfc3261_branch(&branch));
        prop_assert_ne!(branch, generate_branch());
    }

    /// CANCEL keys never collide with the INVITE sharing their branch.
    #[test]
    fn cancel_keys_are_distinct(suffix in "[a-zA-Z0-9.-]{4,24}") {
        let branch = format!("z9hG4bK{suffix}");
        let invite = TransactionKey::server(&branch, &Method::Invite);
        let cancel = TransactionKey::server(&branch, &Method::Cancel);
        prop_assert_ne!(&invite, &cancel);
        prop_assert!(cancel.is_cancel());
        prop_assert_eq!(cancel.wire_branch(), branch.as_str());
        prop_assert_eq!(invite.wire_branch(), branch.as_str());
        prop_assert_eq!(
            TransactionKey::client(&branch, &Method::Ack).role,
            Role::Client
        );
    }
}
