// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pure transaction state machines (RFC 3261 §17, RFC 6026).
//!
//! Each machine consumes an event and returns the actions the runtime must
//! perform. They never touch the network or the clock, which keeps them
//! testable without a runtime. One machine per role handles both INVITE and
//! non-INVITE transactions; the `invite` flag selects the state graph.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use sip_core::{Request, Response};
use sip_parse::{serialize_request, serialize_response};

use crate::{
    metrics::TransactionOutcome, requests::build_ack, ClientState, ServerState, TransactionTimer,
    TransportAwareTimers,
};

/// Inputs to a server transaction.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The request that created the transaction.
    Request(Request),
    /// A retransmission of that request.
    Retransmission,
    SendProvisional(Response),
    SendFinal(Response),
    Ack,
    TimerFired(TransactionTimer),
    TransportError,
}

/// Work requested by a server transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    Transmit { bytes: Bytes },
    Schedule { timer: TransactionTimer, duration: Duration },
    Cancel(TransactionTimer),
    Terminate { reason: TerminateReason },
}

/// Inputs to a client transaction.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Send(Request),
    Provisional(Response),
    Final(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Work requested by a client transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Transmit { bytes: Bytes },
    /// Hand a response to the transaction user.
    Deliver(Response),
    Schedule { timer: TransactionTimer, duration: Duration },
    Cancel(TransactionTimer),
    /// Timer B or F fired.
    Timeout,
    /// The transport failed before a final response.
    TransportFailed,
    Terminate { reason: TerminateReason },
}

/// Why a transaction reached `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminateReason {
    /// A wait timer (D, I, J, K, L or M) ran out after a normal exchange.
    Expired(TransactionTimer),
    /// Timer B, F or H: the peer never answered or never acknowledged.
    TimedOut(TransactionTimer),
    /// Final response sent on a reliable transport.
    FinalSent,
    /// Final response received on a reliable transport.
    FinalReceived,
    /// ACK received on a reliable transport.
    AckReceived,
    TransportError,
}

impl TerminateReason {
    pub fn outcome(&self) -> TransactionOutcome {
        match self {
            Self::TimedOut(_) => TransactionOutcome::Timeout,
            Self::TransportError => TransactionOutcome::TransportError,
            Self::Expired(_) | Self::FinalSent | Self::FinalReceived | Self::AckReceived => {
                TransactionOutcome::Completed
            }
        }
    }
}

impl fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired(timer) | Self::TimedOut(timer) => write!(f, "Timer {:?} expired", timer),
            Self::FinalSent => write!(f, "final response sent"),
            Self::FinalReceived => write!(f, "final response received"),
            Self::AckReceived => write!(f, "ACK received"),
            Self::TransportError => write!(f, "transport error"),
        }
    }
}

fn terminate(reason: TerminateReason) -> ServerAction {
    ServerAction::Terminate { reason }
}

fn client_terminate(reason: TerminateReason) -> ClientAction {
    ClientAction::Terminate { reason }
}

/// Server transaction: RFC 3261 Figures 7 and 8 with the RFC 6026
/// `Accepted` state for INVITE.
#[derive(Debug, Clone)]
pub struct ServerTransactionFsm {
    pub state: ServerState,
    invite: bool,
    timers: TransportAwareTimers,
    g_interval: Duration,
    last_provisional: Option<Bytes>,
    last_final: Option<Bytes>,
}

impl ServerTransactionFsm {
    /// INVITE transactions start in `Proceeding`, everything else in `Trying`.
    pub fn new(invite: bool, timers: TransportAwareTimers) -> Self {
        Self {
            state: if invite {
                ServerState::Proceeding
            } else {
                ServerState::Trying
            },
            invite,
            timers,
            g_interval: timers.duration(TransactionTimer::G),
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn is_invite(&self) -> bool {
        self.invite
    }

    /// Bytes of the last final response sent, if any.
    pub fn last_final(&self) -> Option<&Bytes> {
        self.last_final.as_ref()
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<ServerAction> {
        use ServerState::*;
        match (self.state, event) {
            (_, ServerEvent::TransportError) => {
                self.state = Terminated;
                vec![terminate(TerminateReason::TransportError)]
            }
            (Terminated, _) => Vec::new(),
            (_, ServerEvent::Request(request)) => self.handle_request(&request),
            (_, ServerEvent::Retransmission) => self.handle_retransmission(),
            (Trying | Proceeding, ServerEvent::SendProvisional(response)) => {
                self.send_provisional(&response)
            }
            (Trying | Proceeding, ServerEvent::SendFinal(response)) => self.send_final(&response),
            (Accepted, ServerEvent::SendFinal(response)) if response.start.is_success() => {
                // 2xx retransmissions from the TU pass straight through.
                vec![ServerAction::Transmit {
                    bytes: serialize_response(&response),
                }]
            }
            (Completed, ServerEvent::Ack) if self.invite => self.handle_ack(),
            (Completed, ServerEvent::TimerFired(TransactionTimer::G)) => self.handle_timer_g(),
            (Completed, ServerEvent::TimerFired(TransactionTimer::H)) => {
                self.state = Terminated;
                vec![
                    ServerAction::Cancel(TransactionTimer::G),
                    terminate(TerminateReason::TimedOut(TransactionTimer::H)),
                ]
            }
            (Confirmed, ServerEvent::TimerFired(TransactionTimer::I)) => {
                self.state = Terminated;
                vec![terminate(TerminateReason::Expired(TransactionTimer::I))]
            }
            (Completed, ServerEvent::TimerFired(TransactionTimer::J)) => {
                self.state = Terminated;
                vec![terminate(TerminateReason::Expired(TransactionTimer::J))]
            }
            (Accepted, ServerEvent::TimerFired(TransactionTimer::L)) => {
                self.state = Terminated;
                vec![terminate(TerminateReason::Expired(TransactionTimer::L))]
            }
            _ => Vec::new(),
        }
    }

    fn handle_request(&mut self, request: &Request) -> Vec<ServerAction> {
        if !self.invite || self.last_provisional.is_some() {
            return Vec::new();
        }
        // INVITE: answer 100 Trying right away so the client stops Timer A.
        match request.response(100, "Trying") {
            Ok(trying) => {
                let bytes = serialize_response(&trying);
                self.last_provisional = Some(bytes.clone());
                vec![ServerAction::Transmit { bytes }]
            }
            Err(_) => Vec::new(),
        }
    }

    fn handle_retransmission(&mut self) -> Vec<ServerAction> {
        let resend = match self.state {
            ServerState::Proceeding => self.last_provisional.clone(),
            ServerState::Completed => self.last_final.clone(),
            _ => None,
        };
        resend
            .map(|bytes| vec![ServerAction::Transmit { bytes }])
            .unwrap_or_default()
    }

    fn send_provisional(&mut self, response: &Response) -> Vec<ServerAction> {
        let bytes = serialize_response(response);
        self.last_provisional = Some(bytes.clone());
        self.state = ServerState::Proceeding;
        vec![ServerAction::Transmit { bytes }]
    }

    fn send_final(&mut self, response: &Response) -> Vec<ServerAction> {
        let bytes = serialize_response(response);
        let mut actions = vec![ServerAction::Transmit {
            bytes: bytes.clone(),
        }];

        if self.invite && response.start.is_success() {
            self.state = ServerState::Accepted;
            actions.push(ServerAction::Schedule {
                timer: TransactionTimer::L,
                duration: self.timers.duration(TransactionTimer::L),
            });
            return actions;
        }

        self.state = ServerState::Completed;
        self.last_final = Some(bytes);
        if self.invite {
            if self.timers.should_retransmit() {
                self.g_interval = self.timers.duration(TransactionTimer::G);
                actions.push(ServerAction::Schedule {
                    timer: TransactionTimer::G,
                    duration: self.g_interval,
                });
            }
            actions.push(ServerAction::Schedule {
                timer: TransactionTimer::H,
                duration: self.timers.duration(TransactionTimer::H),
            });
        } else {
            let j = self.timers.duration(TransactionTimer::J);
            if j.is_zero() {
                self.state = ServerState::Terminated;
                actions.push(terminate(TerminateReason::FinalSent));
            } else {
                actions.push(ServerAction::Schedule {
                    timer: TransactionTimer::J,
                    duration: j,
                });
            }
        }
        actions
    }

    fn handle_ack(&mut self) -> Vec<ServerAction> {
        self.state = ServerState::Confirmed;
        let mut actions = vec![
            ServerAction::Cancel(TransactionTimer::G),
            ServerAction::Cancel(TransactionTimer::H),
        ];
        let i = self.timers.duration(TransactionTimer::I);
        if i.is_zero() {
            self.state = ServerState::Terminated;
            actions.push(terminate(TerminateReason::AckReceived));
        } else {
            actions.push(ServerAction::Schedule {
                timer: TransactionTimer::I,
                duration: i,
            });
        }
        actions
    }

    fn handle_timer_g(&mut self) -> Vec<ServerAction> {
        let Some(bytes) = self.last_final.clone() else {
            return Vec::new();
        };
        self.g_interval = self.timers.backoff(self.g_interval);
        vec![
            ServerAction::Transmit { bytes },
            ServerAction::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            },
        ]
    }
}

/// Client transaction: RFC 3261 Figures 5 and 6 with the RFC 6026
/// `Accepted` state for INVITE.
#[derive(Debug, Clone)]
pub struct ClientTransactionFsm {
    pub state: ClientState,
    invite: bool,
    timers: TransportAwareTimers,
    interval: Duration,
    request: Option<Request>,
    last_request: Option<Bytes>,
    ack: Option<Bytes>,
    responded: bool,
}

impl ClientTransactionFsm {
    /// INVITE transactions start in `Calling`, everything else in `Trying`.
    pub fn new(invite: bool, timers: TransportAwareTimers) -> Self {
        Self {
            state: if invite {
                ClientState::Calling
            } else {
                ClientState::Trying
            },
            invite,
            timers,
            interval: timers.duration(if invite {
                TransactionTimer::A
            } else {
                TransactionTimer::E
            }),
            request: None,
            last_request: None,
            ack: None,
            responded: false,
        }
    }

    pub fn is_invite(&self) -> bool {
        self.invite
    }

    /// Whether any response has been received.
    pub fn responded(&self) -> bool {
        self.responded
    }

    /// The request this transaction is sending.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    fn retransmit_timer(&self) -> TransactionTimer {
        if self.invite {
            TransactionTimer::A
        } else {
            TransactionTimer::E
        }
    }

    fn timeout_timer(&self) -> TransactionTimer {
        if self.invite {
            TransactionTimer::B
        } else {
            TransactionTimer::F
        }
    }

    pub fn on_event(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        use ClientState::*;
        match (self.state, event) {
            (Terminated, _) => Vec::new(),
            (Calling | Trying, ClientEvent::Send(request)) if self.request.is_none() => {
                self.handle_send(request)
            }
            (_, ClientEvent::Provisional(response)) => self.handle_provisional(response),
            (_, ClientEvent::Final(response)) => self.handle_final(response),
            (Calling, ClientEvent::TimerFired(TransactionTimer::A))
            | (Trying, ClientEvent::TimerFired(TransactionTimer::E)) => self.handle_retransmit(),
            (Calling, ClientEvent::TimerFired(TransactionTimer::B))
            | (Trying | Proceeding, ClientEvent::TimerFired(TransactionTimer::F)) => {
                self.state = Terminated;
                vec![
                    ClientAction::Cancel(self.retransmit_timer()),
                    ClientAction::Timeout,
                    client_terminate(TerminateReason::TimedOut(self.timeout_timer())),
                ]
            }
            (Completed, ClientEvent::TimerFired(TransactionTimer::D)) => {
                self.state = Terminated;
                vec![client_terminate(TerminateReason::Expired(TransactionTimer::D))]
            }
            (Completed, ClientEvent::TimerFired(TransactionTimer::K)) => {
                self.state = Terminated;
                vec![client_terminate(TerminateReason::Expired(TransactionTimer::K))]
            }
            (Accepted, ClientEvent::TimerFired(TransactionTimer::M)) => {
                self.state = Terminated;
                vec![client_terminate(TerminateReason::Expired(TransactionTimer::M))]
            }
            (Calling | Trying | Proceeding, ClientEvent::TransportError) => {
                self.state = Terminated;
                vec![
                    ClientAction::TransportFailed,
                    client_terminate(TerminateReason::TransportError),
                ]
            }
            (_, ClientEvent::TransportError) => {
                self.state = Terminated;
                vec![client_terminate(TerminateReason::TransportError)]
            }
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, request: Request) -> Vec<ClientAction> {
        let bytes = serialize_request(&request);
        self.last_request = Some(bytes.clone());
        self.request = Some(request);

        let mut actions = vec![ClientAction::Transmit { bytes }];
        if self.timers.should_retransmit() {
            let timer = self.retransmit_timer();
            self.interval = self.timers.duration(timer);
            actions.push(ClientAction::Schedule {
                timer,
                duration: self.interval,
            });
        }
        let timeout = self.timeout_timer();
        actions.push(ClientAction::Schedule {
            timer: timeout,
            duration: self.timers.duration(timeout),
        });
        actions
    }

    fn handle_retransmit(&mut self) -> Vec<ClientAction> {
        let Some(bytes) = self.last_request.clone() else {
            return Vec::new();
        };
        self.interval = self.timers.backoff(self.interval);
        vec![
            ClientAction::Transmit { bytes },
            ClientAction::Schedule {
                timer: self.retransmit_timer(),
                duration: self.interval,
            },
        ]
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ClientAction> {
        self.responded = true;
        match self.state {
            ClientState::Calling | ClientState::Trying => {
                self.state = ClientState::Proceeding;
                vec![
                    ClientAction::Cancel(self.retransmit_timer()),
                    ClientAction::Deliver(response),
                ]
            }
            ClientState::Proceeding => vec![ClientAction::Deliver(response)],
            _ => Vec::new(),
        }
    }

    fn handle_final(&mut self, response: Response) -> Vec<ClientAction> {
        self.responded = true;
        if self.invite {
            self.handle_invite_final(response)
        } else {
            self.handle_non_invite_final(response)
        }
    }

    fn handle_invite_final(&mut self, response: Response) -> Vec<ClientAction> {
        let success = response.start.is_success();
        match self.state {
            ClientState::Calling | ClientState::Proceeding if success => {
                self.state = ClientState::Accepted;
                vec![
                    ClientAction::Cancel(TransactionTimer::A),
                    ClientAction::Cancel(TransactionTimer::B),
                    ClientAction::Deliver(response),
                    ClientAction::Schedule {
                        timer: TransactionTimer::M,
                        duration: self.timers.duration(TransactionTimer::M),
                    },
                ]
            }
            ClientState::Calling | ClientState::Proceeding => {
                let mut actions = vec![
                    ClientAction::Cancel(TransactionTimer::A),
                    ClientAction::Cancel(TransactionTimer::B),
                ];
                if let Some(invite) = &self.request {
                    let ack = serialize_request(&build_ack(invite, &response));
                    self.ack = Some(ack.clone());
                    actions.push(ClientAction::Transmit { bytes: ack });
                }
                actions.push(ClientAction::Deliver(response));
                let d = self.timers.duration(TransactionTimer::D);
                if d.is_zero() {
                    self.state = ClientState::Terminated;
                    actions.push(client_terminate(TerminateReason::FinalReceived));
                } else {
                    self.state = ClientState::Completed;
                    actions.push(ClientAction::Schedule {
                        timer: TransactionTimer::D,
                        duration: d,
                    });
                }
                actions
            }
            // 2xx retransmissions and forked 2xx go to the TU, which owns their ACK.
            ClientState::Accepted if success => vec![ClientAction::Deliver(response)],
            ClientState::Completed if !success => self
                .ack
                .clone()
                .map(|bytes| vec![ClientAction::Transmit { bytes }])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn handle_non_invite_final(&mut self, response: Response) -> Vec<ClientAction> {
        if !matches!(self.state, ClientState::Trying | ClientState::Proceeding) {
            return Vec::new();
        }
        let mut actions = vec![
            ClientAction::Cancel(TransactionTimer::E),
            ClientAction::Cancel(TransactionTimer::F),
            ClientAction::Deliver(response),
        ];
        let k = self.timers.duration(TransactionTimer::K);
        if k.is_zero() {
            self.state = ClientState::Terminated;
            actions.push(client_terminate(TerminateReason::FinalReceived));
        } else {
            self.state = ClientState::Completed;
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::K,
                duration: k,
            });
        }
        actions
    }
}
