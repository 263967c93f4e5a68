//! SIP user agent for one agent
//!
//! Uses rsipstack for the transport and transaction layers, so requests and
//! final responses are retransmitted and timed out by the stack. On top of
//! it the engine registers with the registrar (answering one digest
//! challenge per REGISTER), refreshes the registration at half the expiry,
//! and answers exactly one inbound call. The caller's media address is handed
//! to the orchestrator through [`RemoteMedia`] once the INVITE is answered.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ftth_rsipstack::{
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        transaction::Transaction,
        Endpoint,
    },
    transport::{
        udp::{UdpConnection, UdpInner},
        SipAddr, SipConnection, TransportLayer,
    },
    EndpointBuilder,
};
use rsip::headers::UntypedHeader;
use rsip::{Header, Method, Request, Response, SipMessage, StatusCode};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::message::{self, response_for, set_body};
use super::request::SipRequestCreator;
use super::sdp;
use super::SipError;
use crate::server::agent::{AgentConfig, CallState, SignalingState, SipTransport};
use crate::server::rtp::RtpAddress;

/// Upper bound on one REGISTER exchange, challenge round included
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// SIP listening point of one agent.
///
/// Created once per call by the orchestrator and moved into the engine.
/// Dropping it stops the endpoint and releases the socket.
pub struct SipStack {
    name: String,
    endpoint: Arc<Endpoint>,
    connection: SipConnection,
    local_addr: SocketAddr,
    registrar: SocketAddr,
    cancel: CancellationToken,
}

impl SipStack {
    pub async fn bind(config: &AgentConfig) -> Result<Self, SipError> {
        if config.transport() != SipTransport::Udp {
            return Err(SipError::Transport(format!(
                "{} transport is not supported",
                config.transport()
            )));
        }

        let registrar = tokio::net::lookup_host((config.sip_registrar_ip(), config.sip_registrar_port()))
            .await
            .map_err(|e| SipError::Transport(format!("DNS resolution failed: {}", e)))?
            .next()
            .ok_or_else(|| {
                SipError::Transport(format!(
                    "No addresses found for registrar {}",
                    config.sip_registrar_ip()
                ))
            })?;

        // Bound here so a configured port of 0 is known before Via/Contact are built
        let bind_addr = format!("{}:{}", config.sip_local_ip(), config.sip_local_port());
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|e| SipError::Transport(format!("Failed to bind {}: {}", bind_addr, e)))?;
        let local_addr = socket.local_addr()?;

        let cancel = CancellationToken::new();
        let mut sip_addr = SipAddr::from(local_addr);
        sip_addr.r#type = Some(rsip::transport::Transport::Udp);

        let connection: SipConnection = UdpConnection::attach(
            UdpInner {
                conn: socket,
                addr: sip_addr,
            },
            None,
            Some(cancel.child_token()),
        )
        .await
        .into();

        let transport_layer = TransportLayer::new(cancel.child_token());
        transport_layer.add_transport(connection.clone());

        let endpoint = EndpointBuilder::new()
            .with_cancel_token(cancel.clone())
            .with_transport_layer(transport_layer)
            .with_user_agent(config.user_agent())
            .build();

        tracing::info!(
            "{} SIP stack listening on {} ({}), registrar {}",
            config.agent_name(),
            local_addr,
            config.transport(),
            registrar
        );

        Ok(Self {
            name: config.agent_name().to_string(),
            endpoint: Arc::new(endpoint),
            connection,
            local_addr,
            registrar,
            cancel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registrar(&self) -> SocketAddr {
        self.registrar
    }
}

impl Drop for SipStack {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn describe(message: &SipMessage) -> String {
    match message {
        SipMessage::Request(r) => format!("{} ({})", r.method, message::summary(&r.headers)),
        SipMessage::Response(r) => format!(
            "{} ({})",
            r.status_code.code(),
            message::summary(&r.headers)
        ),
    }
}

/// One-shot handoff of the negotiated media address
pub struct RemoteMedia(oneshot::Receiver<Result<RtpAddress, SipError>>);

impl RemoteMedia {
    /// Wait for the call to be answered.
    ///
    /// Fails when registration or call setup fails, or when the engine stops first.
    pub async fn wait(self) -> Result<RtpAddress, SipError> {
        self.0.await.unwrap_or(Err(SipError::Aborted))
    }
}

/// Result of one REGISTER exchange, reported by the [`Registrar`] task
type RegistrationOutcome = Result<(), SipError>;

/// Initial REGISTER and its refreshes, run as a task beside the engine.
///
/// Owns the [`SipRequestCreator`], so every REGISTER of the engine shares one
/// Call-ID and gets the next CSeq.
struct Registrar {
    name: String,
    endpoint: EndpointInnerRef,
    connection: SipConnection,
    destination: SipAddr,
    creator: SipRequestCreator,
    refresh: Duration,
}

impl Registrar {
    async fn run(mut self, outcomes: mpsc::Sender<RegistrationOutcome>, cancel: CancellationToken) {
        // First tick is immediate
        let mut refresh = tokio::time::interval(self.refresh);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = async {
                    refresh.tick().await;
                    self.register().await
                } => outcome,
            };

            if outcomes.send(outcome).await.is_err() {
                break;
            }
        }

        tracing::debug!("{} registration task stopped", self.name);
    }

    /// One REGISTER, answering at most one digest challenge
    async fn register(&mut self) -> RegistrationOutcome {
        let request = self.creator.create_register_request()?;
        tracing::info!(
            "{} sending REGISTER (CSeq {})",
            self.name,
            self.creator.last_cseq()
        );
        let response = self.exchange(request).await?;

        let response = match response.status_code.code() {
            401 => {
                let challenge = message::www_authenticate(&response.headers).ok_or_else(|| {
                    SipError::RegistrationFailed("401 without WWW-Authenticate".to_string())
                })?;
                tracing::info!(
                    "{} received 401 for REGISTER, resending with credentials",
                    self.name
                );

                let request = self.creator.create_register_request_with_credentials(challenge)?;
                let response = self.exchange(request).await?;
                if response.status_code.code() == 401 {
                    return Err(SipError::RegistrationFailed(
                        "registrar rejected credentials".to_string(),
                    ));
                }
                response
            }
            _ => response,
        };

        match response.status_code.code() {
            200 => Ok(()),
            other => Err(SipError::RegistrationFailed(format!(
                "registrar answered {}",
                other
            ))),
        }
    }

    /// Send `request` in a client transaction and wait for its final response
    async fn exchange(&self, request: Request) -> Result<Response, SipError> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)
            .map_err(|e| SipError::Stack(e.to_string()))?;
        let mut tx = Transaction::new_client(
            key,
            request,
            self.endpoint.clone(),
            Some(self.connection.clone()),
        );
        tx.destination = Some(self.destination.clone());
        tx.send()
            .await
            .map_err(|e| SipError::Transport(format!("Failed to send REGISTER: {}", e)))?;

        let final_response = tokio::time::timeout(REGISTER_TIMEOUT, async {
            while let Some(message) = tx.receive().await {
                let SipMessage::Response(response) = message else {
                    continue;
                };
                tracing::debug!(
                    "{} <- {} ({})",
                    self.name,
                    response.status_code.code(),
                    message::summary(&response.headers)
                );

                if message::call_id(&response.headers) != Some(self.creator.call_id()) {
                    tracing::debug!("{} response for another Call-ID, ignoring", self.name);
                    continue;
                }
                if response.status_code.code() >= 200 {
                    return Some(response);
                }
            }
            None
        })
        .await;

        match final_response {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(SipError::RegistrationFailed(
                "REGISTER transaction ended without a final response".to_string(),
            )),
            Err(_) => Err(SipError::RegistrationFailed(format!(
                "REGISTER timed out after {} seconds",
                REGISTER_TIMEOUT.as_secs()
            ))),
        }
    }
}

/// Server-side view of the single inbound call
struct Dialog {
    call_id: String,
    to_tag: String,
    /// INVITE server transaction, kept until the stack terminates it
    invite: Option<Transaction>,
    /// ACK received for our final response
    confirmed: bool,
}

/// SIP user agent driving one agent's [`CallState`]
pub struct SipSignalingEngine {
    config: Arc<AgentConfig>,
    stack: SipStack,
    state: Arc<CallState>,
    registrar: Option<Registrar>,
    contact: String,
    ready: Option<oneshot::Sender<Result<RtpAddress, SipError>>>,
    dialog: Option<Dialog>,
}

impl SipSignalingEngine {
    pub fn new(
        config: Arc<AgentConfig>,
        stack: SipStack,
        state: Arc<CallState>,
    ) -> (Self, RemoteMedia) {
        let (ready, remote_media) = oneshot::channel();
        let creator = SipRequestCreator::new(config.clone(), stack.local_addr());
        let contact = creator.contact();

        let mut destination = SipAddr::from(stack.registrar());
        destination.r#type = Some(rsip::transport::Transport::Udp);

        let registrar = Registrar {
            name: config.agent_name().to_string(),
            endpoint: stack.endpoint.inner.clone(),
            connection: stack.connection.clone(),
            destination,
            creator,
            refresh: config.register_refresh_interval(),
        };

        let engine = Self {
            config,
            stack,
            state,
            registrar: Some(registrar),
            contact,
            ready: Some(ready),
            dialog: None,
        };

        (engine, RemoteMedia(remote_media))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.stack.local_addr()
    }

    /// Run until the call state is terminal or `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), SipError> {
        let name = self.config.agent_name().to_string();
        let endpoint = self.stack.endpoint.clone();

        let mut incoming = match endpoint.incoming_transactions() {
            Ok(incoming) => incoming,
            Err(e) => {
                let reason = format!("SIP endpoint unavailable: {}", e);
                self.fail_registration(reason.clone());
                return Err(SipError::Stack(reason));
            }
        };
        let serve = endpoint.serve();
        tokio::pin!(serve);

        let (outcomes, mut registrations) = mpsc::channel(4);
        let registration_token = cancel.child_token();
        let registration = self
            .registrar
            .take()
            .map(|registrar| tokio::spawn(registrar.run(outcomes, registration_token.clone())));

        let mut result = Ok(());

        while !self.state.signaling_state().is_terminal() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("{} SIP engine cancelled", name);
                    break;
                }
                _ = &mut serve => {
                    let reason = "SIP endpoint stopped".to_string();
                    tracing::error!("{} {}", name, reason);
                    self.fail(reason.clone());
                    result = Err(SipError::Transport(reason));
                    break;
                }
                Some(outcome) = registrations.recv() => self.on_registration(outcome),
                received = incoming.recv() => match received {
                    Some(tx) => self.handle_transaction(tx).await,
                    None => {
                        let reason = "SIP transaction stream closed".to_string();
                        tracing::error!("{} {}", name, reason);
                        self.fail(reason.clone());
                        result = Err(SipError::Transport(reason));
                        break;
                    }
                },
                message = invite_message(&mut self.dialog) => self.on_invite_message(message).await,
            }
        }

        registration_token.cancel();
        if let Some(handle) = registration {
            if let Err(e) = handle.await {
                tracing::warn!("{} registration task failed: {}", name, e);
            }
        }
        endpoint.shutdown();

        self.resolve(Err(SipError::Aborted));
        tracing::info!(
            "{} SIP stack stopped in state {}",
            name,
            self.state.signaling_state()
        );
        result
    }

    fn on_registration(&mut self, outcome: RegistrationOutcome) {
        match outcome {
            Ok(()) if self.state.signaling_state().in_call() => {
                tracing::debug!("{} registration refreshed", self.config.agent_name());
            }
            Ok(()) => {
                self.state.transition(SignalingState::Registered);
            }
            Err(SipError::RegistrationFailed(reason)) => self.fail_registration(reason),
            Err(e) => self.fail_registration(e.to_string()),
        }
    }

    async fn handle_transaction(&mut self, tx: Transaction) {
        let name = self.config.agent_name().to_string();
        let method = tx.original.method.clone();
        tracing::debug!(
            "{} <- {} ({})",
            name,
            method,
            message::summary(&tx.original.headers)
        );

        let method_name = method.to_string();
        if !self.config.allowed_methods().iter().any(|m| *m == method_name) {
            tracing::warn!("{} request method {} not allowed, ignoring", name, method_name);
            return;
        }

        match method {
            Method::Invite => self.handle_invite(tx).await,
            Method::Ack => self.handle_ack(&tx.original),
            Method::Bye => self.handle_bye(tx).await,
            Method::Cancel => self.handle_cancel(tx).await,
            _ => tracing::warn!(
                "{} request method {} not supported, ignoring",
                name,
                method_name
            ),
        }
    }

    /// The INVITE transaction hands up the ACK of our final response, a
    /// CANCEL matched to it by the stack, or `None` once it has terminated
    async fn on_invite_message(&mut self, message: Option<SipMessage>) {
        let name = self.config.agent_name().to_string();
        match message {
            Some(SipMessage::Request(request)) if request.method == Method::Ack => {
                self.handle_ack(&request)
            }
            Some(SipMessage::Request(request)) if request.method == Method::Cancel => {
                tracing::info!("{} got CANCEL on the INVITE transaction", name);
                self.cancel_call().await;
            }
            Some(other) => tracing::debug!(
                "{} ignoring {} on the INVITE transaction",
                name,
                describe(&other)
            ),
            None => {
                tracing::debug!("{} INVITE transaction terminated", name);
                if let Some(dialog) = self.dialog.as_mut() {
                    dialog.invite = None;
                }
            }
        }
    }

    async fn handle_invite(&mut self, mut tx: Transaction) {
        let name = self.config.agent_name().to_string();
        let call_id = message::call_id(&tx.original.headers)
            .unwrap_or_default()
            .to_string();

        if let Some(dialog) = &self.dialog {
            tracing::info!(
                "{} already in call {}, ignoring INVITE {}",
                name,
                dialog.call_id,
                call_id
            );
            return;
        }

        let current = self.state.signaling_state();
        if current != SignalingState::Registered {
            tracing::info!("{} INVITE received while {}, ignoring", name, current);
            return;
        }

        tracing::info!("{} incoming call {}", name, call_id);
        let to_tag = format!("{:08x}", rand::random::<u32>());

        if let Err(e) = reply(&name, &mut tx, StatusCode::Ringing, Some(&to_tag)).await {
            self.fail_call(e);
            return;
        }
        self.state.transition(SignalingState::Connecting);

        let offer = String::from_utf8_lossy(&tx.original.body).into_owned();
        let remote = match sdp::parse_remote_media(&offer) {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("{} rejecting INVITE: {}", name, e);
                if let Err(send_err) =
                    reply(&name, &mut tx, StatusCode::BadRequest, Some(&to_tag)).await
                {
                    tracing::warn!("{} failed to send 400: {}", name, send_err);
                }
                self.dialog = Some(Dialog {
                    call_id,
                    to_tag,
                    invite: Some(tx),
                    confirmed: false,
                });
                self.fail_call(e);
                return;
            }
        };

        let mut ok = response_for(&tx.original, StatusCode::OK, Some(&to_tag));
        ok.headers
            .push(Header::Contact(rsip::headers::Contact::new(self.contact.clone())));
        let answer = sdp::build_answer(&self.config, rand::random::<u32>());
        set_body(
            &mut ok.headers,
            &mut ok.body,
            Some(("application/sdp", answer.into_bytes())),
        );

        let sent = send_response(&name, &mut tx, ok).await;
        self.dialog = Some(Dialog {
            call_id,
            to_tag,
            invite: Some(tx),
            confirmed: false,
        });
        if let Err(e) = sent {
            self.fail_call(e);
            return;
        }

        tracing::info!("{} answered call, remote media {}", name, remote);
        if self.state.transition(SignalingState::Connected) {
            self.resolve(Ok(remote));
        } else {
            self.resolve(Err(SipError::CallFailed(
                "call ended while being answered".to_string(),
            )));
        }
    }

    fn handle_ack(&mut self, request: &Request) {
        let name = self.config.agent_name();
        let call_id = message::call_id(&request.headers);

        match self.dialog.as_mut() {
            Some(dialog) if Some(dialog.call_id.as_str()) == call_id => {
                dialog.confirmed = true;
                tracing::info!("{} got ACK, dialog confirmed", name);
            }
            _ => tracing::info!("{} got ACK outside of a dialog", name),
        }
    }

    async fn handle_bye(&mut self, mut tx: Transaction) {
        let name = self.config.agent_name().to_string();
        let call_id = message::call_id(&tx.original.headers)
            .unwrap_or_default()
            .to_string();

        let to_tag = match &self.dialog {
            Some(dialog) if dialog.call_id != call_id => {
                tracing::info!("{} BYE for unknown call {}", name, call_id);
                if let Err(e) =
                    reply(&name, &mut tx, StatusCode::CallTransactionDoesNotExist, None).await
                {
                    tracing::warn!("{} failed to send 481: {}", name, e);
                }
                return;
            }
            Some(dialog) => Some(dialog.to_tag.clone()),
            None => None,
        };

        tracing::info!("{} got BYE, sending OK", name);
        if let Err(e) = reply(&name, &mut tx, StatusCode::OK, to_tag.as_deref()).await {
            tracing::warn!("{} failed to answer BYE: {}", name, e);
        }

        self.state.transition(SignalingState::Disconnected);
        self.resolve(Err(SipError::CallFailed("caller hung up".to_string())));
    }

    async fn handle_cancel(&mut self, mut tx: Transaction) {
        let name = self.config.agent_name().to_string();
        let call_id = message::call_id(&tx.original.headers)
            .unwrap_or_default()
            .to_string();

        let to_tag = match &self.dialog {
            Some(dialog) if dialog.call_id == call_id => dialog.to_tag.clone(),
            _ => {
                tracing::warn!("{} CANCEL without a pending INVITE, treating as stray", name);
                return;
            }
        };

        tracing::info!("{} got CANCEL", name);
        if let Err(e) = reply(&name, &mut tx, StatusCode::OK, Some(&to_tag)).await {
            self.fail_call(e);
            return;
        }
        self.cancel_call().await;
    }

    /// End the pending call with 487, unless the caller already sent its ACK
    async fn cancel_call(&mut self) {
        let name = self.config.agent_name().to_string();
        let Some(dialog) = self.dialog.as_mut() else {
            return;
        };
        if dialog.confirmed {
            tracing::info!("{} dialog already confirmed, CANCEL has no effect", name);
            return;
        }

        let to_tag = dialog.to_tag.clone();
        if let Some(invite) = dialog.invite.as_mut() {
            if let Err(e) = reply(&name, invite, StatusCode::RequestTerminated, Some(&to_tag)).await {
                tracing::warn!("{} failed to send 487: {}", name, e);
            }
        }

        self.state.transition(SignalingState::Disconnected);
        self.resolve(Err(SipError::CallFailed("call cancelled by caller".to_string())));
    }

    /// Hand the readiness result to the orchestrator (first call wins)
    fn resolve(&mut self, result: Result<RtpAddress, SipError>) {
        if let Some(ready) = self.ready.take() {
            if ready.send(result).is_err() {
                tracing::debug!("{} nobody waiting for remote media", self.config.agent_name());
            }
        }
    }

    fn fail(&mut self, reason: String) {
        if self.state.signaling_state().in_call() {
            self.fail_call(SipError::Transport(reason));
        } else {
            self.fail_registration(reason);
        }
    }

    fn fail_registration(&mut self, reason: String) {
        let name = self.config.agent_name();
        if self.state.signaling_state().in_call() {
            // A lapsed refresh does not end an established call
            tracing::warn!("{} registration refresh failed during call: {}", name, reason);
            return;
        }

        tracing::error!("{} registration failed: {}", name, reason);
        self.state.transition(SignalingState::RegistrationFailed);
        self.resolve(Err(SipError::RegistrationFailed(reason)));
    }

    fn fail_call(&mut self, error: SipError) {
        tracing::error!("{} call failed: {}", self.config.agent_name(), error);
        self.state.transition(SignalingState::Disconnected);
        self.resolve(Err(error));
    }
}

/// Next message the INVITE transaction hands up; pending while there is none
async fn invite_message(dialog: &mut Option<Dialog>) -> Option<SipMessage> {
    match dialog.as_mut().and_then(|d| d.invite.as_mut()) {
        Some(tx) => tx.receive().await,
        None => std::future::pending().await,
    }
}

/// Answer on `tx` with a bodiless response carrying the dialog's To-tag
async fn reply(
    name: &str,
    tx: &mut Transaction,
    status_code: StatusCode,
    to_tag: Option<&str>,
) -> Result<(), SipError> {
    let mut response = response_for(&tx.original, status_code, to_tag);
    set_body(&mut response.headers, &mut response.body, None);
    send_response(name, tx, response).await
}

async fn send_response(name: &str, tx: &mut Transaction, response: Response) -> Result<(), SipError> {
    tracing::debug!(
        "{} -> {} ({})",
        name,
        response.status_code.code(),
        message::summary(&response.headers)
    );
    tx.respond(response)
        .await
        .map_err(|e| SipError::Stack(e.to_string()))
}
