use crate::config::SessionConfig;
use crate::error::{CallError, MediaAcquisitionError, NegotiationError};
use crate::link::{LinkEvent, LinkEvents, PeerConnector, PeerLink, RemoteDescription};
use crate::media::MediaSourceProvider;
use crate::observer::{
    CallHandle, CallIntent, CallSnapshot, Command, EndReason, Reply, SessionEvent,
};
use crate::session::{CallPhase, CallSession};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};
use vidlink_protocol::{Envelope, SignalingMessage};
use vidlink_signaling::error::SignalingError;
use vidlink_signaling::gateway::{Invitation, InvitationListener, SignalingGateway};
use vidlink_signaling::transport::SignalingTransport;
use vidlink_webrtc::LocalMedia;

#[cfg(test)]
mod tests;

/// Result of an operation the controller suspended on, tagged with the session it was started for.
enum Completion {
    MediaAcquired {
        epoch: u64,
        result: Result<LocalMedia, MediaAcquisitionError>,
    },
    LinkCreated {
        epoch: u64,
        result: Result<Arc<dyn PeerLink>, NegotiationError>,
    },
    OfferCreated {
        epoch: u64,
        result: Result<String, NegotiationError>,
    },
    /// Remote offer applied and local answer created.
    AnswerCreated {
        epoch: u64,
        result: Result<String, NegotiationError>,
    },
    AnswerApplied {
        epoch: u64,
        result: Result<(), NegotiationError>,
    },
}

impl Completion {
    fn epoch(&self) -> u64 {
        match self {
            Completion::MediaAcquired { epoch, .. }
            | Completion::LinkCreated { epoch, .. }
            | Completion::OfferCreated { epoch, .. }
            | Completion::AnswerCreated { epoch, .. }
            | Completion::AnswerApplied { epoch, .. } => *epoch,
        }
    }
}

/// Owns the call session and drives it through its phases.
///
/// All user intents, inbound envelopes, peer link events and completions of suspended operations
/// are processed one at a time by a single task. Suspended operations run on their own tasks and
/// report back through a channel, their results are discarded if the session they were started for
/// is gone by then.
pub struct CallController<ST: SignalingTransport> {
    config: SessionConfig,
    gateway: SignalingGateway<ST>,
    media: MediaSourceProvider,
    connector: Arc<dyn PeerConnector>,
    session: Option<CallSession>,
    next_epoch: u64,
    invitations: Option<InvitationListener>,
    commands_rx: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    link_events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    link_events_rx: mpsc::UnboundedReceiver<(u64, LinkEvent)>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
    shutdown_token: CancellationToken,
}

impl<ST: SignalingTransport> CallController<ST> {
    /// Starts the controller on the current runtime. The controller stops once `shutdown_token` is
    /// cancelled or every [`CallHandle`] was dropped, tearing down a running call.
    pub fn spawn(
        config: &SessionConfig,
        gateway: SignalingGateway<ST>,
        media: MediaSourceProvider,
        connector: Arc<dyn PeerConnector>,
        shutdown_token: CancellationToken,
    ) -> (CallHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(config.command_channel_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let (events_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();

        let span = tracing::info_span!("call_controller", local_id = %gateway.local_id());
        let controller = Self {
            config: config.clone(),
            invitations: Some(gateway.listen_invitations()),
            gateway,
            media,
            connector,
            session: None,
            next_epoch: 0,
            commands_rx,
            completions_tx,
            completions_rx,
            link_events_tx,
            link_events_rx,
            snapshot_tx,
            events_tx: events_tx.clone(),
            shutdown_token,
        };

        let task = tokio::spawn(controller.run().instrument(span));
        (CallHandle::new(commands_tx, snapshot_rx, events_tx), task)
    }

    async fn run(mut self) {
        tracing::debug!("Call controller started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => {
                    tracing::debug!("Shutdown requested");
                    self.shutdown().await;
                    break;
                }
                command = self.commands_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!("All call handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion).await;
                }
                Some((epoch, event)) = self.link_events_rx.recv() => {
                    self.handle_link_event(epoch, event).await;
                }
                envelope = next_session_envelope(&mut self.session) => {
                    if let Some(envelope) = envelope {
                        self.handle_session_envelope(envelope).await;
                    }
                }
                invitation = next_invitation(&mut self.invitations) => match invitation {
                    Some(invitation) => self.handle_invitation(invitation),
                    None => {
                        tracing::warn!("Signaling client gone, no longer accepting incoming calls");
                        self.invitations = None;
                    }
                },
            }

            self.publish_snapshot();
        }

        self.publish_snapshot();
        tracing::debug!("Call controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        let (reply, result) = match command {
            Command::PlaceCall { target, reply } => (reply, self.place_call(target).await),
            Command::AcceptIncoming { reply } => (reply, self.accept_incoming().await),
            Command::RejectIncoming { reply } => (reply, self.reject_incoming().await),
            Command::HangUp { reply } => (reply, self.hang_up().await),
        };

        // Callers observe the resulting phase as soon as their intent returns.
        self.publish_snapshot();
        send_reply(reply, result);
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn place_call(&mut self, target: String) -> Result<(), CallError> {
        if let Some(session) = &self.session {
            return Err(CallError::InvalidPhase {
                intent: CallIntent::PlaceCall,
                phase: session.phase,
            });
        }

        let remote_party_id = target.trim();
        if remote_party_id.is_empty() {
            return Err(CallError::InvalidPartyId(target));
        }
        if remote_party_id == self.gateway.local_id() {
            return Err(CallError::SelfCall);
        }

        // Listen before ringing, the remote party may answer right away.
        let listener = self.gateway.attach(remote_party_id);
        self.gateway
            .send(remote_party_id, SignalingMessage::CallInitiated)
            .await?;

        let epoch = self.next_epoch();
        let session = CallSession::new(
            epoch,
            remote_party_id.to_string(),
            CallPhase::Outgoing,
            listener,
            self.config.candidate_buffer_limit,
        );
        session.check_invariants();
        tracing::info!(epoch, ?remote_party_id, "Placed call");
        self.session = Some(session);
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn accept_incoming(&mut self) -> Result<(), CallError> {
        let session = self.session_in(CallIntent::AcceptIncoming, CallPhase::Incoming)?;
        session.transition(CallPhase::IncomingAccepted);
        let epoch = session.epoch;
        let remote_party_id = session.remote_party_id.clone();

        if let Err(err) = self
            .gateway
            .send(&remote_party_id, SignalingMessage::CallAccepted)
            .await
        {
            // Without the acceptance the caller never sends an offer.
            tracing::warn!(epoch, ?err, "Failed to send call acceptance");
            self.teardown_silently(EndReason::NegotiationFailed).await;
            return Err(err.into());
        }

        self.start_media_acquisition(epoch);
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn reject_incoming(&mut self) -> Result<(), CallError> {
        let session = self.session_in(CallIntent::RejectIncoming, CallPhase::Incoming)?;
        let epoch = session.epoch;
        let remote_party_id = session.remote_party_id.clone();

        if let Err(err) = self
            .gateway
            .send(&remote_party_id, SignalingMessage::CallRejected)
            .await
        {
            tracing::warn!(epoch, ?err, "Failed to send call rejection");
        }

        self.teardown_silently(EndReason::Rejected).await;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn hang_up(&mut self) -> Result<(), CallError> {
        match self.session.as_ref().map(|session| session.phase) {
            None => {
                tracing::debug!("No call to hang up");
            }
            Some(CallPhase::Incoming) => {
                return Err(CallError::InvalidPhase {
                    intent: CallIntent::HangUp,
                    phase: CallPhase::Incoming,
                });
            }
            Some(CallPhase::Active) => {
                self.teardown_with_notification(EndReason::HungUp).await;
            }
            Some(_) => {
                // Not established yet, the attempt is cancelled locally.
                self.teardown_silently(EndReason::HungUp).await;
            }
        }
        Ok(())
    }

    async fn handle_completion(&mut self, completion: Completion) {
        let epoch = completion.epoch();
        if !self.is_current(epoch) {
            discard_stale(completion);
            return;
        }

        match completion {
            Completion::MediaAcquired {
                result: Ok(media), ..
            } => self.on_media_acquired(media),
            Completion::MediaAcquired {
                result: Err(err), ..
            } => {
                tracing::warn!(epoch, ?err, "Failed to acquire local media");
                self.teardown_silently(EndReason::MediaUnavailable).await;
            }
            Completion::LinkCreated {
                result: Ok(link), ..
            } => self.on_link_created(link),
            Completion::OfferCreated { result: Ok(sdp), .. } => {
                if let Err(err) = self.send_to_remote(SignalingMessage::Offer { sdp }).await {
                    self.fail_negotiation(epoch, err.into()).await;
                }
            }
            Completion::AnswerCreated { result: Ok(sdp), .. } => {
                self.on_remote_description_applied();
                if let Err(err) = self.send_to_remote(SignalingMessage::Answer { sdp }).await {
                    self.fail_negotiation(epoch, err.into()).await;
                }
            }
            Completion::AnswerApplied { result: Ok(()), .. } => {
                self.on_remote_description_applied();
            }
            Completion::LinkCreated {
                result: Err(err), ..
            }
            | Completion::OfferCreated {
                result: Err(err), ..
            }
            | Completion::AnswerCreated {
                result: Err(err), ..
            }
            | Completion::AnswerApplied {
                result: Err(err), ..
            } => self.fail_negotiation(epoch, err).await,
        }
    }

    fn on_media_acquired(&mut self, media: LocalMedia) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let epoch = session.epoch;
        let tracks = media.tracks();
        session.preview = Some(media.preview());
        session.local_media = Some(media);
        tracing::debug!(epoch, "Local media bound, creating peer link");

        let connector = self.connector.clone();
        let events = LinkEvents::new(epoch, self.link_events_tx.clone());
        self.spawn_completion(async move {
            Completion::LinkCreated {
                epoch,
                result: connector.create(&tracks, events).await,
            }
        });
    }

    fn on_link_created(&mut self, link: Arc<dyn PeerLink>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let epoch = session.epoch;
        session.peer_link = Some(link.clone());
        session.check_invariants();

        match session.phase {
            CallPhase::OutgoingAccepted => {
                tracing::debug!(epoch, "Peer link created, creating offer");
                self.spawn_completion(async move {
                    Completion::OfferCreated {
                        epoch,
                        result: link.create_offer().await,
                    }
                });
            }
            CallPhase::IncomingAccepted => match session.pending_offer.take() {
                Some(sdp) => {
                    tracing::debug!(epoch, "Peer link created, applying held offer");
                    session.offer_handled = true;
                    self.negotiate_answer(epoch, link, sdp);
                }
                None => tracing::debug!(epoch, "Peer link created, awaiting offer"),
            },
            phase => tracing::warn!(epoch, %phase, "Peer link created in unexpected phase"),
        }
    }

    fn on_remote_description_applied(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.remote_description_applied = true;
        let candidates = session.candidates.drain();
        if let Some(link) = &session.peer_link {
            tracing::debug!(epoch = session.epoch, buffered = candidates.len(), "Remote description applied");
            apply_candidates(session.epoch, link.clone(), candidates);
        }
    }

    async fn fail_negotiation(&mut self, epoch: u64, err: NegotiationError) {
        tracing::warn!(epoch, ?err, "Negotiation failed");
        self.teardown_silently(EndReason::NegotiationFailed).await;
    }

    async fn handle_session_envelope(&mut self, envelope: Envelope) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if envelope.from != session.remote_party_id {
            tracing::debug!(from = ?envelope.from, remote_party_id = ?session.remote_party_id, "Ignoring envelope from stale sender");
            return;
        }

        let epoch = session.epoch;
        let phase = session.phase;
        let kind = envelope.kind();
        tracing::trace!(epoch, %phase, %kind, "Received session envelope");

        match envelope.message {
            SignalingMessage::CallAccepted if phase == CallPhase::Outgoing => {
                session.transition(CallPhase::OutgoingAccepted);
                self.start_media_acquisition(epoch);
            }
            SignalingMessage::CallRejected if phase == CallPhase::Outgoing => {
                self.teardown_silently(EndReason::RemoteRejected).await;
            }
            SignalingMessage::EndCall => {
                self.teardown_silently(EndReason::RemoteEnded).await;
            }
            SignalingMessage::Offer { sdp } if phase == CallPhase::IncomingAccepted => {
                self.on_remote_offer(sdp);
            }
            SignalingMessage::Answer { sdp } if phase == CallPhase::OutgoingAccepted => {
                self.on_remote_answer(sdp);
            }
            SignalingMessage::IceCandidate { candidate } if phase.is_linked() => {
                self.on_remote_candidate(candidate);
            }
            _ => {
                tracing::debug!(epoch, %phase, %kind, "Ignoring message not valid in current phase");
            }
        }
    }

    fn on_remote_offer(&mut self, sdp: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let epoch = session.epoch;
        if session.offer_handled || session.pending_offer.is_some() {
            tracing::debug!(epoch, "Ignoring duplicate offer");
            return;
        }

        match session.peer_link.clone() {
            Some(link) => {
                session.offer_handled = true;
                self.negotiate_answer(epoch, link, sdp);
            }
            None => {
                tracing::debug!(epoch, "Holding offer until peer link is ready");
                session.pending_offer = Some(sdp);
            }
        }
    }

    fn on_remote_answer(&mut self, sdp: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let epoch = session.epoch;
        if session.answer_handled {
            tracing::debug!(epoch, "Ignoring duplicate answer");
            return;
        }
        let Some(link) = session.peer_link.clone() else {
            tracing::warn!(epoch, "Ignoring answer received before offer was created");
            return;
        };

        session.answer_handled = true;
        self.spawn_completion(async move {
            Completion::AnswerApplied {
                epoch,
                result: link
                    .set_remote_description(RemoteDescription::Answer(sdp))
                    .await,
            }
        });
    }

    fn on_remote_candidate(&mut self, candidate: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match &session.peer_link {
            Some(link) if session.remote_description_applied => {
                apply_candidates(session.epoch, link.clone(), vec![candidate]);
            }
            _ => {
                session.candidates.push(candidate);
                tracing::trace!(epoch = session.epoch, buffered = session.candidates.len(), "Buffered remote ICE candidate");
            }
        }
    }

    async fn handle_link_event(&mut self, epoch: u64, event: LinkEvent) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|session| session.epoch == epoch)
        else {
            tracing::trace!(epoch, ?event, "Ignoring event of stale peer link");
            return;
        };

        match event {
            LinkEvent::Connected if session.phase.is_accepted() => {
                session.transition(CallPhase::Active);
                let remote_party_id = session.remote_party_id.clone();
                tracing::info!(epoch, ?remote_party_id, "Call established");
                self.emit(SessionEvent::Established { remote_party_id });
            }
            LinkEvent::Connected => {
                tracing::debug!(epoch, phase = %session.phase, "Ignoring connected peer link");
            }
            LinkEvent::Terminated(state) => {
                tracing::info!(epoch, ?state, "Peer link lost");
                self.teardown_silently(EndReason::ConnectionLost).await;
            }
            LinkEvent::LocalCandidate(candidate) => {
                if let Err(err) = self
                    .send_to_remote(SignalingMessage::IceCandidate { candidate })
                    .await
                {
                    tracing::warn!(epoch, ?err, "Failed to send local ICE candidate");
                }
            }
            LinkEvent::RemoteTrack(track) => {
                session.remote_tracks.push(track.clone());
                let remote_party_id = session.remote_party_id.clone();
                self.emit(SessionEvent::RemoteTrack {
                    remote_party_id,
                    track,
                });
            }
        }
    }

    fn handle_invitation(&mut self, invitation: Invitation) {
        let from = invitation.sender().to_string();
        if let Some(session) = &self.session {
            tracing::debug!(?from, phase = %session.phase, "Ignoring invitation while in a call");
            return;
        }

        let listener = invitation.into_session();
        let epoch = self.next_epoch();
        let session = CallSession::new(
            epoch,
            from.clone(),
            CallPhase::Incoming,
            listener,
            self.config.candidate_buffer_limit,
        );
        session.check_invariants();
        tracing::info!(epoch, ?from, "Incoming call");
        self.session = Some(session);
        self.emit(SessionEvent::IncomingCall { from });
    }

    async fn shutdown(&mut self) {
        match self.session.as_ref().map(|session| session.phase) {
            Some(CallPhase::Active) => {
                self.teardown_with_notification(EndReason::Shutdown).await;
            }
            Some(_) => self.teardown_silently(EndReason::Shutdown).await,
            None => {}
        }
    }

    /// Ends the session and tells the remote party about it.
    async fn teardown_with_notification(&mut self, reason: EndReason) {
        let Some(session) = self.session.take() else {
            tracing::trace!(?reason, "No session to tear down");
            return;
        };

        if let Err(err) = self
            .gateway
            .send(&session.remote_party_id, SignalingMessage::EndCall)
            .await
        {
            tracing::warn!(epoch = session.epoch, ?err, "Failed to send end of call");
        }
        self.release(session, reason).await;
    }

    /// Ends the session without sending anything to the remote party.
    async fn teardown_silently(&mut self, reason: EndReason) {
        let Some(session) = self.session.take() else {
            tracing::trace!(?reason, "No session to tear down");
            return;
        };
        self.release(session, reason).await;
    }

    async fn release(&self, mut session: CallSession, reason: EndReason) {
        tracing::info!(epoch = session.epoch, remote_party_id = ?session.remote_party_id, phase = %session.phase, ?reason, "Call ended");

        if let Some(link) = session.peer_link.take() {
            link.close().await;
        }
        if let Some(media) = session.local_media.take() {
            media.stop();
        }

        self.emit(SessionEvent::CallEnded {
            remote_party_id: session.remote_party_id,
            reason,
        });
    }

    fn start_media_acquisition(&self, epoch: u64) {
        tracing::debug!(epoch, "Acquiring local media");
        let media = self.media.clone();
        self.spawn_completion(async move {
            Completion::MediaAcquired {
                epoch,
                result: media.acquire().await,
            }
        });
    }

    fn negotiate_answer(&self, epoch: u64, link: Arc<dyn PeerLink>, sdp: String) {
        self.spawn_completion(async move {
            let result: Result<String, NegotiationError> = async {
                link.set_remote_description(RemoteDescription::Offer(sdp))
                    .await?;
                link.create_answer().await
            }
            .await;
            Completion::AnswerCreated { epoch, result }
        });
    }

    fn spawn_completion<F>(&self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions_tx = self.completions_tx.clone();
        tokio::spawn(
            async move {
                let completion = task.await;
                if completions_tx.send(completion).is_err() {
                    tracing::trace!("Call controller gone, dropping completion");
                }
            }
            .in_current_span(),
        );
    }

    async fn send_to_remote(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        self.gateway.send(&session.remote_party_id, message).await
    }

    fn session_in(
        &mut self,
        intent: CallIntent,
        phase: CallPhase,
    ) -> Result<&mut CallSession, CallError> {
        match self.session.as_mut() {
            Some(session) if session.phase == phase => Ok(session),
            session => Err(CallError::InvalidPhase {
                intent,
                phase: session.map_or(CallPhase::Idle, |session| session.phase),
            }),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.epoch == epoch)
    }

    fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn emit(&self, event: SessionEvent) {
        if self.events_tx.send(event).is_err() {
            tracing::trace!("No session observers subscribed");
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = self
            .session
            .as_ref()
            .map(CallSession::snapshot)
            .unwrap_or_default();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

async fn next_session_envelope(session: &mut Option<CallSession>) -> Option<Envelope> {
    match session {
        Some(session) => session.listener.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_invitation(invitations: &mut Option<InvitationListener>) -> Option<Invitation> {
    match invitations {
        Some(invitations) => invitations.recv().await,
        None => std::future::pending().await,
    }
}

fn send_reply(reply: Reply, result: Result<(), CallError>) {
    if reply.send(result).is_err() {
        tracing::trace!("Caller stopped waiting for the result");
    }
}

/// Applies remote candidates in order. Failures never affect the call.
fn apply_candidates(epoch: u64, link: Arc<dyn PeerLink>, candidates: Vec<String>) {
    if candidates.is_empty() {
        return;
    }
    tokio::spawn(
        async move {
            for candidate in candidates {
                if let Err(err) = link.add_ice_candidate(&candidate).await {
                    tracing::warn!(epoch, ?err, "Failed to apply remote ICE candidate");
                }
            }
        }
        .in_current_span(),
    );
}

fn discard_stale(completion: Completion) {
    let epoch = completion.epoch();
    match completion {
        Completion::MediaAcquired {
            result: Ok(media), ..
        } => {
            tracing::debug!(epoch, "Discarding local media of ended session");
            media.stop();
        }
        Completion::LinkCreated {
            result: Ok(link), ..
        } => {
            tracing::debug!(epoch, "Closing peer link of ended session");
            tokio::spawn(async move { link.close().await }.in_current_span());
        }
        _ => tracing::trace!(epoch, "Discarding completion of ended session"),
    }
}
