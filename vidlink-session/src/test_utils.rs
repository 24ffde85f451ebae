use crate::error::{CandidateApplicationError, NegotiationError};
use crate::link::{LinkEvents, LinkState, PeerConnector, PeerLink, RemoteDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use vidlink_webrtc::{
    CaptureDevice, CaptureError, CaptureFeed, CaptureStreams, ChannelCaptureDevice, LocalTracks,
    RemoteTrackInfo,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    CreateOffer,
    CreateAnswer,
    SetRemote(RemoteDescription),
    AddCandidate(String),
    Close,
}

/// [`PeerLink`] recording every call made to it. Connection state changes are driven by the test.
pub struct MockLink {
    id: usize,
    tracks: LocalTracks,
    events: LinkEvents,
    calls: Mutex<Vec<LinkCall>>,
    closed: AtomicBool,
    fail_negotiation: AtomicBool,
    rejected_candidates: Mutex<Vec<String>>,
}

impl MockLink {
    fn new(id: usize, tracks: LocalTracks, events: LinkEvents) -> Self {
        Self {
            id,
            tracks,
            events,
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_negotiation: AtomicBool::new(false),
            rejected_candidates: Mutex::new(Vec::new()),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.events.epoch()
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn tracks_stopped(&self) -> bool {
        self.tracks.is_stopped()
    }

    /// Makes every following offer/answer creation fail.
    pub fn fail_negotiation(&self) {
        self.fail_negotiation.store(true, Ordering::SeqCst);
    }

    /// Makes applying `candidate` fail. The call is still recorded.
    pub fn reject_candidate(&self, candidate: &str) {
        self.rejected_candidates.lock().push(candidate.to_string());
    }

    pub fn emit_state(&self, state: LinkState) {
        self.events.state(state);
    }

    pub fn emit_local_candidate(&self, candidate: &str) {
        self.events.local_candidate(candidate.to_string());
    }

    pub fn emit_remote_track(&self, info: RemoteTrackInfo) {
        self.events.remote_track(info);
    }

    /// Waits until `predicate` holds for the recorded calls.
    pub async fn wait_for_calls<F>(&self, timeout: Duration, predicate: F) -> anyhow::Result<()>
    where
        F: Fn(&[LinkCall]) -> bool,
    {
        tokio::time::timeout(timeout, async {
            while !predicate(&self.calls.lock()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("Timeout, recorded calls: {:?}", self.calls()))
    }

    fn record(&self, call: LinkCall) {
        self.calls.lock().push(call);
    }

    fn check_negotiable(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::LinkClosed);
        }
        if self.fail_negotiation.load(Ordering::SeqCst) {
            return Err(NegotiationError::InvalidState("forced failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        self.record(LinkCall::CreateOffer);
        self.check_negotiable()?;
        Ok(format!("offer-{}", self.id))
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        self.record(LinkCall::CreateAnswer);
        self.check_negotiable()?;
        let has_offer = self
            .calls
            .lock()
            .iter()
            .any(|call| matches!(call, LinkCall::SetRemote(RemoteDescription::Offer(_))));
        if !has_offer {
            return Err(NegotiationError::InvalidState(
                "no remote offer".to_string(),
            ));
        }
        Ok(format!("answer-{}", self.id))
    }

    async fn set_remote_description(
        &self,
        description: RemoteDescription,
    ) -> Result<(), NegotiationError> {
        self.record(LinkCall::SetRemote(description));
        if self.is_closed() {
            return Err(NegotiationError::LinkClosed);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), CandidateApplicationError> {
        self.record(LinkCall::AddCandidate(candidate.to_string()));
        if self.is_closed() {
            return Err(CandidateApplicationError("link closed".to_string()));
        }
        if self
            .rejected_candidates
            .lock()
            .iter()
            .any(|rejected| rejected == candidate)
        {
            return Err(CandidateApplicationError(format!(
                "malformed candidate {candidate}"
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        self.record(LinkCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        self.tracks.stop();
    }
}

/// [`PeerConnector`] handing out [`MockLink`]s.
pub struct MockConnector {
    links: Mutex<Vec<Arc<MockLink>>>,
    created_tx: watch::Sender<usize>,
    fail: AtomicBool,
    fail_next_negotiation: AtomicBool,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(Vec::new()),
            created_tx: watch::Sender::new(0),
            fail: AtomicBool::new(false),
            fail_next_negotiation: AtomicBool::new(false),
        }
    }

    /// Makes every following link creation fail.
    pub fn fail_create(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Makes offer/answer creation fail on the next link handed out.
    pub fn fail_next_negotiation(&self) {
        self.fail_next_negotiation.store(true, Ordering::SeqCst);
    }

    pub fn link_count(&self) -> usize {
        *self.created_tx.borrow()
    }

    /// Waits for the link with `index` (in creation order) to be created.
    pub async fn wait_for_link(
        &self,
        index: usize,
        timeout: Duration,
    ) -> anyhow::Result<Arc<MockLink>> {
        let mut created_rx = self.created_tx.subscribe();
        tokio::time::timeout(timeout, created_rx.wait_for(|count| *count > index))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout waiting for link {index}"))??;
        self.links
            .lock()
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Link {index} missing"))
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn create(
        &self,
        local_media: &LocalTracks,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NegotiationError::InvalidState(
                "link creation failed".to_string(),
            ));
        }

        let link = {
            let mut links = self.links.lock();
            let link = Arc::new(MockLink::new(links.len(), local_media.clone(), events));
            if self.fail_next_negotiation.swap(false, Ordering::SeqCst) {
                link.fail_negotiation();
            }
            links.push(link.clone());
            link
        };
        self.created_tx.send_modify(|count| *count += 1);
        Ok(link)
    }
}

/// [`CaptureDevice`] holding every capture request until the gate is opened.
pub struct GatedCaptureDevice {
    inner: ChannelCaptureDevice,
    gate_tx: watch::Sender<bool>,
    requests: AtomicUsize,
}

impl GatedCaptureDevice {
    pub fn new(open: bool) -> (Arc<Self>, CaptureFeed) {
        let (inner, feed) = ChannelCaptureDevice::new(8);
        let device = Arc::new(Self {
            inner,
            gate_tx: watch::Sender::new(open),
            requests: AtomicUsize::new(0),
        });
        (device, feed)
    }

    pub fn open(&self) {
        self.gate_tx.send_replace(true);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for GatedCaptureDevice {
    async fn request_capture(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<CaptureStreams, CaptureError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut gate_rx = self.gate_tx.subscribe();
        gate_rx
            .wait_for(|open| *open)
            .await
            .map_err(|err| anyhow::anyhow!(err))?;
        self.inner.request_capture(audio, video).await
    }
}
